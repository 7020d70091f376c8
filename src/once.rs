//! Run an action at most once.

use std::{
    convert::Infallible,
    panic::{self, AssertUnwindSafe},
};

use crossbeam::channel::Receiver;
use parking_lot::Mutex;

use crate::{signal::Signal, utils::panic_message};

#[derive(Debug)]
enum GateState {
    Pending,
    Done,
    Panicked(String),
}

/// Executes an action at most once.
///
/// The first caller of [`OnceGate::call`] runs the action while every other
/// caller blocks. Once it finishes, later callers return immediately without
/// running anything. If the action panicked, the first caller resumes that
/// panic and every later caller panics with the same message.
///
/// Only the first caller sees the original payload. Later callers get a
/// `String` payload holding its text, so a payload raised with
/// [`std::panic::panic_any`] that is neither a `&str` nor a `String` cannot be
/// downcast by them and reads as `Box<dyn Any>`.
///
/// The action must not call back into the same gate; the gate is not
/// reentrant.
#[derive(Debug)]
pub struct OnceGate {
    state: Mutex<GateState>,
    done: Signal,
}

impl Default for OnceGate {
    fn default() -> Self {
        Self::new()
    }
}

impl OnceGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending),
            done: Signal::new(),
        }
    }

    pub fn call<F: FnOnce()>(&self, action: F) {
        let mut state = self.state.lock();
        match &*state {
            GateState::Pending => {}
            GateState::Done => return,
            GateState::Panicked(message) => {
                let message = message.clone();
                drop(state);
                panic!("{message}");
            }
        }

        match panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(()) => {
                *state = GateState::Done;
                drop(state);
                self.done.close();
            }
            Err(payload) => {
                *state = GateState::Panicked(panic_message(payload.as_ref()));
                drop(state);
                self.done.close();
                panic::resume_unwind(payload);
            }
        }
    }

    /// Becomes ready when the first call has terminated, normally or not.
    pub fn done(&self) -> &Receiver<Infallible> {
        self.done.observe()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_closed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn runs_once_across_threads() -> Result<()> {
        init_logger();

        let gate = Arc::new(OnceGate::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let runs = runs.clone();
                thread::spawn(move || {
                    gate.call(|| {
                        thread::sleep(Duration::from_millis(5));
                        runs.fetch_add(1, Ordering::SeqCst);
                    });
                    // Every caller returns only after the action finished.
                    runs.load(Ordering::SeqCst)
                })
            })
            .collect();

        for caller in callers {
            assert_eq!(caller.join().unwrap(), 1);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(gate.is_done());
        Ok(())
    }

    #[test]
    fn panic_is_replayed_to_later_callers() {
        let gate = OnceGate::new();

        let first = panic::catch_unwind(AssertUnwindSafe(|| gate.call(|| panic!("launch failed"))))
            .unwrap_err();
        assert_eq!(panic_message(first.as_ref()), "launch failed");
        assert!(gate.is_done());

        let mut reran = false;
        let second = panic::catch_unwind(AssertUnwindSafe(|| gate.call(|| reran = true)))
            .unwrap_err();
        assert_eq!(panic_message(second.as_ref()), "launch failed");
        assert!(!reran);
    }

    #[test]
    fn done_fires_after_first_call() {
        let gate = Arc::new(OnceGate::new());
        assert!(!gate.is_done());

        let observer = {
            let gate = gate.clone();
            thread::spawn(move || {
                let _ = gate.done().recv();
                gate.is_done()
            })
        };

        gate.call(|| {});
        assert!(observer.join().unwrap());
    }
}
