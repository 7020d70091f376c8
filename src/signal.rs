//! One-shot broadcast signals.
//!
//! A [`Signal`] is a notification that is closed at most once and observed by
//! any number of threads. Observers either poll it with
//! [`Signal::is_closed`] or wait on [`Signal::observe`], whose receiver becomes
//! ready, and stays ready, once the signal is closed. Because the observer is
//! a plain [`crossbeam::channel::Receiver`], it composes with other channels in
//! a [`crossbeam::select!`]:
//!
//! ```
//! use cohort::signal::CancelSignal;
//! use crossbeam::{channel, select};
//!
//! let cancel = CancelSignal::new();
//! let (sender, receiver) = channel::bounded::<u32>(1);
//!
//! cancel.cancel();
//! select! {
//!     recv(receiver) -> _ => unreachable!(),
//!     recv(cancel.observe()) -> _ => assert!(cancel.is_canceled()),
//! }
//! # drop(sender);
//! ```

use std::convert::Infallible;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

/// Returned by a collective that gave up because the cohort was canceled.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cohort canceled")]
pub struct Canceled;

/// A close-once notification.
///
/// The signal owns the only sender of a zero-capacity channel that never
/// carries a message. Closing drops that sender, which disconnects the channel
/// and wakes every receiver at once.
#[derive(Debug)]
pub struct Signal {
    sender: Mutex<Option<Sender<Infallible>>>,
    receiver: Receiver<Infallible>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam::channel::bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Closes the signal.
    ///
    /// Returns `true` if this call closed it and `false` if it was already
    /// closed.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    /// Returns a receiver that becomes ready once the signal is closed.
    ///
    /// Receiving from it blocks until then and returns an error afterwards; it
    /// never yields a value.
    pub fn observe(&self) -> &Receiver<Infallible> {
        &self.receiver
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Blocks until the signal is closed.
    pub fn wait(&self) {
        // Only ever returns `Err` because nothing is sent on the channel.
        let _ = self.receiver.recv();
    }
}

/// The cohort-wide quit event.
#[derive(Debug, Default)]
pub struct CancelSignal(Signal);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Signal::new())
    }

    /// Cancels. Idempotent and callable from any thread.
    pub fn cancel(&self) -> bool {
        let closed = self.0.close();
        if closed {
            tracing::debug!("cohort canceled");
        }
        closed
    }

    pub fn observe(&self) -> &Receiver<Infallible> {
        self.0.observe()
    }

    pub fn is_canceled(&self) -> bool {
        self.0.is_closed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::*;
    use crossbeam::select;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn close_is_idempotent() {
        let signal = Signal::new();
        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(signal.is_closed());
        assert!(!signal.close());
        assert!(signal.is_closed());
    }

    #[test]
    fn close_wakes_every_observer() -> Result<()> {
        init_logger();

        let signal = Arc::new(Signal::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                thread::spawn(move || {
                    signal.wait();
                    signal.is_closed()
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        signal.close();

        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        Ok(())
    }

    #[test]
    fn cancel_wins_a_select_against_an_idle_channel() {
        let cancel = Arc::new(CancelSignal::new());
        let (_sender, receiver) = crossbeam::channel::bounded::<()>(1);

        let canceler = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                cancel.cancel()
            })
        };

        let canceled = select! {
            recv(receiver) -> _ => false,
            recv(cancel.observe()) -> _ => true,
        };
        assert!(canceled);
        assert!(canceler.join().unwrap());
        assert!(!cancel.cancel());
        assert!(cancel.is_canceled());
    }
}
