//! Barriers synchronize all members of a group.
//!
//! The barrier is a ring pass. Rank 0 allocates a fresh [`Signal`] and hands
//! it to rank 1 through rank 1's mailbox; every rank forwards it to its
//! successor after it has arrived, and the last rank closes it, which releases
//! all members at once. Each rank owns a single one-slot mailbox and no
//! central coordinator is involved. Latency grows linearly with the group
//! size.
//!
//! # Example
//! ```
//! use cohort::Controller;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! static ARRIVED: AtomicUsize = AtomicUsize::new(0);
//!
//! let controller = Controller::<()>::builder()
//!     .size(4)
//!     .task(|world, _| {
//!         ARRIVED.fetch_add(1, Ordering::SeqCst);
//!         world.barrier().unwrap();
//!         assert_eq!(ARRIVED.load(Ordering::SeqCst), 4);
//!     })
//!     .build()?;
//! assert_eq!(controller.run(), 0);
//! # Ok::<(), cohort::ConfigError>(())
//! ```

use std::sync::Arc;

use crate::{
    communicator::Communicator,
    signal::{Canceled, Signal},
};

impl<T> Communicator<T> {
    /// Blocks until every member of the group has called `barrier`.
    ///
    /// Returns [`Canceled`] if the cohort was canceled before the barrier was
    /// released.
    #[tracing::instrument(level = "trace", skip_all, fields(group = self.group_id(), rank = self.rank))]
    pub fn barrier(&self) -> Result<(), Canceled> {
        self.check_quit()?;

        let size = self.size();
        if size <= 1 {
            return Ok(());
        }

        let signal = if self.rank == 0 {
            let signal = Arc::new(Signal::new());
            self.send_or_cancel(self.group.mailbox(1), signal.clone())?;
            signal
        } else {
            let signal = self.recv_or_cancel(&self.mailbox)?;
            if self.rank + 1 < size {
                self.send_or_cancel(self.group.mailbox(self.rank + 1), signal.clone())?;
            } else {
                signal.close();
                tracing::trace!("barrier released");
                return Ok(());
            }
            signal
        };

        self.wait_or_cancel(&signal)
    }
}
