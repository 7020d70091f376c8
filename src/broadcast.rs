//! Broadcast sends a value from one rank to every member of a group.
//!
//! The broker gives every participant of a broadcast step the same channel,
//! buffered to one message per receiver. The root pushes one copy per
//! receiver and returns without waiting for them to be consumed, so a root
//! that needs to know that everyone has received the value must follow up
//! with a [`barrier`](Communicator::barrier).
//!
//! # Example
//! ```
//! use cohort::Controller;
//!
//! let controller = Controller::<String>::builder()
//!     .size(3)
//!     .task(|world, _| {
//!         let greeting = if world.rank() == 1 { "hello".to_owned() } else { String::new() };
//!         let greeting = world.broadcast(1, greeting).unwrap();
//!         assert_eq!(greeting, "hello");
//!     })
//!     .build()?;
//! assert_eq!(controller.run(), 0);
//! # Ok::<(), cohort::ConfigError>(())
//! ```

use crate::{
    communicator::Communicator,
    group::{OpKind, Slot},
    signal::Canceled,
};

impl<T: Clone> Communicator<T> {
    /// Distributes `message` of rank `root` to every member of the group.
    ///
    /// The root gets its own `message` back; every other rank gets a clone of
    /// the root's. The `message` argument of non-root ranks is ignored.
    ///
    /// # Panics
    /// Panics if `root` is not a rank of this group.
    #[tracing::instrument(level = "trace", skip_all, fields(group = self.group_id(), rank = self.rank, root = root))]
    pub fn broadcast(&self, root: usize, message: T) -> Result<T, Canceled> {
        self.check_root(root, OpKind::Broadcast);

        let Some(slot) = self.request_slot(OpKind::Broadcast)? else {
            return Ok(message);
        };
        let Slot::Broadcast { sender, receiver } = slot else {
            unreachable!("broker answered a broadcast with another kind of slot");
        };

        if self.rank == root {
            for _ in 1..self.size() {
                self.send_or_cancel(&sender, message.clone())?;
            }
            Ok(message)
        } else {
            self.recv_or_cancel(&receiver)
        }
    }
}
