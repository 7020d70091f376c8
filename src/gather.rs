//! Gather collects one value from every rank at the root.

use crate::{
    communicator::Communicator,
    group::{OpKind, Slot},
    signal::Canceled,
};

impl<T> Communicator<T> {
    /// Collects the `message` of every member at rank `root`.
    ///
    /// The root receives `Some(list)` where `list[r]` is the message of local
    /// rank `r`; every other rank receives `None`.
    ///
    /// # Panics
    /// Panics if `root` is not a rank of this group.
    #[tracing::instrument(level = "trace", skip_all, fields(group = self.group_id(), rank = self.rank, root = root))]
    pub fn gather(&self, root: usize, message: T) -> Result<Option<Vec<T>>, Canceled> {
        self.check_root(root, OpKind::Gather);

        let Some(slot) = self.request_slot(OpKind::Gather)? else {
            return Ok(Some(vec![message]));
        };
        let Slot::Gather { sender, receiver } = slot else {
            unreachable!("broker answered a gather with another kind of slot");
        };

        if self.rank != root {
            self.send_or_cancel(&sender, (message, self.rank))?;
            return Ok(None);
        }

        let mut list: Vec<Option<T>> = (0..self.size()).map(|_| None).collect();
        list[root] = Some(message);
        for _ in 1..self.size() {
            let (message, rank) = self.recv_or_cancel(&receiver)?;
            list[rank] = Some(message);
        }
        Ok(Some(list.into_iter().flatten().collect()))
    }
}
