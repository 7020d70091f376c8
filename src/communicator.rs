//! Per-rank handles to a group.
//!
//! Every task of a cohort receives one [`Communicator`] for the world group and
//! one for each subgroup it belongs to. The collectives are implemented in
//! their own modules as inherent methods:
//!
//! - [`Communicator::barrier`]
//! - [`Communicator::broadcast`]
//! - [`Communicator::scatter`]
//! - [`Communicator::gather`]
//!
//! All members of a group must call the same collectives in the same order.
//! Every wait inside a collective also watches the cohort's cancel signal, so
//! once the cohort is canceled each blocked or later collective returns
//! [`Canceled`].

use std::{cell::Cell, convert::Infallible, sync::Arc};

use ahash::HashMap;
use crossbeam::{
    channel::{Receiver, Sender},
    select,
};

use crate::{
    broker::{BrokerHandle, Reply, Request},
    group::{GroupContext, OpKind, Slot},
    signal::{CancelSignal, Canceled, Signal},
};

/// Subgroup communicators of one task, keyed by group id.
pub type Subgroups<T> = HashMap<String, Communicator<T>>;

/// The handle of one rank in one group.
///
/// A communicator is owned by the thread of its rank. It can be moved but not
/// shared, since the per-op step counters are plain cells.
pub struct Communicator<T> {
    pub(crate) group: Arc<GroupContext<T>>,
    pub(crate) rank: usize,
    pub(crate) mailbox: Receiver<Arc<Signal>>,
    cancel: Arc<CancelSignal>,
    broker: BrokerHandle<T>,
    reply: Sender<Reply<T>>,
    incoming: Receiver<Reply<T>>,
    steps: [Cell<u64>; OpKind::COUNT],
    sequence: Cell<u64>,
    verify: bool,
}

impl<T> Communicator<T> {
    pub(crate) fn new(
        group: Arc<GroupContext<T>>,
        rank: usize,
        mailbox: Receiver<Arc<Signal>>,
        cancel: Arc<CancelSignal>,
        broker: BrokerHandle<T>,
        verify: bool,
    ) -> Self {
        let (reply, incoming) = crossbeam::channel::bounded(1);
        Self {
            group,
            rank,
            mailbox,
            cancel,
            broker,
            reply,
            incoming,
            steps: Default::default(),
            sequence: Cell::new(0),
            verify,
        }
    }

    /// Local rank of this task in the group.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub fn group_id(&self) -> &str {
        self.group.id()
    }

    /// World rank of this task.
    pub fn world_rank(&self) -> usize {
        self.group.world_ranks()[self.rank]
    }

    /// World ranks of the group members, indexed by local rank.
    pub fn world_ranks(&self) -> &[usize] {
        self.group.world_ranks()
    }

    /// Becomes ready once the cohort is canceled.
    ///
    /// Use it as an arm of [`crossbeam::select!`] to make custom waits
    /// cancel-aware, or to race a timeout against cancellation.
    pub fn quit_observe(&self) -> &Receiver<Infallible> {
        self.cancel.observe()
    }

    pub fn is_quit(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Cancels the whole cohort.
    pub fn quit(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn check_quit(&self) -> Result<(), Canceled> {
        if self.is_quit() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_root(&self, root: usize, op: OpKind) {
        assert!(
            root < self.size(),
            "{op} root {root} out of range for group {} of size {}",
            self.group_id(),
            self.size(),
        );
    }

    /// Advances the counters for `op` and returns the step and sequence
    /// numbers of the call that is starting.
    ///
    /// Counters advance for every call, canceled or not, so that all ranks
    /// keep numbering steps identically.
    fn begin(&self, op: OpKind) -> (u64, Option<u64>) {
        let counter = &self.steps[op.index()];
        let step = counter.get();
        counter.set(step + 1);

        let sequence = self.verify.then(|| {
            let sequence = self.sequence.get();
            self.sequence.set(sequence + 1);
            sequence
        });
        (step, sequence)
    }

    /// Starts a broker-mediated collective.
    ///
    /// Returns `Ok(None)` for single-member groups, which never need the
    /// broker, and otherwise the slot of this step.
    pub(crate) fn request_slot(&self, op: OpKind) -> Result<Option<Slot<T>>, Canceled> {
        let (step, sequence) = self.begin(op);
        self.check_quit()?;
        if self.size() <= 1 {
            return Ok(None);
        }

        let request = Request {
            group: self.group.clone(),
            rank: self.rank,
            step,
            sequence,
            reply: self.reply.clone(),
        };
        self.send_or_cancel(self.broker.sender(op), request)?;

        match self.recv_or_cancel(&self.incoming)? {
            Reply::Slot(slot) => {
                debug_assert_eq!(slot.kind(), op);
                Ok(Some(slot))
            }
            Reply::Mismatch { expected, sequence } => panic!(
                "collective order mismatch in group {}: rank {} called {op} as collective #{sequence} where another rank called {expected}",
                self.group_id(),
                self.rank,
            ),
        }
    }

    pub(crate) fn send_or_cancel<M>(&self, sender: &Sender<M>, message: M) -> Result<(), Canceled> {
        select! {
            send(sender, message) -> result => result.map_err(|_| Canceled),
            recv(self.cancel.observe()) -> _ => Err(Canceled),
        }
    }

    pub(crate) fn recv_or_cancel<M>(&self, receiver: &Receiver<M>) -> Result<M, Canceled> {
        select! {
            recv(receiver) -> message => message.map_err(|_| Canceled),
            recv(self.cancel.observe()) -> _ => Err(Canceled),
        }
    }

    pub(crate) fn wait_or_cancel(&self, signal: &Signal) -> Result<(), Canceled> {
        select! {
            recv(signal.observe()) -> _ => Ok(()),
            recv(self.cancel.observe()) -> _ => Err(Canceled),
        }
    }
}

impl<T> std::fmt::Debug for Communicator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("group", &self.group_id())
            .field("rank", &self.rank)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}
