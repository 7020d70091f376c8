use std::{fmt, sync::Arc};

use ahash::HashSet;
use crossbeam::channel::{Receiver, Sender};
use dashmap::DashMap;

use crate::{controller::ConfigError, signal::Signal};

/// Reserved identifier of the group that contains every rank of the cohort.
pub const WORLD: &str = "_world";

/// Returns true if `id` matches `[A-Za-z0-9][A-Za-z0-9_]*`.
pub fn is_valid_group_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// The collectives that are served by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Broadcast,
    Scatter,
    Gather,
}

impl OpKind {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        match self {
            OpKind::Broadcast => 0,
            OpKind::Scatter => 1,
            OpKind::Gather => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Broadcast => "broadcast",
            OpKind::Scatter => "scatter",
            OpKind::Gather => "gather",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One single-slot channel of a scatter step, owned by one non-root position.
pub struct Lane<T> {
    pub sender: Sender<Vec<T>>,
    pub receiver: Receiver<Vec<T>>,
}

/// The channels shared by all participants of one collective step.
pub enum Slot<T> {
    Broadcast {
        sender: Sender<T>,
        receiver: Receiver<T>,
    },
    Scatter(Arc<[Lane<T>]>),
    Gather {
        sender: Sender<(T, usize)>,
        receiver: Receiver<(T, usize)>,
    },
}

// Channel handles are clonable for any payload, so `derive` would be too strict.
impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        match self {
            Slot::Broadcast { sender, receiver } => Slot::Broadcast {
                sender: sender.clone(),
                receiver: receiver.clone(),
            },
            Slot::Scatter(lanes) => Slot::Scatter(lanes.clone()),
            Slot::Gather { sender, receiver } => Slot::Gather {
                sender: sender.clone(),
                receiver: receiver.clone(),
            },
        }
    }
}

impl<T> Slot<T> {
    /// Allocates the channels for one step of `op` in a group of `size` ranks.
    ///
    /// `size` must be at least 2; smaller groups never reach the broker.
    fn allocate(op: OpKind, size: usize) -> Self {
        let peers = size - 1;
        match op {
            OpKind::Broadcast => {
                let (sender, receiver) = crossbeam::channel::bounded(peers);
                Slot::Broadcast { sender, receiver }
            }
            OpKind::Scatter => Slot::Scatter(
                (0..peers)
                    .map(|_| {
                        let (sender, receiver) = crossbeam::channel::bounded(1);
                        Lane { sender, receiver }
                    })
                    .collect(),
            ),
            OpKind::Gather => {
                let (sender, receiver) = crossbeam::channel::bounded(peers);
                Slot::Gather { sender, receiver }
            }
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Slot::Broadcast { .. } => OpKind::Broadcast,
            Slot::Scatter(_) => OpKind::Scatter,
            Slot::Gather { .. } => OpKind::Gather,
        }
    }
}

struct StepSlot<T> {
    slot: Slot<T>,
    remaining: usize,
}

struct SequenceEntry {
    op: OpKind,
    remaining: usize,
}

/// Shared state of one group: its members, barrier mailboxes and the broker's
/// step tables.
///
/// The step tables are only written by the broker thread. They are kept in
/// concurrent maps so that diagnostics can inspect them from other threads.
pub struct GroupContext<T> {
    id: String,
    world_ranks: Vec<usize>,
    mailboxes: Vec<Sender<Arc<Signal>>>,
    steps: [DashMap<u64, StepSlot<T>>; OpKind::COUNT],
    sequence: DashMap<u64, SequenceEntry>,
}

/// The receiving ends of a group's barrier mailboxes, indexed by local rank.
pub type Mailboxes = Vec<Receiver<Arc<Signal>>>;

impl<T> GroupContext<T> {
    /// Creates the group containing every rank of a cohort of `size` ranks.
    pub fn world(size: usize) -> (Self, Mailboxes) {
        Self::with_ranks(WORLD.to_owned(), (0..size).collect())
    }

    /// Creates a user-defined group.
    ///
    /// Duplicate ranks are removed, keeping the first occurrence, so the
    /// position of a world rank in `ranks` after deduplication is its local
    /// rank in the group.
    pub fn subgroup(
        id: &str,
        ranks: impl IntoIterator<Item = usize>,
        world_size: usize,
    ) -> Result<(Self, Mailboxes), ConfigError> {
        if !is_valid_group_id(id) {
            return Err(ConfigError::InvalidGroupId(id.to_owned()));
        }

        let mut seen = HashSet::default();
        let mut world_ranks = Vec::new();
        for rank in ranks {
            if rank >= world_size {
                return Err(ConfigError::RankOutOfRange {
                    group: id.to_owned(),
                    rank,
                    size: world_size,
                });
            }
            if seen.insert(rank) {
                world_ranks.push(rank);
            }
        }

        if world_ranks.is_empty() {
            return Err(ConfigError::EmptyGroup(id.to_owned()));
        }

        Ok(Self::with_ranks(id.to_owned(), world_ranks))
    }

    fn with_ranks(id: String, world_ranks: Vec<usize>) -> (Self, Mailboxes) {
        let (mailboxes, receivers): (Vec<_>, Mailboxes) = world_ranks
            .iter()
            .map(|_| crossbeam::channel::bounded(1))
            .unzip();

        let group = Self {
            id,
            world_ranks,
            mailboxes,
            steps: Default::default(),
            sequence: DashMap::new(),
        };
        (group, receivers)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> usize {
        self.world_ranks.len()
    }

    /// World ranks of the members, indexed by local rank.
    pub fn world_ranks(&self) -> &[usize] {
        &self.world_ranks
    }

    pub fn mailbox(&self, rank: usize) -> &Sender<Arc<Signal>> {
        &self.mailboxes[rank]
    }

    /// Hands out the slot for `step` of `op`, allocating it for the first
    /// participant and dropping it once every member has claimed it.
    pub fn claim_step(&self, op: OpKind, step: u64) -> Slot<T> {
        let table = &self.steps[op.index()];
        let size = self.size();

        let mut entry = table.entry(step).or_insert_with(|| {
            tracing::trace!(group = %self.id, %op, step, "allocate step slot");
            StepSlot {
                slot: Slot::allocate(op, size),
                remaining: size,
            }
        });
        entry.remaining -= 1;
        let slot = entry.slot.clone();
        let drained = entry.remaining == 0;
        drop(entry);

        if drained {
            table.remove(&step);
            tracing::trace!(group = %self.id, %op, step, "release step slot");
        }
        slot
    }

    /// Records that a member issued `op` as its `sequence`-th broker-mediated
    /// collective in this group.
    ///
    /// Returns the op kind claimed by an earlier member if it differs.
    pub fn verify_sequence(&self, sequence: u64, op: OpKind) -> Option<OpKind> {
        let size = self.size();
        let mut entry = self
            .sequence
            .entry(sequence)
            .or_insert(SequenceEntry { op, remaining: size });
        if entry.op != op {
            return Some(entry.op);
        }

        entry.remaining -= 1;
        let drained = entry.remaining == 0;
        drop(entry);

        if drained {
            self.sequence.remove(&sequence);
        }
        None
    }

    /// Number of step slots that have been allocated but not yet claimed by
    /// every member.
    pub fn pending_steps(&self) -> usize {
        self.steps.iter().map(DashMap::len).sum()
    }

    pub fn clear_steps(&self) {
        for table in &self.steps {
            table.clear();
        }
        self.sequence.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn group_ids() {
        for id in ["g1", "G", "0", "a_b_", "Z9_z"] {
            assert!(is_valid_group_id(id), "{id}");
        }
        for id in ["", "_world", "_g", "g-1", "g 1", "grüße"] {
            assert!(!is_valid_group_id(id), "{id}");
        }
    }

    #[test]
    fn subgroup_deduplicates_ranks() {
        let (group, mailboxes) = GroupContext::<()>::subgroup("g5", [4, 1, 1, 1], 8).unwrap();
        assert_eq!(group.id(), "g5");
        assert_eq!(group.world_ranks(), &[4, 1]);
        assert_eq!(group.size(), 2);
        assert_eq!(mailboxes.len(), 2);
    }

    #[test]
    fn subgroup_keeps_given_order() {
        let (group, _) =
            GroupContext::<()>::subgroup("g4", [0, 1, 2, 3, 7, 6, 5, 4], 8).unwrap();
        assert_eq!(group.world_ranks(), &[0, 1, 2, 3, 7, 6, 5, 4]);
    }

    #[test]
    fn subgroup_errors() {
        assert!(matches!(
            GroupContext::<()>::subgroup("g", [0, 8], 8),
            Err(ConfigError::RankOutOfRange { rank: 8, size: 8, .. })
        ));
        assert!(matches!(
            GroupContext::<()>::subgroup("g", [], 8),
            Err(ConfigError::EmptyGroup(id)) if id == "g"
        ));
        assert!(matches!(
            GroupContext::<()>::subgroup("_world", [0], 8),
            Err(ConfigError::InvalidGroupId(_))
        ));
    }

    #[test]
    fn world_has_every_rank() {
        let (group, _) = GroupContext::<()>::world(3);
        assert_eq!(group.id(), WORLD);
        assert_eq!(group.world_ranks(), &[0, 1, 2]);
    }

    #[test]
    fn step_slot_is_freed_after_last_claim() {
        let (group, _) = GroupContext::<u32>::world(3);

        let first = group.claim_step(OpKind::Broadcast, 0);
        assert_eq!(group.pending_steps(), 1);
        let second = group.claim_step(OpKind::Broadcast, 0);
        assert_eq!(group.pending_steps(), 1);

        // A different step of the same op gets its own channels.
        let _other = group.claim_step(OpKind::Broadcast, 1);
        assert_eq!(group.pending_steps(), 2);

        let third = group.claim_step(OpKind::Broadcast, 0);
        assert_eq!(group.pending_steps(), 1);

        let (Slot::Broadcast { sender, .. }, Slot::Broadcast { receiver: r2, .. }, Slot::Broadcast { receiver: r3, .. }) =
            (first, second, third)
        else {
            panic!("expected broadcast slots");
        };
        assert_eq!(sender.capacity(), Some(2));
        sender.send(7).unwrap();
        sender.send(7).unwrap();
        assert_eq!(r2.recv().unwrap(), 7);
        assert_eq!(r3.recv().unwrap(), 7);
    }

    #[test]
    fn scatter_slot_has_one_lane_per_peer() {
        let (group, _) = GroupContext::<u32>::world(4);
        let slot = group.claim_step(OpKind::Scatter, 0);
        assert_eq!(slot.kind(), OpKind::Scatter);
        let Slot::Scatter(lanes) = slot else {
            panic!("expected scatter slot");
        };
        assert_eq!(lanes.len(), 3);
        assert!(lanes.iter().all(|lane| lane.sender.capacity() == Some(1)));
    }

    #[test]
    fn sequence_mismatch_is_reported() {
        let (group, _) = GroupContext::<u32>::world(2);
        assert_eq!(group.verify_sequence(0, OpKind::Broadcast), None);
        assert_eq!(
            group.verify_sequence(0, OpKind::Gather),
            Some(OpKind::Broadcast)
        );

        assert_eq!(group.verify_sequence(1, OpKind::Scatter), None);
        assert_eq!(group.verify_sequence(1, OpKind::Scatter), None);
        // Drained entries are forgotten.
        assert_eq!(group.verify_sequence(1, OpKind::Gather), None);
    }

    #[test]
    fn clear_steps_drops_everything() {
        let (group, _) = GroupContext::<u32>::world(3);
        group.claim_step(OpKind::Broadcast, 0);
        group.claim_step(OpKind::Gather, 0);
        group.claim_step(OpKind::Scatter, 5);
        assert_eq!(group.pending_steps(), 3);
        group.clear_steps();
        assert_eq!(group.pending_steps(), 0);
    }
}
