//! Cohorts of ranked threads.
//!
//! A [`Controller`] owns a cohort of `N` threads running the same task
//! function. Each thread is identified by its world rank and receives a
//! [`Communicator`] for the world group plus one for every subgroup it was
//! assigned to at build time.
//!
//! # Example
//! ```
//! use cohort::Controller;
//!
//! let controller = Controller::<u64>::builder()
//!     .size(4)
//!     .group("evens", [0, 2])
//!     .task(|world, groups| {
//!         let total = world.gather(0, world.rank() as u64).unwrap();
//!         if let Some(total) = total {
//!             assert_eq!(total.iter().sum::<u64>(), 6);
//!         }
//!         if let Some(evens) = groups.get("evens") {
//!             evens.barrier().unwrap();
//!         }
//!     })
//!     .build()?;
//!
//! assert_eq!(controller.run(), 0);
//! # Ok::<(), cohort::ConfigError>(())
//! ```
//!
//! # Panics and cancellation
//! A panic in any task is caught, recorded as a [`PanicRecord`] and cancels
//! the cohort. Every collective blocked in another task then returns
//! [`Canceled`](crate::Canceled), so peers can unwind instead of waiting
//! forever. [`Controller::run`] returns the number of panicked tasks.

use std::{
    convert::Infallible,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use ahash::{HashMap, HashSet};
use crossbeam::channel::Receiver;
use parking_lot::Mutex;

use crate::{
    broker::{self, Broker},
    communicator::{Communicator, Subgroups},
    group::GroupContext,
    once::OnceGate,
    panics::{PanicLog, PanicRecord},
    signal::CancelSignal,
    utils::panic_message,
};

/// Indicates an invalid cohort configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No task function was given.
    #[error("No task function given")]
    MissingTask,

    /// The cohort size is zero and the number of CPUs is unknown.
    #[error("Cohort size must be greater than zero")]
    SizeZero,

    /// The thread name prefix is empty.
    #[error("Thread name must not be empty")]
    EmptyThreadName,

    /// A group id does not match `[A-Za-z0-9][A-Za-z0-9_]*`.
    #[error("Invalid group ID {0:?}")]
    InvalidGroupId(String),

    /// Two groups share an id.
    #[error("Group ID {0:?} is already in use")]
    GroupIdInUse(String),

    /// A group has no members.
    #[error("Group {0:?} is empty")]
    EmptyGroup(String),

    /// A group lists a rank that is not part of the cohort.
    #[error("Rank {rank} of group {group:?} is out of range (cohort size is {size})")]
    RankOutOfRange {
        group: String,
        rank: usize,
        size: usize,
    },
}

/// Additional configuration for a cohort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Number of ranks.
    ///
    /// Zero selects the number of logical CPUs reported by
    /// [`std::thread::available_parallelism`].
    ///
    /// The default is 0.
    pub size: usize,

    /// Prefix of the thread names.
    ///
    /// Task threads are named `{thread_name}-{rank}` and the broker thread
    /// `{thread_name}-broker`.
    ///
    /// The default is `cohort-rank`.
    pub thread_name: String,

    /// Checks that the members of a group call broadcast, scatter and gather
    /// in the same order.
    ///
    /// A mismatch normally deadlocks the group until the cohort is canceled.
    /// With this enabled, the rank that deviates panics with a description of
    /// the mismatch instead. Barriers are not checked.
    ///
    /// The default is false.
    pub verify_collectives: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            size: 0,
            thread_name: "cohort-rank".to_owned(),
            verify_collectives: false,
        }
    }
}

impl ControllerConfig {
    /// Validates the configuration.
    ///
    /// See [`ControllerConfig`] and [`ConfigError`] for details.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_name.is_empty() {
            return Err(ConfigError::EmptyThreadName);
        }
        self.resolved_size().map(|_| ())
    }

    /// The number of ranks after substituting the CPU count for zero.
    pub fn resolved_size(&self) -> Result<usize, ConfigError> {
        match self.size {
            0 => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .map_err(|_| ConfigError::SizeZero),
            size => Ok(size),
        }
    }
}

type TaskFn<T> = dyn Fn(&Communicator<T>, &Subgroups<T>) + Send + Sync + 'static;

/// Builds a [`Controller`].
pub struct ControllerBuilder<T> {
    config: ControllerConfig,
    groups: Vec<(String, Vec<usize>)>,
    task: Option<Arc<TaskFn<T>>>,
}

impl<T: Send + 'static> ControllerBuilder<T> {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            groups: Vec::new(),
            task: None,
        }
    }

    /// Sets the number of ranks. Zero selects the number of logical CPUs.
    pub fn size(mut self, size: usize) -> Self {
        self.config.size = size;
        self
    }

    pub fn thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.config.thread_name = thread_name.into();
        self
    }

    pub fn verify_collectives(mut self, verify: bool) -> Self {
        self.config.verify_collectives = verify;
        self
    }

    /// Adds a subgroup made of the given world ranks.
    ///
    /// The position of a rank in `ranks` is its local rank in the group.
    /// Repeated ranks are ignored after their first occurrence.
    pub fn group(mut self, id: impl Into<String>, ranks: impl IntoIterator<Item = usize>) -> Self {
        self.groups.push((id.into(), ranks.into_iter().collect()));
        self
    }

    pub fn groups<I, S, R>(self, groups: I) -> Self
    where
        I: IntoIterator<Item = (S, R)>,
        S: Into<String>,
        R: IntoIterator<Item = usize>,
    {
        groups
            .into_iter()
            .fold(self, |builder, (id, ranks)| builder.group(id, ranks))
    }

    /// Sets the function every rank runs.
    pub fn task<F>(mut self, task: F) -> Self
    where
        F: Fn(&Communicator<T>, &Subgroups<T>) + Send + Sync + 'static,
    {
        self.task = Some(Arc::new(task));
        self
    }

    pub fn build(self) -> Result<Controller<T>, ConfigError> {
        self.config.validate()?;
        let task = self.task.ok_or(ConfigError::MissingTask)?;
        let size = self.config.resolved_size()?;
        let verify = self.config.verify_collectives;

        let cancel = Arc::new(CancelSignal::new());
        let (broker_handle, requests) = broker::channel();

        let communicators = |group: &Arc<GroupContext<T>>, mailboxes: Vec<_>| {
            mailboxes
                .into_iter()
                .enumerate()
                .map(|(rank, mailbox)| {
                    Communicator::new(
                        group.clone(),
                        rank,
                        mailbox,
                        cancel.clone(),
                        broker_handle.clone(),
                        verify,
                    )
                })
                .collect::<Vec<_>>()
        };

        let (world, mailboxes) = GroupContext::world(size);
        let world = Arc::new(world);
        let mut ranks: Vec<RankHandles<T>> = communicators(&world, mailboxes)
            .into_iter()
            .map(|world| RankHandles {
                world,
                subgroups: HashMap::default(),
            })
            .collect();
        let mut groups = vec![world];

        let mut ids = HashSet::default();
        for (id, members) in self.groups {
            let (group, mailboxes) = GroupContext::subgroup(&id, members, size)?;
            if !ids.insert(id.clone()) {
                return Err(ConfigError::GroupIdInUse(id));
            }

            let group = Arc::new(group);
            for communicator in communicators(&group, mailboxes) {
                let world_rank = communicator.world_rank();
                ranks[world_rank]
                    .subgroups
                    .insert(id.clone(), communicator);
            }
            tracing::debug!(group = %id, members = ?group.world_ranks(), "group created");
            groups.push(group);
        }

        let broker = Broker::new(requests, cancel.clone(), groups.clone());

        Ok(Controller {
            size,
            thread_name: self.config.thread_name,
            task,
            groups,
            pending: Mutex::new(Some(Pending { broker, ranks })),
            cancel,
            panics: Arc::new(PanicLog::new()),
            launch_requested: AtomicBool::new(false),
            launched: OnceGate::new(),
            drained: OnceGate::new(),
            canceled: OnceGate::new(),
            tasks: Mutex::new(Vec::new()),
            broker: Mutex::new(None),
        })
    }
}

/// The communicators handed to one task.
struct RankHandles<T> {
    world: Communicator<T>,
    subgroups: Subgroups<T>,
}

/// Everything that is moved into threads on launch.
struct Pending<T> {
    broker: Broker<T>,
    ranks: Vec<RankHandles<T>>,
}

/// Owns a cohort of ranked threads.
///
/// Dropping a controller cancels its cohort; threads that are still running
/// are detached.
pub struct Controller<T> {
    size: usize,
    thread_name: String,
    task: Arc<TaskFn<T>>,
    groups: Vec<Arc<GroupContext<T>>>,
    pending: Mutex<Option<Pending<T>>>,
    cancel: Arc<CancelSignal>,
    panics: Arc<PanicLog>,
    launch_requested: AtomicBool,
    launched: OnceGate,
    drained: OnceGate,
    canceled: OnceGate,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    broker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Controller<T> {
    /// Starts building a controller with the default configuration.
    pub fn builder() -> ControllerBuilder<T> {
        ControllerBuilder::new(ControllerConfig::default())
    }

    /// Creates a controller of `size` ranks running `task`, with the given
    /// subgroups.
    ///
    /// A `size` of zero selects the number of logical CPUs.
    pub fn new<F, I, S, R>(size: usize, task: F, groups: I) -> Result<Self, ConfigError>
    where
        F: Fn(&Communicator<T>, &Subgroups<T>) + Send + Sync + 'static,
        I: IntoIterator<Item = (S, R)>,
        S: Into<String>,
        R: IntoIterator<Item = usize>,
    {
        Self::builder().size(size).groups(groups).task(task).build()
    }

    /// Spawns the broker and one thread per rank.
    ///
    /// Only the first call has an effect.
    pub fn launch(&self) {
        self.launch_requested.store(true, Ordering::SeqCst);
        self.launched.call(|| self.spawn_cohort());
    }

    fn spawn_cohort(&self) {
        let Some(Pending { broker, ranks }) = self.pending.lock().take() else {
            return;
        };

        match broker.spawn(format!("{}-broker", self.thread_name)) {
            Ok(handle) => *self.broker.lock() = Some(handle),
            Err(err) => {
                // Without a broker no collective can make progress.
                tracing::error!(%err, "failed to spawn broker thread");
                self.cancel.cancel();
            }
        }

        let mut tasks = self.tasks.lock();
        for (rank, handles) in ranks.into_iter().enumerate() {
            let task = self.task.clone();
            let cancel = self.cancel.clone();
            let panics = self.panics.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("{}-{rank}", self.thread_name))
                .spawn(move || run_rank(rank, handles, &*task, &cancel, &panics));

            match spawned {
                Ok(handle) => tasks.push(handle),
                Err(err) => record_panic(
                    rank,
                    format!("failed to spawn thread: {err}"),
                    &self.cancel,
                    &self.panics,
                ),
            }
        }
        tracing::debug!(size = self.size, "cohort launched");
    }

    /// Blocks until every task has finished, then cancels the cohort and stops
    /// the broker.
    ///
    /// Returns the number of tasks that panicked. Returns 0 immediately if the
    /// cohort was never launched. May be called from several threads; every
    /// caller returns only after the cohort has drained.
    pub fn wait(&self) -> usize {
        if !self.launch_requested.load(Ordering::SeqCst) {
            return 0;
        }
        // A launch on another thread may still be spawning tasks.
        let _ = self.launched.done().recv();

        self.drained.call(|| self.drain());
        self.panics.len()
    }

    fn drain(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if task.join().is_err() {
                tracing::error!("task thread unwound past its panic handler");
            }
        }

        self.quit();
        if let Some(broker) = self.broker.lock().take() {
            if broker.join().is_err() {
                tracing::error!("broker thread panicked");
            }
        }

        tracing::debug!(panics = self.panics.len(), "cohort finished");
    }

    /// Launches the cohort and waits for it. See [`Self::wait`].
    pub fn run(&self) -> usize {
        self.launch();
        self.wait()
    }
}

impl<T> Controller<T> {
    /// Number of ranks in the cohort.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Cancels the cohort. Idempotent.
    pub fn quit(&self) {
        self.canceled.call(|| {
            self.cancel.cancel();
        });
    }

    pub fn is_quit(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Becomes ready once the cohort is canceled.
    pub fn quit_observe(&self) -> &Receiver<Infallible> {
        self.cancel.observe()
    }

    /// The panics recorded so far.
    pub fn panics(&self) -> Vec<PanicRecord> {
        self.panics.snapshot()
    }

    /// Number of collective steps whose channels are still allocated, summed
    /// over all groups. Zero once [`Self::wait`] has returned.
    pub fn pending_steps(&self) -> usize {
        self.groups.iter().map(|group| group.pending_steps()).sum()
    }
}

impl<T> Drop for Controller<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn run_rank<T>(
    rank: usize,
    handles: RankHandles<T>,
    task: &TaskFn<T>,
    cancel: &CancelSignal,
    panics: &PanicLog,
) {
    let _span = tracing::debug_span!("rank", rank).entered();
    let RankHandles { world, subgroups } = handles;

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(&world, &subgroups))) {
        record_panic(rank, panic_message(payload.as_ref()), cancel, panics);
    }
}

fn record_panic(rank: usize, message: String, cancel: &CancelSignal, panics: &PanicLog) {
    tracing::error!(rank, %message, "task panicked");
    // Recorded before canceling, so peers that observe the cancel find it.
    panics.append(PanicRecord { rank, message });
    cancel.cancel();
}
