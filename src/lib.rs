//! SPMD coordination for threads in a single process.
//!
//! This crate runs the same task function on `N` threads and provides a set of
//! collective communication routines similar to the ones found in MPI. Each
//! thread is identified by its rank and communicates through
//! [`Communicator`]s. A cohort is created and owned by a
//! [`Controller`]; see the [controller] module for how to build and run one.
//!
//! # Groups
//! Every cohort has a world group containing all ranks, with the id
//! [`WORLD`]. Additional subgroups are defined when the controller is built
//! and operate independently of each other. A rank's local rank in a subgroup
//! is its position in the list the subgroup was defined with.
//!
//! The following collectives are available on every group:
//! - [Barrier](Communicator::barrier): Synchronizes all members of a group.
//! - [Broadcast](Communicator::broadcast): Sends a value from one rank to all
//!   members of a group.
//! - [Scatter](Communicator::scatter): Splits a vector of one rank into
//!   contiguous chunks, one per member.
//! - [Gather](Communicator::gather): Collects one value of every member at one
//!   rank.
//!
//! # Cancellation
//! Each cohort carries a [`CancelSignal`]. It is triggered by
//! [`Communicator::quit`], [`Controller::quit`] or a panicking task. Once it is
//! triggered every collective of the cohort returns [`Canceled`] instead of
//! blocking.
//!
//! # Important Notes
//! <div class="warning">
//! All members of a group must call the same collectives in the same order.
//! Otherwise the group blocks until the cohort is canceled. Enable
//! <code>verify_collectives</code> on the builder to turn such mismatches into
//! panics while debugging.
//! </div>

pub(crate) mod barrier;
pub(crate) mod broadcast;
pub(crate) mod broker;
pub(crate) mod gather;
pub(crate) mod group;
pub(crate) mod scatter;
pub(crate) mod utils;

pub mod communicator;
pub mod controller;
pub mod once;
pub mod panics;
pub mod signal;

pub use communicator::{Communicator, Subgroups};
pub use controller::{ConfigError, Controller, ControllerBuilder, ControllerConfig};
pub use group::{is_valid_group_id, WORLD};
pub use once::OnceGate;
pub use panics::{PanicLog, PanicRecord};
pub use signal::{CancelSignal, Canceled, Signal};
