//! Collective communication groups.
//!
//! The engine only talks to peers through [`CommGroup`]:
//!
//! - `all_reduce_max` synchronizes amax observations at autocast scope exit
//!   (over the data-parallel group).
//! - `all_gather`, `reduce_scatter` and `all_reduce_sum` move activations at
//!   tensor/sequence parallel region boundaries.
//!
//! Backends:
//!
//! - [`LocalGroup`]: a single participant; every collective is the identity.
//! - [`ThreadGroup`]: participants are threads of one process, connected by a
//!   full mesh of channels. Useful for tests and CPU reference runs.

pub mod group;
pub mod thread;

pub use group::{CommGroup, LocalGroup};
pub use thread::ThreadGroup;
