//! Per-job access gathering.
//!
//! For each running job, a [`Gather`] owns a listening socket, accepts the
//! slave connections of every process in the job's tree, merges their
//! access reports into a per-file table, and finalizes the job's dep and
//! target digests once the child ends.

pub mod access;
pub mod server;

pub use access::{AccessInfo, AccessTable, DepDigest, EventInfo, TargetDigest, WriteState};
pub use server::{Gather, GatherResult};
