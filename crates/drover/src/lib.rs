//! Drover: an incremental build orchestrator whose dependencies are
//! discovered at job execution time.
//!
//! Jobs derive file targets from file sources by running user-defined
//! rules; filesystem accesses of each job's process tree are observed,
//! merged into a causal order and reconciled against a persistent build
//! graph. Re-run decisions rest on content hashes, target/dep flag
//! semantics and the recovered access order.
//!
//! This crate re-exports the public surface of the workspace:
//!
//! - [`store`] — the persistent, memory-mapped graph store
//! - [`engine`] — job/node/request state machines and backends
//! - [`gather`] — per-job access collection and child execution
//! - [`autodep`] — the child environment and access-event wire format
//! - [`cache`] — the content-addressed artifact cache

pub use drover_autodep as autodep;
pub use drover_cache as cache;
pub use drover_engine as engine;
pub use drover_error as error;
pub use drover_gather as gather;
pub use drover_store as store;
pub use drover_types as types;

pub use drover_engine::{Engine, EngineConfig, FnBackend, LocalBackend};
pub use drover_error::{DroverError, Result};
pub use drover_store::Store;
