use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for drover operations.
///
/// One central enum with structured variants: store-level failures carry
/// enough context to tell a stale database from a damaged one, user-facing
/// variants carry the path or rule that triggered them.
#[derive(Error, Debug)]
pub enum DroverError {
    // === Store Errors ===
    /// A store file was written by an incompatible version.
    ///
    /// Distinct from corruption: the file is intact but its layout is not
    /// ours. The store refuses to open and asks for a rebuild.
    #[error("store version mismatch in '{path}': found {found}, expected {expected} (rebuild the store)")]
    StoreVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    /// A store file is structurally damaged.
    #[error("store file '{path}' is corrupt: {detail}")]
    StoreCorrupt { path: PathBuf, detail: String },

    /// A store file could not be mapped or opened at all.
    #[error("cannot open store file '{path}'")]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An index referenced a record that does not exist.
    #[error("dangling {kind} index {idx}")]
    BadIndex { kind: &'static str, idx: u32 },

    // === Rule Errors ===
    /// A rule's target or dep pattern failed to compile.
    #[error("rule '{rule}': bad pattern '{pattern}': {detail}")]
    BadPattern {
        rule: String,
        pattern: String,
        detail: String,
    },

    /// Static deps of a matched rule cannot be computed.
    #[error("rule '{rule}': cannot compute deps for '{target}'")]
    CannotComputeDeps { rule: String, target: String },

    // === Autodep Errors ===
    /// The autodep environment string does not follow the grammar.
    #[error("bad autodep env format: {env}")]
    BadAutodepEnv { env: String },

    /// A wire message could not be decoded.
    #[error("bad job-exec rpc frame: {detail}")]
    BadRpcFrame { detail: String },

    // === Configuration Errors ===
    /// Invalid configuration, with a hint when one is known.
    #[error("configuration error: {detail}")]
    Config { detail: String },

    // === Cache Errors ===
    /// A cache entry is unusable (missing metadata, bad deps file, ...).
    #[error("cache entry '{entry}' is unusable: {detail}")]
    CacheEntry { entry: String, detail: String },

    /// An uploaded file changed while being copied into the cache.
    #[error("cache upload of '{path}' aborted: file changed during copy")]
    CacheUnstable { path: PathBuf },

    /// The cache cannot fit the entry even after evicting everything.
    #[error("cache is too small: need {needed} bytes, capacity {capacity}")]
    CacheFull { needed: u64, capacity: u64 },

    // === Process Errors ===
    /// Spawning or controlling a job child process failed.
    #[error("job process error: {detail}")]
    JobProcess { detail: String },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DroverError>;

impl DroverError {
    /// Whether this error denotes a structural store problem that must
    /// abort process start (as opposed to a per-request failure).
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            DroverError::StoreVersion { .. }
                | DroverError::StoreCorrupt { .. }
                | DroverError::StoreUnavailable { .. }
        )
    }
}
