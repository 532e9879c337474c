//! Per-(entity, request) scratch state for the make loop.
//!
//! There are no coroutines here: a make call that cannot finish registers
//! its caller as a watcher and returns; the watcher is re-entered when the
//! awaited entity completes. Everything a resumption needs lives in these
//! records; an absent record is equivalent to the default.

use drover_types::{DepState, JobIdx, JobReason, NodeIdx, Pdate};

/// What the caller needs to know about a job, monotonically non-decreasing
/// per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RunAction {
    #[default]
    None,
    /// Is the output buildable? Only static deps are analyzed.
    Makable,
    /// Run if necessary, then report ok/err.
    Status,
    /// Additionally ensure target files are present on disk.
    Dsk,
    /// Forced re-execution.
    Run,
}

/// What the caller needs to know about a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum NodeAction {
    #[default]
    None,
    /// Buildability only.
    Makable,
    /// Content up to date (producing job ok/err known).
    Status,
    /// Content up to date and present on disk.
    Dsk,
}

impl NodeAction {
    /// The job action needed from a node's producing job.
    #[must_use]
    pub fn job_action(self) -> RunAction {
        match self {
            NodeAction::None => RunAction::None,
            NodeAction::Makable => RunAction::Makable,
            NodeAction::Status => RunAction::Status,
            NodeAction::Dsk => RunAction::Dsk,
        }
    }
}

/// Why a job's make is being (re-)entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MakeAction {
    /// Fresh analysis request.
    #[default]
    None,
    /// A watched dep completed.
    Wakeup,
    /// The job's execution ended; restart analysis with updated deps.
    End,
}

/// Traversal level of a job within one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum JobLvl {
    #[default]
    None,
    /// Analyzing deps.
    Dep,
    /// Submitted to the backend.
    Queued,
    /// Executing.
    Exec,
    /// Execution ended, end handling in progress.
    End,
    Done,
}

/// Who to re-enter when an awaited entity completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watcher {
    Job(JobIdx),
    Node(NodeIdx),
    /// The request itself (top-level targets).
    Req,
}

/// Per-(job, request) make state.
#[derive(Debug, Clone, Default)]
pub struct JobReqInfo {
    pub lvl: JobLvl,
    /// Next dep position to analyze on (re-)entry.
    pub dep_lvl: usize,
    /// Rolling dep classification across suspensions.
    pub dep_state: DepState,
    /// Outstanding awaited deps.
    pub n_wait: usize,
    /// Accumulated action goal; never decreases.
    pub action: RunAction,
    /// Highest action this job has completed for this request.
    pub done_action: Option<RunAction>,
    /// Strongest rerun reason accumulated so far.
    pub reason: JobReason,
    /// Deadline priority inherited from the request.
    pub pressure: Pdate,
    pub watchers: Vec<Watcher>,
    /// A critical dep was seen modified in the currently-open group.
    pub crit_pending: bool,
    /// This request already executed the job at least once.
    pub executed: bool,
    /// The job was satisfied from the artifact cache.
    pub cache_hit: bool,
    /// The job is only speculatively needed (beyond a critical modif).
    pub speculative: bool,
    /// An error was reported for this job in this request.
    pub reported_err: bool,
    /// The job was counted in the request stats.
    pub counted: bool,
}

impl JobReqInfo {
    #[must_use]
    pub fn done_for(&self, action: RunAction) -> bool {
        self.done_action.is_some_and(|d| d >= action)
    }

    #[must_use]
    pub fn waiting(&self) -> bool {
        self.n_wait > 0
    }
}

/// Per-(node, request) make state.
#[derive(Debug, Clone, Default)]
pub struct NodeReqInfo {
    /// Outstanding awaited producing jobs.
    pub n_wait: usize,
    pub action: NodeAction,
    pub done_action: Option<NodeAction>,
    /// Position in the candidate job list currently being tried.
    pub prio_idx: usize,
    pub watchers: Vec<Watcher>,
    /// The node could not be brought up to date.
    pub err: bool,
}

impl NodeReqInfo {
    #[must_use]
    pub fn done_for(&self, action: NodeAction) -> bool {
        self.done_action.is_some_and(|d| d >= action)
    }

    #[must_use]
    pub fn waiting(&self) -> bool {
        self.n_wait > 0
    }
}
