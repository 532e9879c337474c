//! Job execution statuses, run statuses, dep analysis states and rerun
//! reasons.
//!
//! The declaration order of [`Status`] is semantic: everything at or below
//! `Killed` means the job was killed, at or below `Garbage` means it did not
//! run reliably, at or above `Err` means it ended in error.

use std::fmt;

use crate::NodeIdx;

/// Result of one job execution.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum Status {
    /// Job was never run.
    #[default]
    New,
    /// Job disappeared for an unknown reason.
    Lost,
    /// Job was killed.
    Killed,
    /// A dep check failed mid-run.
    ChkDeps,
    /// Job did not run reliably (unstable deps observed).
    Garbage,
    /// Job ended successfully.
    Ok,
    /// Job behaves as a source (operator override).
    Frozen,
    /// Job ended in error.
    Err,
    /// Job is frozen in error.
    ErrFrozen,
    /// Job exceeded its wall-clock budget.
    Timeout,
    /// A system error occurred during execution.
    SystemErr,
}

impl Status {
    /// Whether the job produced usable targets.
    #[inline]
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok | Status::Frozen)
    }

    /// Whether the outcome reflects a reliable execution of the command.
    ///
    /// Anything at or below `Garbage` must be rerun before its outputs can
    /// be trusted.
    #[inline]
    #[must_use]
    pub fn ran_reliably(self) -> bool {
        self > Status::Garbage
    }

    /// Whether the job ended in error.
    #[inline]
    #[must_use]
    pub fn is_err(self) -> bool {
        self >= Status::Err
    }

    /// Whether the status is final regardless of dep analysis (rerunning
    /// cannot improve it without outside intervention).
    #[inline]
    #[must_use]
    pub fn is_terminal_err(self) -> bool {
        matches!(self, Status::Timeout | Status::SystemErr)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::New => "new",
            Status::Lost => "lost",
            Status::Killed => "killed",
            Status::ChkDeps => "chk_deps",
            Status::Garbage => "garbage",
            Status::Ok => "ok",
            Status::Frozen => "frozen",
            Status::Err => "err",
            Status::ErrFrozen => "err_frozen",
            Status::Timeout => "timeout",
            Status::SystemErr => "system_err",
        };
        f.write_str(s)
    }
}

/// Outcome of dep analysis for a job, independent of execution.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum RunStatus {
    /// Deps are satisfied; execution result (if any) stands.
    #[default]
    Complete,
    /// A static dep is not buildable.
    NoDep,
    /// A required file is missing and cannot be built.
    NoFile,
    /// Target analysis failed (policy violation).
    TargetErr,
    /// A dep ended in error.
    DepErr,
    /// Resources could not be computed or acquired.
    RsrcsErr,
}

impl RunStatus {
    #[inline]
    #[must_use]
    pub fn is_err(self) -> bool {
        self != RunStatus::Complete
    }
}

/// Rolling state of the dep traversal inside the make loop.
///
/// Ordered so that merging keeps the strongest classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DepState {
    /// All deps seen so far are unchanged and ok.
    #[default]
    Ok,
    /// A dep changed inside a still-open parallel group; not yet committed.
    DanglingModif,
    /// A dep changed; the job must rerun.
    Modif,
    /// A static dep is not buildable.
    MissingStatic,
    /// A dep is in error.
    Err,
}

impl DepState {
    #[inline]
    #[must_use]
    pub fn merge(self, other: DepState) -> DepState {
        self.max(other)
    }

    /// Commit a dangling modification at a non-parallel boundary.
    #[inline]
    #[must_use]
    pub fn settle(self) -> DepState {
        if self == DepState::DanglingModif {
            DepState::Modif
        } else {
            self
        }
    }
}

/// Why a job needs to (re)run.
///
/// Tags are ordered weakest to strongest; merging keeps the strongest.
/// Tags at or above `ClashTarget` carry an associated node, tags at or
/// above `DepErr` mean the job could not complete because of a dep.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum JobReasonTag {
    #[default]
    None,
    ChkDeps,
    Cmd,
    Force,
    Garbage,
    Killed,
    Lost,
    New,
    OldError,
    Rsrcs,
    // tags below carry a node
    ClashTarget,
    DepChanged,
    DepNotReady,
    DepOutOfDate,
    NoTarget,
    PrevTarget,
    // tags below mean the job did not complete because of a dep
    DepErr,
    DepOverwritten,
    StaticDepMissing,
}

impl JobReasonTag {
    #[inline]
    #[must_use]
    pub fn has_node(self) -> bool {
        self >= JobReasonTag::ClashTarget
    }

    #[inline]
    #[must_use]
    pub fn is_err(self) -> bool {
        self >= JobReasonTag::DepErr
    }

    #[must_use]
    pub fn msg(self) -> &'static str {
        match self {
            JobReasonTag::None => "no reason",
            JobReasonTag::ChkDeps => "dep check requires rerun",
            JobReasonTag::Cmd => "command changed",
            JobReasonTag::Force => "job forced",
            JobReasonTag::Garbage => "job ran with unstable data",
            JobReasonTag::Killed => "job was killed",
            JobReasonTag::Lost => "job was lost",
            JobReasonTag::New => "job was never run",
            JobReasonTag::OldError => "job was in error",
            JobReasonTag::Rsrcs => "resources changed and job was in error",
            JobReasonTag::ClashTarget => "multiple simultaneous writes",
            JobReasonTag::DepChanged => "dep changed",
            JobReasonTag::DepNotReady => "dep not ready",
            JobReasonTag::DepOutOfDate => "dep out of date",
            JobReasonTag::NoTarget => "target missing",
            JobReasonTag::PrevTarget => "target previously existed",
            JobReasonTag::DepErr => "dep in error",
            JobReasonTag::DepOverwritten => "dep has been overwritten",
            JobReasonTag::StaticDepMissing => "static dep missing",
        }
    }
}

/// A rerun reason, optionally pinned to the node that triggered it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct JobReason {
    pub tag: JobReasonTag,
    pub node: Option<NodeIdx>,
}

impl JobReason {
    pub const NONE: JobReason = JobReason {
        tag: JobReasonTag::None,
        node: None,
    };

    #[must_use]
    pub fn new(tag: JobReasonTag) -> Self {
        debug_assert!(!tag.has_node(), "node-carrying reason built without node");
        Self { tag, node: None }
    }

    #[must_use]
    pub fn on_node(tag: JobReasonTag, node: NodeIdx) -> Self {
        debug_assert!(tag.has_node(), "nodeless reason built with node");
        Self {
            tag,
            node: Some(node),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_some(self) -> bool {
        self.tag != JobReasonTag::None
    }

    /// Keep the strongest of the two reasons.
    #[must_use]
    pub fn merge(self, other: JobReason) -> JobReason {
        if other.tag > self.tag {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for JobReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag.msg())
    }
}

/// Classification of a node's on-disk state relative to what the store
/// believes it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Manual {
    /// Disk agrees with the recorded signature.
    Ok,
    /// File was removed.
    Unlnked,
    /// File was emptied (tolerated as a cheap user reset).
    Empty,
    /// File was modified outside our control.
    Modif,
}

impl Manual {
    #[inline]
    #[must_use]
    pub fn modified(self) -> bool {
        !matches!(self, Manual::Ok)
    }
}

/// Lazily computed buildability of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Buildable {
    /// Not computed yet for the current match generation.
    #[default]
    Unknown,
    /// Listed source file.
    Src,
    /// Listed source dir.
    SrcDir,
    /// Lies under a source file (cannot be built).
    SubSrc,
    /// Lies under a source dir (a source whose existence is checked on disk).
    SubSrcDir,
    /// Matches an anti-rule: never buildable, never a source.
    Anti,
    /// A rule definitely produces it.
    Yes,
    /// No rule produces it.
    No,
    /// Some candidate rule may produce it, pending dep analysis.
    Maybe,
    /// Buildability analysis hit a dependency cycle.
    Loop,
    /// Name exceeds the configured maximum.
    LongName,
    /// Code-decoded node (value-encoding sub-feature).
    Decode,
    /// Code-encoded node (value-encoding sub-feature).
    Encode,
}

impl Buildable {
    /// All source/anti variants: nodes whose content is never produced by a
    /// regular job.
    #[inline]
    #[must_use]
    pub fn is_src_anti(self) -> bool {
        matches!(
            self,
            Buildable::Src
                | Buildable::SrcDir
                | Buildable::SubSrc
                | Buildable::SubSrcDir
                | Buildable::Anti
        )
    }

    /// Whether the node can end up with produced content.
    #[inline]
    #[must_use]
    pub fn is_buildable(self) -> bool {
        matches!(
            self,
            Buildable::Yes | Buildable::Maybe | Buildable::Decode | Buildable::Encode
        )
    }

    /// Whether the classification is definitive for the current match
    /// generation.
    #[inline]
    #[must_use]
    pub fn is_decided(self) -> bool {
        !matches!(self, Buildable::Unknown | Buildable::Maybe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order_bands() {
        assert!(Status::Killed <= Status::Garbage);
        assert!(!Status::Garbage.ran_reliably());
        assert!(Status::Ok.ran_reliably());
        assert!(Status::Err.is_err());
        assert!(Status::ErrFrozen.is_err());
        assert!(!Status::Ok.is_err());
        assert!(Status::Timeout.is_terminal_err());
        assert!(!Status::Err.is_terminal_err());
    }

    #[test]
    fn test_dep_state_merge_keeps_strongest() {
        assert_eq!(DepState::Ok.merge(DepState::Modif), DepState::Modif);
        assert_eq!(DepState::Err.merge(DepState::Modif), DepState::Err);
        assert_eq!(DepState::DanglingModif.settle(), DepState::Modif);
        assert_eq!(DepState::Err.settle(), DepState::Err);
    }

    #[test]
    fn test_reason_merge_keeps_strongest() {
        let weak = JobReason::new(JobReasonTag::New);
        let strong = JobReason::on_node(JobReasonTag::DepChanged, NodeIdx::new(3).expect("idx"));
        assert_eq!(weak.merge(strong).tag, JobReasonTag::DepChanged);
        assert_eq!(strong.merge(weak).tag, JobReasonTag::DepChanged);
        assert!(strong.tag.has_node());
        assert!(!weak.tag.has_node());
    }

    #[test]
    fn test_buildable_classes() {
        assert!(Buildable::Src.is_src_anti());
        assert!(Buildable::Anti.is_src_anti());
        assert!(!Buildable::Yes.is_src_anti());
        assert!(Buildable::Yes.is_buildable());
        assert!(!Buildable::No.is_buildable());
        assert!(!Buildable::Unknown.is_decided());
        assert!(Buildable::No.is_decided());
    }
}
