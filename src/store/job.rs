// src/store/job.rs

//! Job records: one per rule instantiated on concrete stems.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::digest::{Status, TargetFlags};
use crate::hash::FileDate;
use crate::store::deps::DepsVec;
use crate::store::idx::{NodeId, RuleId};

/// A node marked as an output of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub node: NodeId,
    pub tflags: TargetFlags,
}

/// Why a job was precluded from running (or `Complete` when it ran).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum RunStatus {
    #[default]
    Complete,
    /// A static dep is missing and cannot be built.
    NoDep,
    /// The job's own target cannot exist (uphill, anti).
    NoFile,
    /// A static target is manually held and may not be overwritten.
    TargetErr,
    /// A dep ended in error.
    DepErr,
    /// Resources could not be computed.
    RsrcsErr,
}

impl RunStatus {
    pub fn is_err(self) -> bool {
        self >= RunStatus::TargetErr
    }
}

/// Why a job must (re)run. `>= ClashTarget` carries a node; `>= DepErr`
/// additionally denotes an analysis error.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ReasonTag {
    #[default]
    None,
    // plain reasons
    ChkDeps,
    Cmd,
    Force,
    Garbage,
    Killed,
    Lost,
    New,
    OldError,
    Rsrcs,
    // reasons carrying a node
    ClashTarget,
    DepChanged,
    DepNotReady,
    DepOutOfDate,
    NoTarget,
    PrevTarget,
    // analysis errors carrying a node
    DepErr,
    DepOverwritten,
    StaticDepMissing,
}

impl ReasonTag {
    pub fn has_node(self) -> bool {
        self >= ReasonTag::ClashTarget
    }

    pub fn is_err(self) -> bool {
        self >= ReasonTag::DepErr
    }

    pub fn msg(self) -> &'static str {
        match self {
            ReasonTag::None => "no reason",
            ReasonTag::ChkDeps => "dep check requires rerun",
            ReasonTag::Cmd => "command changed",
            ReasonTag::Force => "job forced",
            ReasonTag::Garbage => "job ran with unstable data",
            ReasonTag::Killed => "job was killed",
            ReasonTag::Lost => "job was lost",
            ReasonTag::New => "job was never run",
            ReasonTag::OldError => "job was in error",
            ReasonTag::Rsrcs => "resources changed and job was in error",
            ReasonTag::ClashTarget => "multiple simultaneous writes",
            ReasonTag::DepChanged => "dep changed",
            ReasonTag::DepNotReady => "dep not ready",
            ReasonTag::DepOutOfDate => "dep out of date",
            ReasonTag::NoTarget => "target missing",
            ReasonTag::PrevTarget => "target previously existed",
            ReasonTag::DepErr => "dep in error",
            ReasonTag::DepOverwritten => "dep has been overwritten",
            ReasonTag::StaticDepMissing => "static dep missing",
        }
    }
}

/// A reason to rerun, optionally pointing at the node that caused it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReason {
    pub tag: ReasonTag,
    pub node: Option<NodeId>,
}

impl JobReason {
    pub fn new(tag: ReasonTag) -> JobReason {
        debug_assert!(!tag.has_node());
        JobReason { tag, node: None }
    }

    pub fn with_node(tag: ReasonTag, node: NodeId) -> JobReason {
        debug_assert!(tag.has_node());
        JobReason { tag, node: Some(node) }
    }

    pub fn is_set(self) -> bool {
        self.tag != ReasonTag::None
    }

    pub fn is_err(self) -> bool {
        self.tag.is_err()
    }

    /// Combine two reasons: an analysis error dominates; otherwise the
    /// first recorded reason is kept.
    pub fn merge(self, other: JobReason) -> JobReason {
        if self.is_err() {
            self
        } else if other.is_err() {
            other
        } else if self.is_set() {
            self
        } else {
            other
        }
    }
}

/// Persistent record of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    pub rule: RuleId,
    /// Stem values captured when the rule matched the official target.
    pub stems: Vec<(String, String)>,
    /// Static deps first, then hidden deps in observed order.
    pub deps: DepsVec,
    /// Declared targets resolved on stems, then observed star targets.
    pub targets: Vec<Target>,
    pub run_status: RunStatus,
    pub status: Status,
    /// Date recorded at the last trustworthy end-processing.
    pub db_date: FileDate,
    /// Exec interval of the last run, for clash overlap detection.
    pub start_date: FileDate,
    pub end_date: FileDate,
    pub exec_time: Duration,
    /// Generation of the rule's cmd when this job last ran ok.
    pub cmd_gen: u32,
    /// Generation of the rule's resources when this job last ran ok.
    pub rsrcs_gen: u32,
}

impl JobData {
    pub fn new(rule: RuleId, stems: Vec<(String, String)>, deps: DepsVec) -> JobData {
        JobData {
            rule,
            stems,
            deps,
            targets: Vec::new(),
            run_status: RunStatus::Complete,
            status: Status::New,
            db_date: FileDate::default(),
            start_date: FileDate::default(),
            end_date: FileDate::default(),
            exec_time: Duration::ZERO,
            cmd_gen: 0,
            rsrcs_gen: 0,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.status.is_frozen()
    }

    /// Exec intervals overlap when neither run finished before the other
    /// started.
    pub fn overlaps(&self, other_start: FileDate, other_end: FileDate) -> bool {
        if !self.start_date.is_set() || !other_start.is_set() {
            return false;
        }
        self.start_date <= other_end && other_start <= self.end_date
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::idx::NodeId;

    #[test]
    fn reason_merge_prefers_errors_then_first() {
        let none = JobReason::default();
        let cmd = JobReason::new(ReasonTag::Cmd);
        let new = JobReason::new(ReasonTag::New);
        let dep_err = JobReason::with_node(ReasonTag::DepErr, NodeId(3));
        assert_eq!(none.merge(cmd).tag, ReasonTag::Cmd);
        assert_eq!(cmd.merge(new).tag, ReasonTag::Cmd);
        assert_eq!(cmd.merge(dep_err).tag, ReasonTag::DepErr);
        assert_eq!(dep_err.merge(cmd).tag, ReasonTag::DepErr);
    }

    #[test]
    fn overlap_requires_both_intervals() {
        let mut j = JobData::new(RuleId(0), vec![], DepsVec::new());
        assert!(!j.overlaps(FileDate(5), FileDate(9)));
        j.start_date = FileDate(4);
        j.end_date = FileDate(6);
        assert!(j.overlaps(FileDate(5), FileDate(9)));
        assert!(!j.overlaps(FileDate(7), FileDate(9)));
    }
}
