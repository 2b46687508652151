// src/req.rs

//! Requests: one per user build invocation.
//!
//! A request owns the ephemeral per-node and per-job state of its traversal
//! (goals, done levels, watcher lists), its statistics, an audit trail, and
//! an ETA used to order concurrent requests for backend prioritization.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::digest::Bool3;
use crate::hash::FileDate;
use crate::rule::RuleData;
use crate::store::idx::{Idx, JobId, NodeId, ReqId, RuleId};
use crate::store::job::JobReason;
use crate::store::IdxMap;

/// How far a node/job must be brought. Levels are totally ordered; for a
/// job, `Dsk` means "run if necessary".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Goal {
    #[default]
    None,
    /// Assert whether the entity can be made at all.
    Makable,
    /// Check deps, no disk access except sources.
    Status,
    /// Ensure up to date on disk.
    Dsk,
}

/// Analysis level of a job within one request. Chronological order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum JobLvl {
    #[default]
    None,
    Dep,
    Queued,
    Exec,
    End,
    Done,
}

/// Outcome classification recorded in request statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobReport {
    /// Ran, targets unchanged.
    Steady,
    /// Ran, targets modified.
    Done,
    Failed,
    /// Needs another pass.
    Rerun,
    /// Served from the content cache.
    Hit,
}

/// Per-(node, request) ephemeral state.
#[derive(Debug, Clone)]
pub struct NodeReqInfo {
    pub goal: Goal,
    /// Highest goal this node is known done for. Monotone except on
    /// explicit reset when the goal is raised.
    pub done: Goal,
    /// Jobs waiting for this node to complete.
    pub watchers: Vec<JobId>,
    /// Outstanding candidate jobs.
    pub n_wait: u32,
    /// Index of the next candidate job group to try.
    pub prio_idx: usize,
    /// Starts optimistic and only ever decreases.
    pub speculate: Bool3,
}

impl Default for NodeReqInfo {
    fn default() -> Self {
        NodeReqInfo {
            goal: Goal::None,
            done: Goal::None,
            watchers: Vec::new(),
            n_wait: 0,
            prio_idx: 0,
            speculate: Bool3::Yes,
        }
    }
}

impl NodeReqInfo {
    pub fn done_for(&self, goal: Goal) -> bool {
        self.done >= goal
    }
}

/// Per-(job, request) ephemeral state.
#[derive(Debug, Clone, Default)]
pub struct JobReqInfo {
    pub goal: Goal,
    pub lvl: JobLvl,
    /// Index of the next dep to analyze.
    pub dep_lvl: usize,
    /// A dep of the current section was seen modified.
    pub section_modified: bool,
    /// Nodes waiting for this job to complete.
    pub watchers: Vec<NodeId>,
    /// Outstanding deps being waited for.
    pub n_wait: u32,
    pub reason: JobReason,
    pub speculate: Bool3,
    /// A dep was seen modified during this analysis.
    pub modified: bool,
    /// A cache probe already missed; do not probe again this pass.
    pub cache_probed: bool,
    /// Second dep walk bringing deps to disk before submission.
    pub disk_pass: bool,
    /// A critical section has been entered.
    pub in_critical: bool,
    /// Reruns already granted to this job within this request.
    pub rerun_count: u8,
}

impl JobReqInfo {
    pub fn running(&self) -> bool {
        matches!(self.lvl, JobLvl::Queued | JobLvl::Exec)
    }

    pub fn done(&self) -> bool {
        self.lvl == JobLvl::Done
    }
}

/// Audit line severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    Note,
    Warn,
    Err,
}

#[derive(Debug, Clone)]
pub struct AuditLine {
    pub kind: AuditKind,
    pub job: Option<JobId>,
    pub text: String,
}

/// Request statistics, updated before wake-up chains proceed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReqStats {
    pub hit: u64,
    pub rerun: u64,
    pub steady: u64,
    pub done: u64,
    pub failed: u64,
    /// Jobs currently queued / executing.
    pub queued: u64,
    pub exec: u64,
}

impl ReqStats {
    pub fn record(&mut self, report: JobReport) {
        match report {
            JobReport::Hit => self.hit += 1,
            JobReport::Rerun => self.rerun += 1,
            JobReport::Steady => self.steady += 1,
            JobReport::Done => self.done += 1,
            JobReport::Failed => self.failed += 1,
        }
    }

    pub fn useful(&self) -> u64 {
        self.steady + self.done + self.failed
    }
}

/// One open user request.
#[derive(Debug, Default)]
pub struct ReqData {
    pub id: ReqId,
    /// Root target nodes, in command order.
    pub targets: Vec<NodeId>,
    /// Killed: ends are folded into stats but not audited.
    pub zombie: bool,
    /// Completion already announced.
    pub done: bool,
    pub node_infos: HashMap<NodeId, NodeReqInfo>,
    pub job_infos: HashMap<JobId, JobReqInfo>,
    pub stats: ReqStats,
    /// Targets written concurrently by two jobs during this request.
    pub clash_nodes: HashSet<NodeId>,
    /// Jobs still to submit per rule, feeding the ETA estimate.
    pub remaining: HashMap<RuleId, u64>,
    pub eta: FileDate,
    pub audit: Vec<AuditLine>,
}

impl ReqData {
    pub fn node_info(&mut self, node: NodeId) -> &mut NodeReqInfo {
        self.node_infos.entry(node).or_default()
    }

    pub fn job_info(&mut self, job: JobId) -> &mut JobReqInfo {
        self.job_infos.entry(job).or_default()
    }

    pub fn audit(&mut self, kind: AuditKind, job: Option<JobId>, text: impl Into<String>) {
        if self.zombie {
            return;
        }
        self.audit.push(AuditLine { kind, job, text: text.into() });
    }

    /// `eta = now + Σ over rules (exec_time × n_jobs_remaining / n_tokens)`.
    pub fn compute_eta(&self, now: FileDate, rules: &IdxMap<RuleId, RuleData>) -> FileDate {
        let mut total = Duration::ZERO;
        for (&rule, &n) in &self.remaining {
            if n == 0 {
                continue;
            }
            let Some(r) = rules.lookup(rule) else { continue };
            let tokens = r.tokens.max(1) as u32;
            total += r.exec_time * (n as u32) / tokens;
        }
        FileDate(now.0.saturating_add(total.as_nanos() as u64))
    }
}

/// Registry of open requests, kept ordered by ETA.
#[derive(Debug, Default)]
pub struct ReqRegistry {
    reqs: IdxMap<ReqId, ReqData>,
    /// Open requests, most urgent (smallest ETA) first.
    order: Vec<ReqId>,
}

impl ReqRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, targets: Vec<NodeId>) -> ReqId {
        let id = self.reqs.push(ReqData::default());
        let req = self.reqs.get_mut(id);
        req.id = id;
        req.targets = targets;
        self.order.push(id);
        debug!(req = id.index(), "request opened");
        id
    }

    pub fn close(&mut self, id: ReqId) -> Option<ReqData> {
        self.order.retain(|&r| r != id);
        self.reqs.pop(id)
    }

    pub fn get(&self, id: ReqId) -> &ReqData {
        self.reqs.get(id)
    }

    pub fn get_mut(&mut self, id: ReqId) -> &mut ReqData {
        self.reqs.get_mut(id)
    }

    pub fn lookup(&self, id: ReqId) -> Option<&ReqData> {
        self.reqs.lookup(id)
    }

    pub fn open_reqs(&self) -> &[ReqId] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Recompute every open request's ETA; returns true when the relative
    /// order changed (backends are only notified then).
    pub fn refresh_etas(&mut self, now: FileDate, rules: &IdxMap<RuleId, RuleData>) -> bool {
        for &id in &self.order {
            let eta = self.reqs.get(id).compute_eta(now, rules);
            self.reqs.get_mut(id).eta = eta;
        }
        let before = self.order.clone();
        let reqs = &self.reqs;
        self.order.sort_by_key(|&id| (reqs.get(id).eta, id));
        before != self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::TargetFlags;
    use crate::rule::{RuleData, TargetSpec};
    use std::collections::HashMap as Map;

    fn mk_rule(exec_ms: u64, tokens: u32) -> RuleData {
        let mut r = RuleData::compile(
            "r".into(),
            0,
            "true".into(),
            vec![TargetSpec { pattern: "out/{x}".into(), tflags: TargetFlags::dflt(), star: false }],
            vec![],
            &Map::new(),
        )
        .unwrap();
        r.exec_time = Duration::from_millis(exec_ms);
        r.tokens = tokens;
        r
    }

    #[test]
    fn eta_scales_with_remaining_jobs_and_tokens() {
        let mut rules = IdxMap::new();
        let ra = rules.push(mk_rule(1000, 1));
        let rb = rules.push(mk_rule(1000, 4));
        let mut req = ReqData::default();
        req.remaining.insert(ra, 2);
        req.remaining.insert(rb, 4);
        let eta = req.compute_eta(FileDate(0), &rules);
        // 2×1s/1 + 4×1s/4 = 3s
        assert_eq!(eta, FileDate(Duration::from_secs(3).as_nanos() as u64));
    }

    #[test]
    fn eta_order_change_is_reported() {
        let mut rules = IdxMap::new();
        let r = rules.push(mk_rule(1000, 1));
        let mut reg = ReqRegistry::new();
        let a = reg.open(vec![]);
        let b = reg.open(vec![]);
        reg.get_mut(a).remaining.insert(r, 1);
        reg.get_mut(b).remaining.insert(r, 5);
        assert!(!reg.refresh_etas(FileDate(0), &rules)); // a already first
        reg.get_mut(a).remaining.insert(r, 10);
        assert!(reg.refresh_etas(FileDate(0), &rules)); // b overtakes a
        assert_eq!(reg.open_reqs()[0], b);
    }

    #[test]
    fn zombie_requests_do_not_audit() {
        let mut req = ReqData::default();
        req.audit(AuditKind::Note, None, "visible");
        req.zombie = true;
        req.audit(AuditKind::Err, None, "dropped");
        assert_eq!(req.audit.len(), 1);
    }

    #[test]
    fn done_level_is_monotone_per_goal() {
        let mut info = NodeReqInfo::default();
        info.done = Goal::Status;
        assert!(info.done_for(Goal::Makable));
        assert!(info.done_for(Goal::Status));
        assert!(!info.done_for(Goal::Dsk));
    }
}
