// src/engine/make_node.rs

//! Node-side make: classification, candidate jobs, completion fan-out.

use tracing::{debug, warn};

use crate::digest::{Accesses, TargetFlags};
use crate::engine::make_job;
use crate::engine::{Engine, StackFrame};
use crate::hash::{Crc, FileSig};
use crate::req::{AuditKind, Goal};
use crate::rule;
use crate::store::deps::{Dep, DepsVec};
use crate::store::idx::Idx;
use crate::store::{
    Buildable, JobData, JobId, NodeId, NodeStatus, ReqId, RuleTgt, RunStatus,
};

/// Bring `node` toward `goal` for `req`.
///
/// Returns true when the node is done at `goal`; otherwise `watcher` (if
/// any) is registered for wake-up and the caller must count one wait.
pub fn node_make(
    eng: &mut Engine,
    node: NodeId,
    req: ReqId,
    goal: Goal,
    watcher: Option<JobId>,
) -> bool {
    ensure_match(eng, node);
    {
        let ri = eng.reqs.get_mut(req).node_info(node);
        if ri.done_for(goal) {
            return true;
        }
        if goal > ri.goal {
            ri.goal = goal;
        }
    }
    if eng.stack.contains(&StackFrame::Node(node)) {
        report_cycle(eng, node, req);
        return true; // done, in error
    }
    eng.stack.push(StackFrame::Node(node));
    advance_node(eng, node, req);
    eng.stack.pop();
    let ri = eng.reqs.get_mut(req).node_info(node);
    if ri.done_for(goal) {
        true
    } else {
        if let Some(w) = watcher {
            if !ri.watchers.contains(&w) {
                ri.watchers.push(w);
            }
        }
        false
    }
}

/// A candidate job of this node completed; re-advance when none left.
pub(crate) fn node_wakeup(eng: &mut Engine, node: NodeId, req: ReqId) {
    let ri = eng.reqs.get_mut(req).node_info(node);
    ri.n_wait = ri.n_wait.saturating_sub(1);
    if ri.n_wait == 0 {
        advance_node(eng, node, req);
    }
}

/// Recompute the node's match results when the generation moved.
pub(crate) fn ensure_match(eng: &mut Engine, node: NodeId) {
    if eng.nodes.get(node).match_gen == eng.match_gen {
        return;
    }
    let path = eng.names.node_name(node).to_string();
    eng.nodes.get_mut(node).invalidate_match();

    let buildable = match eng.srcs.classify(&path) {
        Some(b) => b,
        None if is_uphill(eng, &path) => {
            eng.nodes.get_mut(node).status = NodeStatus::Uphill;
            Buildable::No
        }
        None => {
            let mut rule_tgts = Vec::new();
            for &rid in &eng.rule_order {
                let r = eng.rules.get(rid);
                for ti in 0..r.targets.len() {
                    if r.match_target(ti, &path).is_some() {
                        rule_tgts.push(RuleTgt { rule: rid, tgt_idx: ti });
                    }
                }
            }
            let nd = eng.nodes.get_mut(node);
            nd.rule_tgts = rule_tgts;
            if nd.rule_tgts.is_empty() {
                Buildable::No
            } else {
                Buildable::Plain
            }
        }
    };
    let gen = eng.match_gen;
    let nd = eng.nodes.get_mut(node);
    nd.buildable = buildable;
    nd.match_gen = gen;
    debug!(node = %path, ?buildable, "matched");
}

/// A path is uphill when one of its ancestors can itself be a file.
fn is_uphill(eng: &Engine, path: &str) -> bool {
    let mut rest = path;
    while let Some((dir, _)) = rest.rsplit_once('/') {
        if eng.srcs.classify(dir) == Some(Buildable::Src)
            || eng.srcs.classify(dir) == Some(Buildable::SubSrc)
        {
            return true;
        }
        for &rid in &eng.rule_order {
            let r = eng.rules.get(rid);
            for ti in 0..r.targets.len() {
                if r.match_target(ti, dir).is_some() {
                    return true;
                }
            }
        }
        rest = dir;
    }
    false
}

pub(crate) fn advance_node(eng: &mut Engine, node: NodeId, req: ReqId) {
    let goal = eng.reqs.get_mut(req).node_info(node).goal;
    let buildable = eng.nodes.get(node).buildable;
    match buildable {
        Buildable::Src | Buildable::SubSrc => {
            if goal >= Goal::Status {
                refresh_from_disk(eng, node);
            }
            eng.nodes.get_mut(node).status = NodeStatus::Src;
            finish_node(eng, node, req);
        }
        Buildable::SrcDir | Buildable::Anti | Buildable::Decode | Buildable::Encode
        | Buildable::Yes => {
            finish_node(eng, node, req);
        }
        Buildable::No => {
            // The file may still exist (manual or dangling): its content is
            // taken as found.
            if goal >= Goal::Status {
                refresh_from_disk(eng, node);
            }
            finish_node(eng, node, req);
        }
        Buildable::Plain => advance_plain(eng, node, req),
    }
}

fn advance_plain(eng: &mut Engine, node: NodeId, req: ReqId) {
    ensure_candidates(eng, node);
    loop {
        let (goal, prio_idx, n_wait) = {
            let ri = eng.reqs.get_mut(req).node_info(node);
            (ri.goal, ri.prio_idx, ri.n_wait)
        };
        if n_wait > 0 {
            return; // candidates still running
        }
        if goal == Goal::Makable {
            // Having candidate rules is enough to assert makability.
            finish_node(eng, node, req);
            return;
        }
        let groups = candidate_groups(eng, node);
        if prio_idx >= groups.len() {
            // Candidates exhausted with no producer; content as found.
            if goal >= Goal::Status {
                refresh_from_disk(eng, node);
            }
            if eng.nodes.get(node).actual_job.is_none() {
                eng.nodes.get_mut(node).status = NodeStatus::None;
            }
            finish_node(eng, node, req);
            return;
        }
        let group = groups[prio_idx].clone();
        let mut waiting = 0u32;
        for &job in &group {
            let done = make_job::job_make(eng, job, req, goal, Some(node));
            if !done {
                waiting += 1;
            }
        }
        if waiting > 0 {
            eng.reqs.get_mut(req).node_info(node).n_wait += waiting;
            return;
        }
        // Whole group settled synchronously: pick the producer.
        let producers: Vec<JobId> =
            group.iter().copied().filter(|&j| job_produces(eng, j, node)).collect();
        let errors: Vec<JobId> = group
            .iter()
            .copied()
            .filter(|&j| {
                let jd = eng.jobs.get(j);
                (jd.status.is_err() && !jd.status.is_frozen()) || jd.run_status.is_err()
            })
            .collect();
        match producers.len() {
            0 if !errors.is_empty() => {
                eng.nodes.get_mut(node).conform_job = Some(errors[0]);
                finish_node(eng, node, req);
                return;
            }
            0 => {
                eng.reqs.get_mut(req).node_info(node).prio_idx += 1;
                continue;
            }
            1 => {
                let producer = producers[0];
                {
                    let nd = eng.nodes.get_mut(node);
                    nd.conform_job = Some(producer);
                    nd.status = NodeStatus::Plain;
                }
                // Frozen jobs behave as sources: their targets are taken
                // as found on disk.
                if eng.jobs.get(producer).is_frozen() {
                    refresh_from_disk(eng, node);
                }
                finish_node(eng, node, req);
                return;
            }
            _ => {
                let path = eng.names.node_name(node).to_string();
                warn!(node = %path, "several jobs claim this node at equal priority");
                eng.nodes.get_mut(node).status = NodeStatus::Multi;
                eng.reqs.get_mut(req).audit(
                    AuditKind::Warn,
                    None,
                    format!("{path} is claimed by several jobs at equal priority"),
                );
                eng.nodes.get_mut(node).conform_job = Some(producers[0]);
                finish_node(eng, node, req);
                return;
            }
        }
    }
}

/// Did this job (as last recorded) produce the node?
fn job_produces(eng: &Engine, job: JobId, node: NodeId) -> bool {
    let jd = eng.jobs.get(job);
    if jd.run_status != RunStatus::Complete {
        return false;
    }
    if jd.status.is_err() && !jd.status.is_frozen() {
        return false;
    }
    if jd.status == crate::digest::Status::New {
        return false;
    }
    if eng.names.job_name(job).target == node {
        return true;
    }
    jd.targets.iter().any(|t| t.node == node && t.tflags.has(TargetFlags::TARGET))
}

/// Instantiate candidate jobs from the node's matched rule targets.
fn ensure_candidates(eng: &mut Engine, node: NodeId) {
    if !eng.nodes.get(node).job_tgts.is_empty() || eng.nodes.get(node).rule_tgts.is_empty() {
        return;
    }
    let rts = eng.nodes.get(node).rule_tgts.clone();
    let path = eng.names.node_name(node).to_string();
    let mut candidates: Vec<JobId> = Vec::new();
    for rt in rts {
        let Some(stems) = eng.rules.get(rt.rule).match_target(rt.tgt_idx, &path) else {
            continue;
        };
        let official = {
            let r = eng.rules.get(rt.rule);
            let oi = r.official_tgt_idx();
            rule::subst(&r.targets[oi].pattern, &stems)
        };
        let onode = eng.node(&official);
        let job = intern_job(eng, onode, rt.rule, stems);
        if !candidates.contains(&job) {
            candidates.push(job);
        }
    }
    eng.nodes.get_mut(node).job_tgts = candidates;
}

/// Intern a job, creating its record (with resolved static deps) on first
/// mention.
pub(crate) fn intern_job(
    eng: &mut Engine,
    official: NodeId,
    rule: crate::store::RuleId,
    stems: Vec<(String, String)>,
) -> JobId {
    if let Some(j) = eng.names.lookup_job(official, rule) {
        return j;
    }
    let j = eng.names.intern_job(official, rule);
    let specs = eng.rules.get(rule).deps.clone();
    let mut deps = DepsVec::new();
    for spec in &specs {
        let p = rule::subst(&spec.pattern, &stems);
        let n = eng.node(&p);
        deps.push(Dep::new(n, Accesses::data(), spec.dflags, false));
    }
    let allocated = eng.jobs.push(JobData::new(rule, stems, deps));
    debug_assert_eq!(allocated, j);
    debug!(job = j.index(), rule = %eng.rules.get(rule).name, "job created");
    j
}

/// Candidates grouped by rule priority (input is priority ordered).
fn candidate_groups(eng: &Engine, node: NodeId) -> Vec<Vec<JobId>> {
    let mut groups: Vec<Vec<JobId>> = Vec::new();
    let mut last_prio: Option<i32> = None;
    for &job in &eng.nodes.get(node).job_tgts {
        let prio = eng.rules.get(eng.jobs.get(job).rule).prio;
        if last_prio == Some(prio) {
            groups.last_mut().expect("group exists").push(job);
        } else {
            groups.push(vec![job]);
            last_prio = Some(prio);
        }
    }
    groups
}

/// Probe the disk and refresh the node's CRC when its signature moved.
pub(crate) fn refresh_from_disk(eng: &mut Engine, node: NodeId) -> bool {
    let path = eng.root_dir.join(eng.names.node_name(node));
    let sig = FileSig::probe(&path);
    let nd = eng.nodes.get(node);
    if nd.crc.is_valid() && nd.sig == sig {
        return false; // CRC still trusted under the stored signature
    }
    let crc = if sig.exists() { Crc::compute(&path) } else { Crc::None };
    eng.nodes.get_mut(node).refresh(crc, sig)
}

/// Mark done at the current goal and wake watcher jobs.
pub(crate) fn finish_node(eng: &mut Engine, node: NodeId, req: ReqId) {
    let watchers = {
        let ri = eng.reqs.get_mut(req).node_info(node);
        if ri.done < ri.goal {
            ri.done = ri.goal;
        }
        std::mem::take(&mut ri.watchers)
    };
    for job in watchers {
        make_job::job_wakeup(eng, job, req);
    }
}

/// Audit a dependency cycle with a diagram pointing at the re-entry node.
fn report_cycle(eng: &mut Engine, node: NodeId, req: ReqId) {
    if !eng.cycle_nodes.insert(node) {
        return; // already reported
    }
    let start = eng
        .stack
        .iter()
        .position(|f| *f == StackFrame::Node(node))
        .unwrap_or(0);
    let mut lines = vec!["dependency cycle:".to_string()];
    for (i, frame) in eng.stack[start..].iter().enumerate() {
        let name = match frame {
            StackFrame::Node(n) => eng.names.node_name(*n).to_string(),
            StackFrame::Job(j) => {
                let rule = eng.rules.get(eng.jobs.get(*j).rule).name.clone();
                let tgt = eng.names.node_name(eng.names.job_name(*j).target);
                format!("{tgt}+{rule}")
            }
        };
        if i == 0 {
            lines.push(format!("  +-> {name}"));
        } else {
            lines.push(format!("  |   {name}"));
        }
    }
    lines.push(format!("  +-- {} (re-entry)", eng.names.node_name(node)));
    warn!(node = %eng.names.node_name(node), "dependency cycle detected");
    let rd = eng.reqs.get_mut(req);
    for line in lines {
        rd.audit(AuditKind::Err, None, line);
    }
    // The node completes in error so the walk can unwind.
    let ri = eng.reqs.get_mut(req).node_info(node);
    if ri.done < ri.goal {
        ri.done = ri.goal;
    }
}
