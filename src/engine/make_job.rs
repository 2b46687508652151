// src/engine/make_job.rs

//! Job-side make: dep traversal with critical sections, cache probing,
//! submission, and end-processing.

use tracing::{debug, info, warn};

use crate::cache::{CacheMatch, DepLookup, EntryData};
use crate::digest::{Bool3, JobDigest, Status, TargetFlags};
use crate::engine::make_node::{node_make, node_wakeup};
use crate::engine::{Engine, EngineAction, RunningJob, StackFrame};
use crate::hash::{Crc, DepValue, FileDate, FileSig};
use crate::req::{AuditKind, Goal, JobLvl, JobReport};
use crate::rule;
use crate::store::deps::{Dep, DepsVec};
use crate::store::idx::Idx;
use crate::store::{JobId, JobReason, NodeId, NodeStatus, ReasonTag, ReqId, RunStatus, Target};
use crate::wash::{self, WashTarget};

/// How many reruns a job is granted per request before giving up.
const MAX_RERUNS: u8 = 3;

/// Bring `job` toward `goal` for `req`.
///
/// Returns true when the job is done; otherwise `watcher` (a node awaiting
/// this job) is registered for wake-up.
pub fn job_make(
    eng: &mut Engine,
    job: JobId,
    req: ReqId,
    goal: Goal,
    watcher: Option<NodeId>,
) -> bool {
    {
        let ji = eng.reqs.get_mut(req).job_info(job);
        if ji.done() {
            return true;
        }
        if goal > ji.goal {
            ji.goal = goal;
        }
        if ji.running() {
            if let Some(w) = watcher {
                if !ji.watchers.contains(&w) {
                    ji.watchers.push(w);
                }
            }
            return false;
        }
    }
    if eng.stack.contains(&StackFrame::Job(job)) {
        // Cycle through this job: its official target is the re-entry
        // point; complete in error so the walk unwinds.
        let tgt = eng.names.job_name(job).target;
        eng.cycle_nodes.insert(tgt);
        let name = eng.names.node_name(tgt).to_string();
        let rd = eng.reqs.get_mut(req);
        rd.audit(AuditKind::Err, Some(job), format!("dependency cycle through {name}"));
        rd.job_info(job).lvl = JobLvl::Done;
        return true;
    }
    eng.stack.push(StackFrame::Job(job));
    advance_job(eng, job, req);
    eng.stack.pop();
    let ji = eng.reqs.get_mut(req).job_info(job);
    if ji.done() {
        true
    } else {
        if let Some(w) = watcher {
            if !ji.watchers.contains(&w) {
                ji.watchers.push(w);
            }
        }
        false
    }
}

/// A watched dep completed; resume analysis when nothing is outstanding.
pub(crate) fn job_wakeup(eng: &mut Engine, job: JobId, req: ReqId) {
    let resume = {
        let ji = eng.reqs.get_mut(req).job_info(job);
        ji.n_wait = ji.n_wait.saturating_sub(1);
        ji.n_wait == 0 && matches!(ji.lvl, JobLvl::None | JobLvl::Dep)
    };
    if resume {
        advance_job(eng, job, req);
    }
}

pub(crate) fn advance_job(eng: &mut Engine, job: JobId, req: ReqId) {
    let lvl = eng.reqs.get_mut(req).job_info(job).lvl;
    match lvl {
        JobLvl::None => {
            enter_job(eng, job, req);
            let lvl = eng.reqs.get_mut(req).job_info(job).lvl;
            if lvl == JobLvl::Dep {
                analyse(eng, job, req);
            }
        }
        JobLvl::Dep => analyse(eng, job, req),
        JobLvl::Queued | JobLvl::Exec | JobLvl::End | JobLvl::Done => {}
    }
}

/// First entry: classify why the job might have to run.
fn enter_job(eng: &mut Engine, job: JobId, req: ReqId) {
    let (force, cmd_gen, rsrcs_gen) = {
        let r = eng.rules.get(eng.jobs.get(job).rule);
        (r.force, r.cmd_gen, r.rsrcs_gen)
    };
    let jd = eng.jobs.get(job);
    let frozen = jd.is_frozen();
    let mut reason = JobReason::default();
    if !frozen {
        if force {
            reason = reason.merge(JobReason::new(ReasonTag::Force));
        }
        if jd.status == Status::New {
            reason = reason.merge(JobReason::new(ReasonTag::New));
        } else if jd.cmd_gen != cmd_gen {
            reason = reason.merge(JobReason::new(ReasonTag::Cmd));
        } else if jd.status.is_err() {
            reason = reason.merge(JobReason::new(ReasonTag::OldError));
        } else if jd.rsrcs_gen != rsrcs_gen {
            reason = reason.merge(JobReason::new(ReasonTag::Rsrcs));
        } else if jd.status.is_garbage() {
            reason = reason.merge(JobReason::new(ReasonTag::Garbage));
        }
    }
    let ji = eng.reqs.get_mut(req).job_info(job);
    ji.reason = ji.reason.merge(reason);
    ji.lvl = JobLvl::Dep;
    ji.dep_lvl = 0;
    ji.disk_pass = false;
    ji.in_critical = false;
    ji.section_modified = false;
    ji.speculate = Bool3::Yes;
    debug!(job = job.index(), reason = ?ji.reason.tag, "job entered");
}

/// The dep traversal loop.
///
/// Deps are walked in declaration order, one parallel group at a time.
/// A critical section starts at a critical dep; when a section saw a
/// modified dep and a further critical section begins, everything from
/// that boundary on is discarded (a rerun may open a different set of
/// non-critical deps) and the walk restarts at the front with a disk goal.
fn analyse(eng: &mut Engine, job: JobId, req: ReqId) {
    loop {
        let (dep_lvl, disk_pass) = {
            let ji = eng.reqs.get_mut(req).job_info(job);
            if ji.n_wait > 0 {
                return; // something is already outstanding
            }
            (ji.dep_lvl, ji.disk_pass)
        };
        let deps_len = eng.jobs.get(job).deps.len();
        if dep_lvl >= deps_len {
            break;
        }
        // Collect the parallel group starting here.
        let group: Vec<Dep> = {
            let jd = eng.jobs.get(job);
            let mut g = vec![*jd.deps.get(dep_lvl).expect("dep_lvl in range")];
            let mut k = dep_lvl + 1;
            while k < deps_len {
                let d = *jd.deps.get(k).expect("k in range");
                if !d.parallel {
                    break;
                }
                g.push(d);
                k += 1;
            }
            g
        };
        let group_end = dep_lvl + group.len();

        // A critical dep opens a new critical section.
        if group[0].dflags.critical() {
            let ji = eng.reqs.get_mut(req).job_info(job);
            ji.in_critical = true;
            ji.section_modified = false;
        }

        // Drive every dep of the group, speculatively past errors.
        let dep_goal = if disk_pass { Goal::Dsk } else { Goal::Status };
        let speculate = {
            let ji = eng.reqs.get_mut(req).job_info(job);
            if ji.reason.is_err() {
                Bool3::Maybe
            } else {
                ji.speculate
            }
        };
        let mut waiting = 0u32;
        let mut seen: Vec<NodeId> = Vec::new();
        for dep in &group {
            if seen.contains(&dep.node) {
                continue;
            }
            seen.push(dep.node);
            let done = node_make(eng, dep.node, req, dep_goal, Some(job));
            {
                let ri = eng.reqs.get_mut(req).node_info(dep.node);
                ri.speculate = ri.speculate.min(speculate);
            }
            if !done {
                waiting += 1;
            }
        }
        if waiting > 0 {
            eng.reqs.get_mut(req).job_info(job).n_wait += waiting;
            return; // suspended; wake-ups resume here
        }

        // Group settled: evaluate each dep.
        let mut reason_acc = JobReason::default();
        let mut modified_any = false;
        for dep in &group {
            let err = eng.node_err(dep.node);
            if err && !dep.dflags.has(crate::digest::DepFlags::IGNORE_ERROR) {
                reason_acc = reason_acc.merge(JobReason::with_node(ReasonTag::DepErr, dep.node));
                continue;
            }
            let nd = eng.nodes.get(dep.node);
            if dep.dflags.is_static() && !nd.crc.exists() && !nd.buildable.has_jobs() {
                reason_acc =
                    reason_acc.merge(JobReason::with_node(ReasonTag::StaticDepMissing, dep.node));
                continue;
            }
            match dep.value {
                DepValue::Crc(Crc::Unknown) => {
                    // Never snapshotted: the job runs for its own reasons
                    // (New/Cmd); nothing to compare yet.
                }
                DepValue::Crc(_) => {
                    if !nd.value_matches(dep.value, dep.accesses) {
                        modified_any = true;
                        reason_acc =
                            reason_acc.merge(JobReason::with_node(ReasonTag::DepChanged, dep.node));
                    }
                }
                DepValue::Sig(_) => {
                    if !nd.value_matches(dep.value, dep.accesses) {
                        modified_any = true;
                        reason_acc = reason_acc
                            .merge(JobReason::with_node(ReasonTag::DepOutOfDate, dep.node));
                    }
                }
            }
        }
        let truncate = {
            let ji = eng.reqs.get_mut(req).job_info(job);
            ji.modified |= modified_any;
            ji.section_modified |= modified_any;
            ji.reason = ji.reason.merge(reason_acc);
            ji.dep_lvl = group_end;
            ji.in_critical && ji.section_modified && group_end < deps_len
        };
        if truncate {
            // The rerun may open a different set of non-critical deps:
            // drop everything past the modified group and restart the walk
            // at the front with a disk goal so the critical deps rebuild
            // before anything else is looked at.
            debug!(
                job = job.index(),
                kept = group_end,
                dropped = deps_len - group_end,
                "truncating deps after modified critical group"
            );
            eng.jobs.get_mut(job).deps.truncate(group_end);
            let ji = eng.reqs.get_mut(req).job_info(job);
            ji.dep_lvl = 0;
            ji.disk_pass = true;
            ji.goal = Goal::Dsk;
            ji.in_critical = false;
            ji.section_modified = false;
        }
    }
    conclude(eng, job, req);
}

/// All deps analyzed: decide between up-to-date, preclusion, cache, and
/// submission.
fn conclude(eng: &mut Engine, job: JobId, req: ReqId) {
    let (goal, reason, disk_pass) = {
        let ji = eng.reqs.get_mut(req).job_info(job);
        (ji.goal, ji.reason, ji.disk_pass)
    };
    let frozen = eng.jobs.get(job).is_frozen();

    if reason.is_err() {
        let rs = match reason.tag {
            ReasonTag::StaticDepMissing => RunStatus::NoDep,
            _ => RunStatus::DepErr,
        };
        eng.jobs.get_mut(job).run_status = rs;
        audit_preclusion(eng, job, req, reason);
        finish_job(eng, job, req, Some(JobReport::Failed));
        return;
    }

    if !reason.is_set() || frozen || goal == Goal::Makable {
        eng.jobs.get_mut(job).run_status = RunStatus::Complete;
        finish_job(eng, job, req, None);
        return;
    }

    // The job has to run. Try the cache before touching the disk.
    if !disk_pass {
        let cache_probed = eng.reqs.get_mut(req).job_info(job).cache_probed;
        if eng.cache.is_some() && !cache_probed {
            match probe_cache(eng, job, req) {
                Probe::Settled => return,
                Probe::Miss => {}
            }
        }
        // Deps were only checked; bring them to disk before execution.
        let ji = eng.reqs.get_mut(req).job_info(job);
        ji.disk_pass = true;
        ji.dep_lvl = 0;
        ji.in_critical = false;
        ji.section_modified = false;
        analyse(eng, job, req);
        return;
    }

    submit(eng, job, req);
}

enum Probe {
    /// Hit handled, or suspended on new deps; caller returns.
    Settled,
    Miss,
}

/// Probe the content cache, resolving `Maybe` deps until hit, miss, or
/// suspension.
fn probe_cache(eng: &mut Engine, job: JobId, req: ReqId) -> Probe {
    let job_name = {
        let rule = eng.rules.get(eng.jobs.get(job).rule);
        eng.names.job_full_name(job, &rule.name)
    };
    let mut last_new: Vec<String> = Vec::new();
    loop {
        let cache = eng.cache.take().expect("probe without cache");
        let outcome = cache.match_job(&job_name, |f| match eng.names.lookup_node(f) {
            Some(id) => {
                let done = eng
                    .reqs
                    .get(req)
                    .node_infos
                    .get(&id)
                    .map_or(false, |ri| ri.done_for(Goal::Status));
                let crc = eng.nodes.get(id).crc;
                if done && crc.is_valid() {
                    DepLookup::Crc(crc)
                } else {
                    DepLookup::NotDone
                }
            }
            None => DepLookup::NotDone,
        });
        eng.cache = Some(cache);
        match outcome {
            CacheMatch::Hit(key) => {
                if download_hit(eng, job, req, &key) {
                    return Probe::Settled;
                }
                // Unreadable entry degrades to a miss.
                eng.reqs.get_mut(req).job_info(job).cache_probed = true;
                return Probe::Miss;
            }
            CacheMatch::Miss => {
                eng.reqs.get_mut(req).job_info(job).cache_probed = true;
                return Probe::Miss;
            }
            CacheMatch::Maybe(new_deps) => {
                if new_deps == last_new {
                    // No progress; treat as miss rather than spin.
                    eng.reqs.get_mut(req).job_info(job).cache_probed = true;
                    return Probe::Miss;
                }
                let mut waiting = 0u32;
                for f in &new_deps {
                    let n = eng.node(f);
                    if !node_make(eng, n, req, Goal::Status, Some(job)) {
                        waiting += 1;
                    }
                }
                if waiting > 0 {
                    eng.reqs.get_mut(req).job_info(job).n_wait += waiting;
                    return Probe::Settled; // resumed via wake-up
                }
                last_new = new_deps;
            }
        }
    }
}

/// Download a cache hit and fold it in as if the job had just ended.
fn download_hit(eng: &mut Engine, job: JobId, req: ReqId, key: &str) -> bool {
    let workspace = eng.root_dir.clone();
    let cache = eng.cache.take().expect("download without cache");
    let result = cache.download(key, &workspace);
    eng.cache = Some(cache);
    let (data, _sigs): (EntryData, Vec<(String, FileSig)>) = match result {
        Ok(ok) => ok,
        Err(e) => {
            warn!(key, error = %e, "cache download failed; degrading to miss");
            return false;
        }
    };
    info!(job = job.index(), key, "cache hit");
    end_process_global(eng, job, &data.digest, FileDate::now());
    let rd = eng.reqs.get_mut(req);
    rd.audit(AuditKind::Note, Some(job), "cache hit");
    rd.job_info(job).reason = JobReason::default();
    finish_job(eng, job, req, Some(JobReport::Hit));
    true
}

/// Declared (non-star) targets of a job, resolved on its stems, plus the
/// star targets recorded by previous runs.
pub(crate) fn declared_targets(eng: &Engine, job: JobId) -> Vec<(String, TargetFlags)> {
    let jd = eng.jobs.get(job);
    let r = eng.rules.get(jd.rule);
    let mut out = Vec::new();
    for t in &r.targets {
        if t.star {
            continue;
        }
        out.push((rule::subst(&t.pattern, &jd.stems), t.tflags));
    }
    for t in &jd.targets {
        let path = eng.names.node_name(t.node).to_string();
        if !out.iter().any(|(p, _)| *p == path) {
            out.push((path, t.tflags));
        }
    }
    out
}

/// Flags for an observed target path: declared flags when it matches a
/// declared pattern, `None` otherwise.
fn observed_tflags(eng: &Engine, job: JobId, path: &str) -> Option<TargetFlags> {
    let jd = eng.jobs.get(job);
    let r = eng.rules.get(jd.rule);
    for (ti, t) in r.targets.iter().enumerate() {
        if t.star {
            if r.match_target(ti, path).is_some() {
                return Some(t.tflags);
            }
        } else if rule::subst(&t.pattern, &jd.stems) == path {
            return Some(t.tflags);
        }
    }
    None
}

/// Wash targets and hand the job to the backend.
fn submit(eng: &mut Engine, job: JobId, req: ReqId) {
    // Already running for another request: just wait on it.
    if let Some(running) = eng.running.get_mut(&job) {
        if !running.reqs.contains(&req) {
            running.reqs.push(req);
        }
        let rd = eng.reqs.get_mut(req);
        rd.stats.queued += 1;
        rd.job_info(job).lvl = JobLvl::Queued;
        return;
    }

    let targets = declared_targets(eng, job);
    let mut wash_targets = Vec::with_capacity(targets.len());
    for (path, tflags) in &targets {
        let node = eng.node(path);
        let nd = eng.nodes.get(node);
        let abs = eng.root_dir.join(path);
        let sig = FileSig::probe(&abs);
        let manual = sig.exists() && (!nd.crc.is_valid() || nd.sig != sig);
        let claimed_by_other = nd.actual_job.map_or(false, |j| j != job);
        wash_targets.push(WashTarget {
            path: path.clone(),
            tflags: *tflags,
            claimed_by_other,
            manual,
        });
    }
    let target_dirs = eng.target_dirs.clone();
    let report = match wash::wash(&eng.root_dir, &wash_targets, &target_dirs) {
        Ok(r) => r,
        Err(e) => {
            warn!(job = job.index(), error = %e, "wash failed");
            eng.jobs.get_mut(job).run_status = RunStatus::TargetErr;
            eng.jobs.get_mut(job).status = Status::SystemErr;
            finish_job(eng, job, req, Some(JobReport::Failed));
            return;
        }
    };
    {
        let rd = eng.reqs.get_mut(req);
        for w in &report.warnings {
            rd.audit(AuditKind::Warn, Some(job), w.clone());
        }
    }
    if !report.manual_errs.is_empty() {
        let files = report.manual_errs.join(", ");
        eng.jobs.get_mut(job).run_status = RunStatus::TargetErr;
        let rd = eng.reqs.get_mut(req);
        rd.audit(
            AuditKind::Err,
            Some(job),
            format!("manually edited target(s) would be overwritten: {files}"),
        );
        finish_job(eng, job, req, Some(JobReport::Failed));
        return;
    }

    let start_date = FileDate::now();
    eng.running.insert(
        job,
        RunningJob { reqs: vec![req], start_date, created_dirs: report.created_dirs },
    );
    {
        let jd = eng.jobs.get_mut(job);
        jd.start_date = start_date;
    }
    let rule = eng.jobs.get(job).rule;
    {
        let rd = eng.reqs.get_mut(req);
        rd.stats.queued += 1;
        *rd.remaining.entry(rule).or_insert(0) += 1;
        rd.job_info(job).lvl = JobLvl::Queued;
    }
    let now = FileDate::now();
    let rules = std::mem::take(&mut eng.rules);
    let changed = eng.reqs.refresh_etas(now, &rules);
    eng.rules = rules;
    if changed {
        eng.actions.push(EngineAction::EtaChanged);
    }
    info!(job = job.index(), req = req.index(), "job submitted");
    eng.actions.push(EngineAction::Submit { job, req });
}

/// Backend reported this job's end (or it was lost / killed).
pub(crate) fn job_ended(eng: &mut Engine, job: JobId, digest: JobDigest) {
    let (reqs_waiting, start_date, created_dirs) = match eng.running.remove(&job) {
        Some(r) => (r.reqs, r.start_date, r.created_dirs),
        None => {
            warn!(job = job.index(), "end for a job not running; dropped");
            return;
        }
    };
    let summary = end_process_global(eng, job, &digest, start_date);
    let target_dirs = eng.target_dirs.clone();
    wash::cleanup(&eng.root_dir, &created_dirs, &target_dirs);

    if summary.status.is_ok() && !eng.jobs.get(job).targets.is_empty() {
        upload_to_cache(eng, job, &digest);
    }

    for req in reqs_waiting {
        if eng.reqs.lookup(req).is_none() {
            continue;
        }
        per_req_end(eng, job, req, &summary, &digest);
        eng.maybe_finish_req(req);
    }

    let now = FileDate::now();
    let rules = std::mem::take(&mut eng.rules);
    let changed = eng.reqs.refresh_etas(now, &rules);
    eng.rules = rules;
    if changed {
        eng.actions.push(EngineAction::EtaChanged);
    }
}

pub(crate) struct EndSummary {
    pub status: Status,
    pub modified: bool,
    pub end_reason: JobReason,
}

/// Store-level part of end-processing: fold the digest into the node/job
/// records. Shared between real runs and cache downloads.
pub(crate) fn end_process_global(
    eng: &mut Engine,
    job: JobId,
    digest: &JobDigest,
    start_date: FileDate,
) -> EndSummary {
    let end_date = FileDate::now();
    let rule_id = eng.jobs.get(job).rule;
    eng.rules.get_mut(rule_id).record_exec_time(digest.stats.job);

    let mut end_reason = JobReason::default();
    let mut modified = false;

    // Targets: refresh nodes, detect clashes, adopt ownership.
    let mut new_targets: Vec<Target> = Vec::new();
    for (path, td) in &digest.targets {
        let node = eng.node(path);
        let tflags = match observed_tflags(eng, job, path) {
            Some(f) => f.union(td.tflags),
            None => {
                let rd_path = path.clone();
                let reqs: Vec<ReqId> = eng.reqs.open_reqs().to_vec();
                for r in reqs {
                    eng.reqs.get_mut(r).audit(
                        AuditKind::Warn,
                        Some(job),
                        format!("unexpected write to {rd_path}"),
                    );
                }
                td.tflags.union(TargetFlags::CRC)
            }
        };
        // Clash: another job wrote this node with an overlapping interval.
        if let Some(other) = eng.nodes.get(node).actual_job {
            let overlap = other != job && eng.jobs.get(other).overlaps(start_date, end_date);
            if overlap && tflags.has(TargetFlags::CRC) {
                record_clash(eng, node, job, other);
                end_reason = end_reason.merge(JobReason::with_node(ReasonTag::ClashTarget, node));
            }
        }
        let abs = eng.root_dir.join(path);
        let sig = FileSig::probe(&abs);
        let crc = if td.crc.is_valid() {
            td.crc
        } else if sig.exists() {
            Crc::compute(&abs)
        } else {
            Crc::None
        };
        modified |= eng.nodes.get_mut(node).refresh(crc, sig);
        let nd = eng.nodes.get_mut(node);
        nd.actual_job = Some(job);
        nd.conform_job = Some(job);
        nd.status = NodeStatus::Plain;
        new_targets.push(Target { node, tflags });
    }
    // Declared targets the digest did not mention (jobs observed without a
    // shim report nothing): probe them from disk.
    for (path, tflags) in declared_targets(eng, job) {
        let node = eng.node(&path);
        if new_targets.iter().any(|t| t.node == node) {
            continue;
        }
        let abs = eng.root_dir.join(&path);
        let sig = FileSig::probe(&abs);
        let crc = if sig.exists() { Crc::compute(&abs) } else { Crc::None };
        modified |= eng.nodes.get_mut(node).refresh(crc, sig);
        if sig.exists() {
            let nd = eng.nodes.get_mut(node);
            nd.actual_job = Some(job);
            nd.conform_job = Some(job);
            nd.status = NodeStatus::Plain;
        } else if tflags.has(TargetFlags::ESSENTIAL) && !tflags.has(TargetFlags::PHONY) {
            end_reason = end_reason.merge(JobReason::with_node(ReasonTag::NoTarget, node));
        }
        new_targets.push(Target { node, tflags });
    }
    eng.jobs.get_mut(job).targets = new_targets;

    // Deps: rebuild the vector as refreshed statics + resolved hidden deps.
    let static_specs = eng.rules.get(rule_id).deps.clone();
    let stems = eng.jobs.get(job).stems.clone();
    let mut deps = DepsVec::new();
    let mut static_nodes: Vec<NodeId> = Vec::new();
    for spec in &static_specs {
        let p = rule::subst(&spec.pattern, &stems);
        let node = eng.node(&p);
        let crc = eng.nodes.get(node).crc;
        deps.push(Dep {
            node,
            accesses: crate::digest::Accesses::data(),
            dflags: spec.dflags,
            parallel: false,
            value: DepValue::Crc(crc),
        });
        static_nodes.push(node);
    }
    let target_nodes: Vec<NodeId> =
        eng.jobs.get(job).targets.iter().map(|t| t.node).collect();
    for (path, dd) in &digest.deps {
        let node = eng.node(path);
        if let Some(i) = static_nodes.iter().position(|&n| n == node) {
            // Hidden report of a static dep: fold the accesses in.
            if let Some(d) = deps.get_mut(i) {
                d.accesses = d.accesses.union(dd.accesses);
            }
            continue;
        }
        if target_nodes.contains(&node) {
            // The dep overlaps a target of the same job.
            end_reason = end_reason.merge(JobReason::with_node(ReasonTag::ClashTarget, node));
            continue;
        }
        if !dd.is_crc() {
            // Hash now so date-known deps can be promoted while their
            // signature is still current.
            crate::engine::make_node::refresh_from_disk(eng, node);
        }
        let nd = eng.nodes.get(node);
        let value = if dd.is_crc() {
            dd.value
        } else if dd.value.sig() == Some(nd.sig) && nd.crc.is_valid() {
            // Signature still current: promote to CRC.
            DepValue::Crc(nd.crc)
        } else {
            dd.value
        };
        deps.push(Dep {
            node,
            accesses: dd.accesses,
            dflags: dd.dflags,
            parallel: dd.parallel,
            value,
        });
    }
    eng.jobs.get_mut(job).deps = deps;

    // Status demotion keeps outstanding reasons from being masked by Ok.
    let status = demote_status(digest.status, end_reason);
    let (cmd_gen, rsrcs_gen) = {
        let r = eng.rules.get(rule_id);
        (r.cmd_gen, r.rsrcs_gen)
    };
    let jd = eng.jobs.get_mut(job);
    jd.status = status;
    jd.run_status = RunStatus::Complete;
    jd.start_date = start_date;
    jd.end_date = end_date;
    jd.db_date = end_date;
    jd.exec_time = digest.stats.job;
    if status.is_ok() {
        jd.cmd_gen = cmd_gen;
        jd.rsrcs_gen = rsrcs_gen;
    }
    EndSummary { status, modified, end_reason }
}

/// `min(observed, Garbage)` under a local reason, `max(observed, Err)`
/// under an analysis error, observed otherwise.
fn demote_status(observed: Status, reason: JobReason) -> Status {
    if reason.is_err() {
        observed.max(Status::Err)
    } else if reason.is_set() {
        observed.min(Status::Garbage)
    } else {
        observed
    }
}

/// Both jobs wrote `node` concurrently.
fn record_clash(eng: &mut Engine, node: NodeId, j1: JobId, j2: JobId) {
    warn!(
        node = %eng.names.node_name(node),
        j1 = j1.index(),
        j2 = j2.index(),
        "concurrent writes to the same target"
    );
    let open: Vec<ReqId> = eng.reqs.open_reqs().to_vec();
    let name = eng.names.node_name(node).to_string();
    for req in open {
        let rd = eng.reqs.get_mut(req);
        if !(rd.job_infos.contains_key(&j1) || rd.job_infos.contains_key(&j2)) {
            continue;
        }
        rd.clash_nodes.insert(node);
        rd.audit(
            AuditKind::Warn,
            Some(j1),
            format!("{name} written concurrently by two jobs"),
        );
        for j in [j1, j2] {
            let ji = rd.job_info(j);
            ji.reason = ji.reason.merge(JobReason::with_node(ReasonTag::ClashTarget, node));
        }
    }
}

/// Per-request completion: stats, audit, rerun decision, wake-ups.
fn per_req_end(eng: &mut Engine, job: JobId, req: ReqId, summary: &EndSummary, digest: &JobDigest) {
    let rule = eng.jobs.get(job).rule;
    {
        let rd = eng.reqs.get_mut(req);
        rd.stats.exec = rd.stats.exec.saturating_sub(1);
        if let Some(n) = rd.remaining.get_mut(&rule) {
            *n = n.saturating_sub(1);
        }
    }
    let zombie = eng.reqs.get(req).zombie;
    let status = summary.status;

    // Reasons satisfied by the run are dropped; end reasons survive.
    let rerun_reason = match status {
        Status::ChkDeps => JobReason::new(ReasonTag::ChkDeps),
        Status::Lost => JobReason::new(ReasonTag::Lost),
        Status::Killed if !zombie => JobReason::new(ReasonTag::Killed),
        Status::Garbage => JobReason::new(ReasonTag::Garbage),
        _ => JobReason::default(),
    };
    let outstanding = rerun_reason.merge(summary.end_reason);
    let rerun_granted = {
        let ji = eng.reqs.get_mut(req).job_info(job);
        ji.reason = outstanding;
        outstanding.is_set() && !outstanding.is_err() && !zombie && ji.rerun_count < MAX_RERUNS
    };
    if rerun_granted {
        let node_name = outstanding.node.map(|n| eng.names.node_name(n).to_string());
        let rd = eng.reqs.get_mut(req);
        rd.stats.record(JobReport::Rerun);
        let why = match node_name {
            Some(n) => format!("{} : {}", outstanding.tag.msg(), n),
            None => outstanding.tag.msg().to_string(),
        };
        rd.audit(AuditKind::Note, Some(job), format!("rerun ({why})"));
        let ji = rd.job_info(job);
        ji.rerun_count += 1;
        ji.lvl = JobLvl::Dep;
        ji.dep_lvl = 0;
        ji.disk_pass = false;
        ji.cache_probed = false;
        ji.in_critical = false;
        ji.section_modified = false;
        advance_job(eng, job, req);
        return;
    }

    let report = if status.is_err() || status.is_garbage() {
        // Errors, and garbage-band ends that exhausted their reruns.
        JobReport::Failed
    } else if summary.modified {
        JobReport::Done
    } else {
        JobReport::Steady
    };
    if report == JobReport::Failed {
        audit_failure(eng, job, req, status, &digest.stderr);
    }
    finish_job(eng, job, req, Some(report));
}

/// One error block per failing job, capped by `max_err_lines` and
/// `stderr_len`.
fn audit_failure(eng: &mut Engine, job: JobId, req: ReqId, status: Status, stderr: &str) {
    let name = {
        let rule = eng.rules.get(eng.jobs.get(job).rule);
        eng.names.job_full_name(job, &rule.name)
    };
    let max_err_lines = eng.cfg.max_err_lines;
    let stderr_len = eng.cfg.stderr_len;
    let rd = eng.reqs.get_mut(req);
    rd.audit(AuditKind::Err, Some(job), format!("{name} : {status:?}"));
    let text: String = if stderr.len() > stderr_len {
        let mut end = stderr_len;
        while end > 0 && !stderr.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &stderr[..end])
    } else {
        stderr.to_string()
    };
    for line in text.lines().take(max_err_lines) {
        rd.audit(AuditKind::Err, Some(job), format!("  {line}"));
    }
}

fn audit_preclusion(eng: &mut Engine, job: JobId, req: ReqId, reason: JobReason) {
    let name = {
        let rule = eng.rules.get(eng.jobs.get(job).rule);
        eng.names.job_full_name(job, &rule.name)
    };
    let dep = reason.node.map(|n| eng.names.node_name(n).to_string());
    let speculate = eng.reqs.get_mut(req).job_info(job).speculate;
    if speculate < Bool3::Yes {
        return; // unconfirmed speculative branch; keep quiet
    }
    let rd = eng.reqs.get_mut(req);
    let text = match dep {
        Some(d) => format!("{name} : {} : {d}", reason.tag.msg()),
        None => format!("{name} : {}", reason.tag.msg()),
    };
    rd.audit(AuditKind::Err, Some(job), text);
}

fn upload_to_cache(eng: &mut Engine, job: JobId, digest: &JobDigest) {
    let Some(cache) = eng.cache.take() else { return };
    let (job_name, stems, cmd_crc) = {
        let jd = eng.jobs.get(job);
        let rule = eng.rules.get(jd.rule);
        (
            eng.names.job_full_name(job, &rule.name),
            jd.stems.clone(),
            rule.cmd_crc,
        )
    };
    // Record deps and targets with their post-resolution CRCs so matching
    // is content based, and so declared targets a shim-less job never
    // reported are still stored.
    let mut crc_digest = digest.clone();
    crc_digest.deps = eng
        .jobs
        .get(job)
        .deps
        .iter()
        .map(|d| {
            let name = eng.names.node_name(d.node).to_string();
            (
                name,
                crate::digest::DepDigest {
                    date: FileDate::default(),
                    accesses: d.accesses,
                    dflags: d.dflags,
                    parallel: d.parallel,
                    value: d.value,
                },
            )
        })
        .collect();
    crc_digest.targets = eng
        .jobs
        .get(job)
        .targets
        .iter()
        .filter(|t| eng.nodes.get(t.node).crc.exists())
        .map(|t| {
            let name = eng.names.node_name(t.node).to_string();
            (
                name,
                crate::digest::TargetDigest {
                    tflags: t.tflags,
                    accesses: crate::digest::Accesses::NONE,
                    write: true,
                    crc: eng.nodes.get(t.node).crc,
                },
            )
        })
        .collect();
    crc_digest.stderr = String::new();
    let target_names: Vec<String> =
        crc_digest.targets.iter().map(|(p, _)| p.clone()).collect();
    let sigs: Vec<(String, FileSig)> = target_names
        .iter()
        .map(|p| (p.clone(), FileSig::probe(&eng.root_dir.join(p))))
        .collect();
    let data = EntryData {
        job_name: job_name.clone(),
        stems,
        cmd_crc,
        digest: crc_digest,
        target_names,
    };
    match cache.upload(&job_name, &data, &eng.root_dir, &sigs) {
        Ok(true) => debug!(job = job.index(), "uploaded to cache"),
        Ok(false) => debug!(job = job.index(), "cache upload skipped"),
        Err(e) => warn!(job = job.index(), error = %e, "cache upload failed"),
    }
    eng.cache = Some(cache);
}

/// Terminal transition: stats before wake-ups, done level visible before
/// watchers run.
pub(crate) fn finish_job(eng: &mut Engine, job: JobId, req: ReqId, report: Option<JobReport>) {
    let watchers = {
        let rd = eng.reqs.get_mut(req);
        if let Some(r) = report {
            rd.stats.record(r);
        }
        let ji = rd.job_info(job);
        ji.lvl = JobLvl::Done;
        std::mem::take(&mut ji.watchers)
    };
    for node in watchers {
        node_wakeup(eng, node, req);
    }
}
