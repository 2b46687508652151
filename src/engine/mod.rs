// src/engine/mod.rs

//! The engine: state store plus the make state machine.
//!
//! All decisions that mutate the node/job store are serialized through one
//! logical owner (an `Engine` value); observations from backends and
//! gathers arrive as [`JobEvent`]s and outward effects leave as
//! [`EngineAction`]s, so the state machine itself is synchronous and
//! deterministic. The async runtime shell owns the channels.

pub mod make_job;
pub mod make_node;
pub mod runtime;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info, warn};

use crate::autodep::AutodepMethod;
use crate::cache::DirCache;
use crate::config::model::{BackendSection, ConfigFile, ConfigSection};
use crate::config::{spec_flags, strip_flags};
use crate::digest::{Bool3, DepFlags, JobDigest, Status, TargetFlags};
use crate::errors::{SysResult, SystemError};
use crate::hash::{Crc, FileDate};
use crate::req::{AuditKind, Goal, JobLvl, ReqRegistry};
use crate::rule::{DepSpec, RuleData, TargetSpec};
use crate::store::idx::Idx;
use crate::store::{
    Buildable, IdxMap, JobId, NameStore, NodeData, NodeId, ReqId, RuleId,
};
use crate::wash::TargetDirs;

/// Outward effect produced by a make pass, performed by the runtime shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Hand the job to the backend.
    Submit { job: JobId, req: ReqId },
    /// Forward a kill to the backend.
    KillJob { job: JobId },
    /// All targets of the request reached their goal.
    ReqDone { req: ReqId },
    /// The ETA order among open requests changed; notify backends.
    EtaChanged,
}

/// Observation fed into the engine.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started { job: JobId },
    Ended { job: JobId, digest: JobDigest },
    /// The job disappeared (lost heartbeat, backend died).
    Lost { job: JobId },
}

/// Declared sources: what is never built.
pub struct SourceSet {
    pub dirs: Vec<String>,
    pub files: HashSet<String>,
    pub anti: GlobSet,
}

impl SourceSet {
    pub fn from_config(cfg: &ConfigFile) -> SysResult<SourceSet> {
        let mut anti = GlobSetBuilder::new();
        for pat in &cfg.sources.anti {
            let glob = Glob::new(pat).map_err(|e| SystemError::BadRule {
                rule: "[sources]".to_string(),
                msg: format!("anti pattern {pat:?}: {e}"),
            })?;
            anti.add(glob);
        }
        Ok(SourceSet {
            dirs: cfg.sources.dirs.iter().map(|d| d.trim_end_matches('/').to_string()).collect(),
            files: cfg.sources.files.iter().cloned().collect(),
            anti: anti.build().map_err(|e| SystemError::BadRule {
                rule: "[sources]".to_string(),
                msg: e.to_string(),
            })?,
        })
    }

    /// Source/anti classification of a path, `None` when rules decide.
    pub fn classify(&self, path: &str) -> Option<Buildable> {
        if self.anti.is_match(path) {
            return Some(Buildable::Anti);
        }
        if self.files.contains(path) {
            return Some(Buildable::Src);
        }
        for dir in &self.dirs {
            if path == dir {
                return Some(Buildable::SrcDir);
            }
            if path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
            {
                return Some(Buildable::SubSrc);
            }
        }
        None
    }
}

/// Bookkeeping for a job currently handed to the backend.
#[derive(Debug, Default)]
pub struct RunningJob {
    /// Requests awaiting this execution.
    pub reqs: Vec<ReqId>,
    pub start_date: FileDate,
    /// Dirs created by washing, to fold up after the run.
    pub created_dirs: Vec<String>,
}

/// Frame of the synchronous analysis recursion, for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFrame {
    Node(NodeId),
    Job(JobId),
}

pub struct Engine {
    pub root_dir: PathBuf,
    pub cfg: ConfigSection,
    pub backend_cfg: BackendSection,
    pub names: NameStore,
    pub nodes: IdxMap<NodeId, NodeData>,
    pub jobs: IdxMap<JobId, crate::store::JobData>,
    pub rules: IdxMap<RuleId, RuleData>,
    /// Rules by decreasing priority (stable by name within a priority).
    pub rule_order: Vec<RuleId>,
    pub reqs: ReqRegistry,
    pub srcs: SourceSet,
    /// Bumped when rules change; invalidates node match caches.
    pub match_gen: u32,
    pub cache: Option<DirCache>,
    pub target_dirs: Arc<TargetDirs>,
    /// Effects for the runtime shell, drained after each entry point.
    pub actions: Vec<EngineAction>,
    pub running: HashMap<JobId, RunningJob>,
    /// Synchronous analysis stack, for cycle reporting.
    pub(crate) stack: Vec<StackFrame>,
    /// Nodes found on a dependency cycle this session.
    pub cycle_nodes: HashSet<NodeId>,
    /// Monotonic sequence id handed to executions.
    seq_id: u64,
}

impl Engine {
    pub fn new(root_dir: impl Into<PathBuf>, cfg: &ConfigFile) -> SysResult<Engine> {
        let root_dir = root_dir.into();
        let (rules, rule_order) = compile_rules(cfg)?;
        let srcs = SourceSet::from_config(cfg)?;
        let cache = match &cfg.config.cache_dir {
            Some(dir) => Some(DirCache::open(
                root_dir.join(dir),
                &root_dir.to_string_lossy(),
                cfg.config.cache_capacity,
            )?),
            None => None,
        };
        info!(n_rules = rule_order.len(), cached = cache.is_some(), "engine ready");
        Ok(Engine {
            root_dir,
            cfg: cfg.config.clone(),
            backend_cfg: cfg.backend.clone(),
            names: NameStore::new(),
            nodes: IdxMap::new(),
            jobs: IdxMap::new(),
            rules,
            rule_order,
            reqs: ReqRegistry::new(),
            srcs,
            match_gen: 1,
            cache,
            target_dirs: Arc::new(TargetDirs::new()),
            actions: Vec::new(),
            running: HashMap::new(),
            stack: Vec::new(),
            cycle_nodes: HashSet::new(),
            seq_id: 0,
        })
    }

    /// Intern a path, allocating its node record on first mention.
    pub fn node(&mut self, path: &str) -> NodeId {
        let id = self.names.intern_node(path);
        while self.nodes.lookup(id).is_none() && self.nodes.len() <= id.index() {
            self.nodes.push(NodeData::default());
        }
        id
    }

    /// Rules never change mid-session, but tests and config reloads bump
    /// the generation to invalidate cached match results.
    pub fn bump_match_gen(&mut self) {
        self.match_gen += 1;
        debug!(match_gen = self.match_gen, "match generation bumped");
    }

    /// Open a request for `targets` and run its initial make pass.
    pub fn open_req(&mut self, targets: &[String]) -> SysResult<ReqId> {
        let nodes: Vec<NodeId> = targets.iter().map(|t| self.node(t)).collect();
        let req = self.reqs.open(nodes.clone());
        for node in nodes {
            make_node::node_make(self, node, req, Goal::Dsk, None);
        }
        self.maybe_finish_req(req);
        Ok(req)
    }

    /// Kill a request: mark zombie, forward kills for jobs only it needs.
    pub fn kill_req(&mut self, req: ReqId) {
        if self.reqs.lookup(req).is_none() {
            return;
        }
        self.reqs.get_mut(req).zombie = true;
        let mut to_kill = Vec::new();
        for (&job, running) in &self.running {
            if running.reqs.contains(&req) && running.reqs.len() == 1 {
                to_kill.push(job);
            }
        }
        for job in to_kill {
            warn!(job = job.index(), "killing job for killed request");
            self.actions.push(EngineAction::KillJob { job });
        }
    }

    /// Backend observation entry point.
    pub fn job_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::Started { job } => self.job_started(job),
            JobEvent::Ended { job, digest } => make_job::job_ended(self, job, digest),
            JobEvent::Lost { job } => {
                warn!(job = job.index(), "job lost");
                let digest = JobDigest { status: Status::Lost, ..JobDigest::default() };
                make_job::job_ended(self, job, digest);
            }
        }
    }

    fn job_started(&mut self, job: JobId) {
        let reqs: Vec<ReqId> = match self.running.get(&job) {
            Some(r) => r.reqs.clone(),
            None => return,
        };
        for req in reqs {
            if self.reqs.lookup(req).is_none() {
                continue;
            }
            let rd = self.reqs.get_mut(req);
            let ji = rd.job_info(job);
            if ji.lvl == JobLvl::Queued {
                ji.lvl = JobLvl::Exec;
                rd.stats.queued = rd.stats.queued.saturating_sub(1);
                rd.stats.exec += 1;
            }
        }
    }

    /// Answer a synchronous `ChkDeps` query for a running job: `Yes` when
    /// every recorded dep is done ok, `No` on a dep in error, `Maybe` when
    /// some dep is not ready yet (the job should rerun later).
    pub fn chk_deps(&mut self, job: JobId, req: ReqId) -> Bool3 {
        let deps: Vec<NodeId> = self.jobs.get(job).deps.iter().map(|d| d.node).collect();
        let mut ok = Bool3::Yes;
        for node in deps {
            if self.node_err(node) {
                return Bool3::No;
            }
            let done = self
                .reqs
                .get_mut(req)
                .node_info(node)
                .done_for(Goal::Status);
            if !done {
                ok = Bool3::Maybe;
            }
        }
        ok
    }

    /// Answer one synchronous query frame from a running job.
    pub fn consult(
        &mut self,
        job: JobId,
        frame: &crate::autodep::AccessFrame,
    ) -> crate::autodep::AccessReply {
        use crate::autodep::{AccessProc, AccessReply};
        // A job needed only by killed requests is told to stop.
        if let Some(running) = self.running.get(&job) {
            let all_zombie = !running.reqs.is_empty()
                && running
                    .reqs
                    .iter()
                    .all(|r| self.reqs.lookup(*r).map_or(true, |rd| rd.zombie));
            if all_zombie {
                return AccessReply::Kill;
            }
        }
        match frame.proc {
            AccessProc::DepCrcs => {
                let files: Vec<String> = frame.files.iter().map(|(f, _)| f.clone()).collect();
                AccessReply::DepCrcs { crcs: self.dep_crcs(&files) }
            }
            AccessProc::ChkDeps => {
                let req = self.running.get(&job).and_then(|r| r.reqs.first()).copied();
                match req {
                    Some(r) => AccessReply::ChkDeps { ok: self.chk_deps(job, r) },
                    None => AccessReply::ChkDeps { ok: Bool3::Yes },
                }
            }
            _ => AccessReply::Ok,
        }
    }

    /// Answer a synchronous `DepCrcs` query: the engine's current CRC for
    /// each listed file.
    pub fn dep_crcs(&mut self, files: &[String]) -> Vec<Crc> {
        files
            .iter()
            .map(|f| {
                let id = self.node(f);
                self.nodes.get(id).crc
            })
            .collect()
    }

    /// Is this node in error state for make purposes?
    pub(crate) fn node_err(&self, node: NodeId) -> bool {
        if self.cycle_nodes.contains(&node) {
            return true;
        }
        let nd = self.nodes.get(node);
        match nd.conform_job.or(nd.actual_job) {
            Some(job) => {
                let jd = self.jobs.get(job);
                (jd.status.is_err() && !jd.status.is_frozen()) || jd.run_status.is_err()
            }
            None => false,
        }
    }

    /// Close out the request if all its targets reached their goal.
    pub(crate) fn maybe_finish_req(&mut self, req: ReqId) {
        let Some(rd) = self.reqs.lookup(req) else { return };
        let targets = rd.targets.clone();
        let all_done = {
            let rd = self.reqs.get_mut(req);
            let mut all = true;
            for t in &targets {
                if !rd.node_infos.get(t).map_or(false, |ri| ri.done_for(Goal::Dsk)) {
                    all = false;
                }
            }
            all
        };
        if !all_done || self.reqs.get(req).done {
            return;
        }
        self.reqs.get_mut(req).done = true;
        let mut failed = Vec::new();
        for t in &targets {
            if self.node_err(*t) || !self.nodes.get(*t).crc.exists() {
                failed.push(*t);
            }
        }
        {
            let names: Vec<String> =
                failed.iter().map(|n| self.names.node_name(*n).to_string()).collect();
            let rd = self.reqs.get_mut(req);
            for name in names {
                rd.audit(AuditKind::Err, None, format!("failed to build {name}"));
            }
            let s = &rd.stats;
            let summary = format!(
                "done: {} useful, {} steady, {} hit, {} rerun, {} failed",
                s.done, s.steady, s.hit, s.rerun, s.failed
            );
            rd.audit(AuditKind::Note, None, summary);
        }
        info!(req = req.index(), "request complete");
        self.actions.push(EngineAction::ReqDone { req });
    }

    /// Drain pending outward actions.
    pub fn take_actions(&mut self) -> Vec<EngineAction> {
        std::mem::take(&mut self.actions)
    }

    /// Build the backend submission for a job about to run.
    pub fn submit_spec(&mut self, job: JobId) -> crate::backend::SubmitSpec {
        self.seq_id += 1;
        let seq_id = self.seq_id;
        let jd = self.jobs.get(job);
        let r = self.rules.get(jd.rule);
        let cmd = r.cmd_for(&jd.stems);
        let mut env = std::collections::BTreeMap::new();
        for key in ["PATH", "HOME", "TMPDIR"] {
            if let Ok(v) = std::env::var(key) {
                env.insert(key.to_string(), v);
            }
        }
        let autodep_env = crate::autodep::AutodepEnv {
            service: String::new(), // backend fills in its socket address
            auto_mkdir: false,
            ignore_stat: false,
            reliable_dirs: true,
            lnk_support: crate::autodep::LinkSupport::Full,
            src_dirs: self.srcs.dirs.clone(),
            tmp_dir: self.cfg.phy_tmp_dir.clone().unwrap_or_default(),
            tmp_view: self.cfg.tmp_view.clone().unwrap_or_default(),
            root_dir: self.root_dir.to_string_lossy().into_owned(),
        };
        crate::backend::SubmitSpec {
            job,
            seq_id,
            cmd,
            interpreter: r.interpreter.clone(),
            cwd: self.root_dir.clone(),
            env,
            autodep_env,
            timeout: r.timeout,
            kill_sigs: self.backend_cfg.kill_signals.clone(),
            kill_escalation: std::time::Duration::from_secs(
                self.backend_cfg.kill_escalation_secs,
            ),
            heartbeat: std::time::Duration::from_secs(self.cfg.heartbeat_secs),
            live_out: r.live_out,
        }
    }

    /// Build the `Start` reply served to a booting job runner.
    pub fn start_reply(&mut self, job: JobId, service: String) -> crate::autodep::StartReply {
        let spec = self.submit_spec(job);
        let jd = self.jobs.get(job);
        let r = self.rules.get(jd.rule);
        let mut targets = Vec::new();
        for t in &r.targets {
            let pattern = if t.star {
                t.pattern.clone()
            } else {
                crate::rule::subst(&t.pattern, &jd.stems)
            };
            targets.push(crate::autodep::TargetPatternSpec { pattern, tflags: t.tflags });
        }
        let mut autodep_env = spec.autodep_env;
        autodep_env.service = service;
        crate::autodep::StartReply {
            small_id: job.index() as u32,
            seq_id: spec.seq_id,
            cmd: spec.cmd,
            interpreter: spec.interpreter,
            env: spec.env,
            cwd: spec.cwd.to_string_lossy().into_owned(),
            chroot: String::new(),
            autodep_method: r.autodep,
            lnk_support: autodep_env.lnk_support,
            targets,
            rsrcs: std::collections::BTreeMap::new(),
            stdin: None,
            stdout: None,
            timeout: spec.timeout,
            kill_sigs: spec.kill_sigs,
            network_delay: std::time::Duration::from_millis(self.cfg.network_delay_ms),
            pre_actions: Vec::new(),
            ancillary_file: format!(".depmake/ancillary/{}", spec.seq_id),
        }
    }

    pub fn node_name(&self, node: NodeId) -> &str {
        self.names.node_name(node)
    }

    pub fn workspace(&self) -> &Path {
        &self.root_dir
    }
}

/// Compile `[rule.*]` sections into rule records, priority ordered.
fn compile_rules(cfg: &ConfigFile) -> SysResult<(IdxMap<RuleId, RuleData>, Vec<RuleId>)> {
    let mut rules = IdxMap::new();
    let mut order: Vec<RuleId> = Vec::new();
    for (name, rc) in &cfg.rule {
        let mut targets = Vec::new();
        for spec in &rc.targets {
            let pattern = strip_flags(spec).to_string();
            let mut tflags = TargetFlags::dflt();
            for flag in spec_flags(spec) {
                tflags = apply_tflag(name, tflags, flag)?;
            }
            if rc.incremental {
                tflags = tflags.with(TargetFlags::INCREMENTAL);
            }
            let star = crate::rule::pattern_is_star(&pattern);
            targets.push(TargetSpec { pattern, tflags, star });
        }
        let mut deps = Vec::new();
        for spec in &rc.deps {
            let pattern = strip_flags(spec).to_string();
            let mut dflags = DepFlags::STATIC.with(DepFlags::REQUIRED);
            for flag in spec_flags(spec) {
                dflags = apply_dflag(name, dflags, flag)?;
            }
            deps.push(DepSpec { pattern, dflags });
        }
        let mut rule = RuleData::compile(
            name.clone(),
            rc.prio,
            rc.cmd.clone(),
            targets,
            deps,
            &rc.stems,
        )?;
        rule.tokens = rc.tokens;
        rule.timeout = rc.timeout_secs.map(std::time::Duration::from_secs);
        rule.force = rc.force;
        rule.incremental = rc.incremental;
        rule.live_out = rc.live_out;
        rule.interpreter = rc.interpreter.clone();
        rule.autodep = match rc.autodep.as_str() {
            "none" => AutodepMethod::None,
            "ptrace" => AutodepMethod::Ptrace,
            "ld_audit" => AutodepMethod::LdAudit,
            _ => AutodepMethod::LdPreload,
        };
        let id = rules.push(rule);
        order.push(id);
    }
    order.sort_by(|&a, &b| {
        let ra = rules.get(a);
        let rb = rules.get(b);
        rb.prio.cmp(&ra.prio).then_with(|| ra.name.cmp(&rb.name))
    });
    Ok((rules, order))
}

fn apply_tflag(rule: &str, tflags: TargetFlags, flag: &str) -> SysResult<TargetFlags> {
    Ok(match flag {
        "essential" => tflags.with(TargetFlags::ESSENTIAL),
        "incremental" => tflags.with(TargetFlags::INCREMENTAL),
        "no_uniquify" => tflags.with(TargetFlags::NO_UNIQUIFY),
        "no_warning" => tflags.with(TargetFlags::NO_WARNING),
        "phony" => tflags.with(TargetFlags::PHONY),
        "no_crc" => tflags.without(TargetFlags::CRC),
        "manual_ok" => tflags.with(TargetFlags::MANUAL_OK),
        "source_ok" => tflags.with(TargetFlags::SOURCE_OK),
        "ignore" => tflags.with(TargetFlags::IGNORE),
        "no_wash" => tflags.without(TargetFlags::WASH),
        other => {
            return Err(SystemError::BadRule {
                rule: rule.to_string(),
                msg: format!("unknown target flag {other:?}"),
            })
        }
    })
}

fn apply_dflag(rule: &str, dflags: DepFlags, flag: &str) -> SysResult<DepFlags> {
    Ok(match flag {
        "critical" => dflags.with(DepFlags::CRITICAL),
        "essential" => dflags.with(DepFlags::ESSENTIAL),
        "ignore_error" => dflags.with(DepFlags::IGNORE_ERROR),
        "required" => dflags.with(DepFlags::REQUIRED),
        other => {
            return Err(SystemError::BadRule {
                rule: rule.to_string(),
                msg: format!("unknown dep flag {other:?}"),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_classification() {
        let mut cfg = ConfigFile::default();
        cfg.sources.dirs = vec!["src".into()];
        cfg.sources.files = vec!["Makefile.inc".into()];
        cfg.sources.anti = vec!["**/*.tmp".into()];
        let srcs = SourceSet::from_config(&cfg).unwrap();
        assert_eq!(srcs.classify("src"), Some(Buildable::SrcDir));
        assert_eq!(srcs.classify("src/a.c"), Some(Buildable::SubSrc));
        assert_eq!(srcs.classify("Makefile.inc"), Some(Buildable::Src));
        assert_eq!(srcs.classify("x/y.tmp"), Some(Buildable::Anti));
        assert_eq!(srcs.classify("obj/a.o"), None);
        assert_eq!(srcs.classify("srcother/a.c"), None);
    }
}
