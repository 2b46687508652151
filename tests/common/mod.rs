// tests/common/mod.rs

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use depmake::config::model::ConfigFile;
use depmake::config::validate_config;
use depmake::digest::{
    Accesses, DepDigest, DepFlags, JobDigest, JobStats, Status, TargetDigest, TargetFlags,
};
use depmake::engine::{Engine, EngineAction, JobEvent};
use depmake::hash::{Crc, DepValue, FileSig};
use depmake::store::JobId;

/// Build an engine over `root` from inline TOML.
pub fn mk_engine(root: &Path, cfg_toml: &str) -> Engine {
    let cfg: ConfigFile = toml::from_str(cfg_toml).expect("test config parses");
    validate_config(&cfg).expect("test config validates");
    Engine::new(root, &cfg).expect("engine builds")
}

/// Jobs submitted in an action batch.
pub fn submits(actions: &[EngineAction]) -> Vec<JobId> {
    actions
        .iter()
        .filter_map(|a| match a {
            EngineAction::Submit { job, .. } => Some(*job),
            _ => None,
        })
        .collect()
}

pub fn has_req_done(actions: &[EngineAction]) -> bool {
    actions.iter().any(|a| matches!(a, EngineAction::ReqDone { .. }))
}

/// A target digest for a path the job wrote; the engine hashes it from
/// disk during end-processing.
pub fn wrote(path: &str) -> (String, TargetDigest) {
    (
        path.to_string(),
        TargetDigest {
            tflags: TargetFlags::NONE,
            accesses: Accesses::NONE,
            write: true,
            crc: Crc::Unknown,
        },
    )
}

/// A date-known dep digest, as the gather reports for a plain read.
pub fn sig_dep(root: &Path, path: &str) -> (String, DepDigest) {
    let sig = FileSig::probe(&root.join(path));
    (
        path.to_string(),
        DepDigest {
            date: sig.date,
            accesses: Accesses::data(),
            dflags: DepFlags::NONE,
            parallel: false,
            value: DepValue::Sig(sig),
        },
    )
}

pub fn ok_digest(
    targets: Vec<(String, TargetDigest)>,
    deps: Vec<(String, DepDigest)>,
) -> JobDigest {
    JobDigest {
        status: Status::Ok,
        targets,
        deps,
        stderr: String::new(),
        stats: JobStats::default(),
    }
}

/// Drive one submitted job to a successful end: write its target files,
/// then feed the end digest.
pub fn run_job_ok(
    eng: &mut Engine,
    root: &Path,
    job: JobId,
    outputs: &[(&str, &str)],
    hidden_deps: &[&str],
) {
    eng.job_event(JobEvent::Started { job });
    for (path, content) in outputs {
        if let Some(parent) = root.join(path).parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(root.join(path), content).unwrap();
    }
    let targets = outputs.iter().map(|(p, _)| wrote(p)).collect();
    let deps = hidden_deps.iter().map(|p| sig_dep(root, p)).collect();
    eng.job_event(JobEvent::Ended { job, digest: ok_digest(targets, deps) });
}

/// The job whose official target is `path`.
pub fn job_for(eng: &Engine, path: &str) -> Option<JobId> {
    let node = eng.names.lookup_node(path)?;
    eng.jobs.iter().map(|(id, _)| id).find(|&id| eng.names.job_name(id).target == node)
}
