// src/wash.rs

//! Pre-execution target washing.
//!
//! Before a job runs, its declared static and star targets from previous
//! runs are removed so the job starts from a clean slate, and the
//! directories its targets live in are created. Directories created for a
//! job are reference-counted in a shared map so concurrent jobs sharing an
//! intermediate directory neither race on creation nor delete it from
//! under each other during cleanup.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::digest::TargetFlags;
use crate::errors::{SysResult, SystemError};

/// Shared map of directories held alive by running jobs.
#[derive(Debug, Default)]
pub struct TargetDirs {
    map: Mutex<HashMap<String, u32>>,
}

impl TargetDirs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one reference on each dir; returns dirs whose count was zero
    /// (they may need creation).
    pub fn acquire(&self, dirs: &[String]) -> Vec<String> {
        let mut map = self.map.lock().expect("target_dirs lock poisoned");
        let mut fresh = Vec::new();
        for d in dirs {
            let count = map.entry(d.clone()).or_insert(0);
            if *count == 0 {
                fresh.push(d.clone());
            }
            *count += 1;
        }
        fresh
    }

    /// Drop one reference on each dir; returns dirs whose count reached
    /// zero (they may be cleaned up if empty).
    pub fn release(&self, dirs: &[String]) -> Vec<String> {
        let mut map = self.map.lock().expect("target_dirs lock poisoned");
        let mut dead = Vec::new();
        for d in dirs {
            if let Some(count) = map.get_mut(d) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    map.remove(d);
                    dead.push(d.clone());
                }
            }
        }
        dead
    }

    pub fn is_held(&self, dir: &str) -> bool {
        self.map.lock().expect("target_dirs lock poisoned").contains_key(dir)
    }
}

/// One target to wash, with what the engine knows about it.
#[derive(Debug, Clone)]
pub struct WashTarget {
    pub path: String,
    pub tflags: TargetFlags,
    /// Another job's outputs currently claim this node.
    pub claimed_by_other: bool,
    /// On-disk content differs from what the engine last recorded.
    pub manual: bool,
}

/// What washing did, and what it refused to do.
#[derive(Debug, Default)]
pub struct WashReport {
    pub unlinked: Vec<String>,
    /// Dirs created for this job, innermost last; cleanup removes the
    /// empty ones in reverse order.
    pub created_dirs: Vec<String>,
    pub warnings: Vec<String>,
    /// Manually edited targets moved aside rather than deleted.
    pub quarantined: Vec<String>,
    /// Manually edited targets that may not be overwritten: the job must
    /// be precluded with a target error.
    pub manual_errs: Vec<String>,
}

/// Wash a job's declared targets.
pub fn wash(root: &Path, targets: &[WashTarget], target_dirs: &TargetDirs) -> SysResult<WashReport> {
    let mut report = WashReport::default();

    for t in targets {
        let abs = root.join(&t.path);
        let exists = fs::symlink_metadata(&abs).is_ok();
        if !exists {
            continue;
        }
        if t.tflags.has(TargetFlags::INCREMENTAL) || !t.tflags.has(TargetFlags::WASH) {
            // Incremental targets survive; clearing Wash suppresses the
            // unlink and leaves the file to the job.
            continue;
        }
        if t.manual {
            if t.tflags.has(TargetFlags::MANUAL_OK) || t.tflags.has(TargetFlags::SOURCE_OK) {
                let quarantine = abs.with_extension("depmake.bck");
                fs::rename(&abs, &quarantine)
                    .map_err(|e| SystemError::store_io(&abs, e))?;
                warn!(target = %t.path, "manually edited target moved aside");
                report.quarantined.push(t.path.clone());
                continue;
            }
            report.manual_errs.push(t.path.clone());
            continue;
        }
        if !t.tflags.has(TargetFlags::NO_WARNING) && t.claimed_by_other {
            report
                .warnings
                .push(format!("unlinking {} generated by another job", t.path));
        }
        fs::remove_file(&abs).map_err(|e| SystemError::store_io(&abs, e))?;
        debug!(target = %t.path, "washed");
        report.unlinked.push(t.path.clone());
    }

    // Create target directories, outermost first.
    let mut dirs: Vec<String> = Vec::new();
    for t in targets {
        let mut anc: Vec<&str> = Vec::new();
        let mut rest = t.path.as_str();
        while let Some((dir, _)) = rest.rsplit_once('/') {
            anc.push(dir);
            rest = dir;
        }
        for dir in anc.into_iter().rev() {
            if !dirs.iter().any(|d| d == dir) {
                dirs.push(dir.to_string());
            }
        }
    }
    let fresh = target_dirs.acquire(&dirs);
    for dir in &fresh {
        let abs = root.join(dir);
        match fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => {
                // A preserved file occupies the dir path; leave it alone
                // and let the job fail on its own terms.
                report
                    .warnings
                    .push(format!("cannot create dir {dir}: a file is in the way"));
                continue;
            }
            Err(_) => {}
        }
        fs::create_dir_all(&abs).map_err(|e| SystemError::store_io(&abs, e))?;
        report.created_dirs.push(dir.clone());
    }
    // Cleanup releases everything acquired, not only the fresh part.
    report.created_dirs = dirs;
    Ok(report)
}

/// After-run cleanup: release the dir refcounts and remove dirs we created
/// that ended up empty.
pub fn cleanup(root: &Path, created_dirs: &[String], target_dirs: &TargetDirs) {
    let dead = target_dirs.release(created_dirs);
    let mut paths: Vec<PathBuf> = dead.iter().map(|d| root.join(d)).collect();
    // Innermost first so nested empties fold up.
    paths.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for p in paths {
        let _ = fs::remove_dir(&p); // fails harmlessly when non-empty
    }
}
