// src/cache/mod.rs

//! LRU content-addressed cache of job outputs.
//!
//! Layout under the cache root:
//!
//! ```text
//! DEPMAKE/lru                     head record
//! <sanitized-job-name>/           per-job dir
//! <sanitized-job-name>/<repo>/    per-repo bucket
//! <sanitized-job-name>/<repo>/lru
//! <sanitized-job-name>/<repo>/data   serialized entry (job info + digest)
//! <sanitized-job-name>/<repo>/deps   compact (name, dep digest) vector
//! <sanitized-job-name>/<repo>/<i>    content of target i
//! ```
//!
//! Lock order is global head first, then entry, always: uploads take the
//! head exclusively before the entry exclusively; downloads take the entry
//! shared and only then the head (briefly, exclusively) to update usage.
//! All I/O failures degrade to a miss.

pub mod lru;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::digest::{DepDigest, JobDigest};
use crate::errors::{SysResult, SystemError};
use crate::hash::{Crc, FileSig};
use self::lru::{Lru, HEAD};

/// Engine-side answer when the cache asks about one dep during a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepLookup {
    /// Node is done at status level with this CRC.
    Crc(Crc),
    /// Node not yet done at status level.
    NotDone,
}

/// Outcome of probing the cache for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheMatch {
    /// Entry key whose deps all matched.
    Hit(String),
    Miss,
    /// Deps the engine must resolve before re-probing.
    Maybe(Vec<String>),
}

/// Serialized `data` file of an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryData {
    pub job_name: String,
    pub stems: Vec<(String, String)>,
    pub cmd_crc: Crc,
    pub digest: JobDigest,
    /// Target paths, in blob index order.
    pub target_names: Vec<String>,
}

#[derive(Default)]
struct CacheLocks {
    head: RwLock<()>,
    entries: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl CacheLocks {
    fn entry(&self, key: &str) -> Arc<RwLock<()>> {
        let mut map = self.entries.lock().expect("cache lock poisoned");
        map.entry(key.to_string()).or_default().clone()
    }
}

pub struct DirCache {
    root: PathBuf,
    /// Bucket discriminating entries of distinct repositories.
    repo: String,
    capacity: u64,
    locks: CacheLocks,
}

impl DirCache {
    pub fn open(root: impl Into<PathBuf>, repo: &str, capacity: u64) -> SysResult<DirCache> {
        let root = root.into();
        let admin = root.join(HEAD);
        fs::create_dir_all(&admin).map_err(|e| SystemError::cache_io(&admin, e))?;
        if !lru::lru_file(&root, HEAD).exists() {
            lru::write_lru(&root, HEAD, &Lru::default())?;
        }
        Ok(DirCache {
            root,
            repo: sanitize(repo),
            capacity,
            locks: CacheLocks::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_key(&self, job_name: &str) -> String {
        format!("{}/{}", sanitize(job_name), self.repo)
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Probe the cache for `job_name`.
    ///
    /// Scans all repo buckets under the job's dir. For each entry, walks
    /// its recorded deps in order, resolving each through `resolve`:
    /// a CRC mismatch is a miss for that entry; a not-yet-done dep is
    /// collected for investigation, and when it is critical the walk stops
    /// past its parallel group. The new-dep sets are intersected across
    /// entries: deps are content-determined, so entries with matching
    /// prefixes ask for the same next dep.
    pub fn match_job(
        &self,
        job_name: &str,
        mut resolve: impl FnMut(&str) -> DepLookup,
    ) -> CacheMatch {
        let job_dir = self.root.join(sanitize(job_name));
        let buckets = match fs::read_dir(&job_dir) {
            Ok(rd) => rd,
            Err(_) => return CacheMatch::Miss,
        };
        let mut new_deps: Option<Vec<String>> = None;
        for bucket in buckets.flatten() {
            let Ok(bucket_name) = bucket.file_name().into_string() else { continue };
            let key = format!("{}/{}", sanitize(job_name), bucket_name);
            let guard = self.locks.entry(&key);
            let _shared = guard.read().expect("cache lock poisoned");
            let deps = match self.read_deps(&key) {
                Ok(d) => d,
                Err(e) => {
                    warn!(key, error = %e, "unreadable cache entry; skipping");
                    continue;
                }
            };
            match walk_entry_deps(&deps, &mut resolve) {
                EntryMatch::Hit => {
                    debug!(key, "cache hit");
                    return CacheMatch::Hit(key);
                }
                EntryMatch::Miss => {}
                EntryMatch::New(found) => match &mut new_deps {
                    None => new_deps = Some(found),
                    Some(prev) => prev.retain(|d| found.contains(d)),
                },
            }
        }
        match new_deps {
            Some(deps) if !deps.is_empty() => CacheMatch::Maybe(deps),
            _ => CacheMatch::Miss,
        }
    }

    /// Copy a hit entry's targets back into the workspace.
    ///
    /// Holds the entry shared (content must not be evicted mid-copy), then
    /// briefly takes the head exclusively to move the entry to the MRU
    /// position. Target signatures are recomputed after the copy so the
    /// engine records what actually landed on disk.
    pub fn download(
        &self,
        key: &str,
        workspace: &Path,
    ) -> SysResult<(EntryData, Vec<(String, FileSig)>)> {
        let guard = self.locks.entry(key);
        let _shared = guard.read().expect("cache lock poisoned");
        let data = self.read_data(key)?;
        let dir = self.entry_dir(key);
        let mut sigs = Vec::with_capacity(data.target_names.len());
        for (i, name) in data.target_names.iter().enumerate() {
            let src = dir.join(i.to_string());
            let dst = workspace.join(name);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|e| SystemError::cache_io(parent, e))?;
            }
            let _ = fs::remove_file(&dst);
            copy_blob(&src, &dst)?;
            sigs.push((name.clone(), FileSig::probe(&dst)));
        }
        {
            let _head = self.locks.head.write().expect("cache lock poisoned");
            let sz = lru::unlink_entry(&self.root, key)?;
            lru::push_front(&self.root, key, sz)?;
        }
        info!(key, "cache download complete");
        Ok((data, sigs))
    }

    /// Store a finished job, evicting least recently used entries to make
    /// room. The head lock is taken exclusively *before* the entry lock;
    /// this order is the deadlock-avoidance invariant shared with
    /// `download`.
    ///
    /// Every copied target's signature is re-verified against `sigs` (what
    /// the caller observed); any mismatch aborts the upload so an entry is
    /// never published unreliable.
    pub fn upload(
        &self,
        job_name: &str,
        data: &EntryData,
        workspace: &Path,
        sigs: &[(String, FileSig)],
    ) -> SysResult<bool> {
        let key = self.entry_key(job_name);
        let _head = self.locks.head.write().expect("cache lock poisoned");
        let guard = self.locks.entry(&key);
        let _excl = guard.write().expect("cache lock poisoned");

        let dir = self.entry_dir(&key);
        // Replace any previous generation of this entry.
        if dir.exists() {
            let old_sz = lru::unlink_entry(&self.root, &key)?;
            self.adjust_head_sz(-(old_sz as i64))?;
            fs::remove_dir_all(&dir).map_err(|e| SystemError::cache_io(&dir, e))?;
        }
        fs::create_dir_all(&dir).map_err(|e| SystemError::cache_io(&dir, e))?;

        let data_bytes = serde_json::to_vec(data).map_err(|e| {
            SystemError::cache_io(&dir, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let deps_vec: Vec<(String, DepDigest)> = data.digest.deps.clone();
        let deps_bytes = serde_json::to_vec(&deps_vec).map_err(|e| {
            SystemError::cache_io(&dir, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let mut new_sz = (data_bytes.len() + deps_bytes.len()) as u64;
        for name in &data.target_names {
            let src = workspace.join(name);
            if let Ok(meta) = fs::symlink_metadata(&src) {
                new_sz += meta.len();
            }
        }
        if new_sz > self.capacity {
            debug!(key, new_sz, "entry larger than cache capacity; not uploading");
            fs::remove_dir_all(&dir).ok();
            return Ok(false);
        }

        self.mk_room(new_sz)?;

        fs::write(dir.join("data"), &data_bytes)
            .map_err(|e| SystemError::cache_io(dir.join("data"), e))?;
        fs::write(dir.join("deps"), &deps_bytes)
            .map_err(|e| SystemError::cache_io(dir.join("deps"), e))?;
        for (i, name) in data.target_names.iter().enumerate() {
            let src = workspace.join(name);
            let dst = dir.join(i.to_string());
            copy_blob(&src, &dst)?;
            // Entry reliability: the workspace file must not have changed
            // under us between end-processing and the copy.
            let now = FileSig::probe(&src);
            let expected = sigs.iter().find(|(n, _)| n == name).map(|(_, s)| *s);
            if expected != Some(now) {
                warn!(key, target = %name, "target changed during upload; aborting entry");
                fs::remove_dir_all(&dir).ok();
                return Ok(false);
            }
        }

        lru::push_front(&self.root, &key, new_sz)?;
        self.adjust_head_sz(new_sz as i64)?;
        info!(key, sz = new_sz, "cache upload complete");
        Ok(true)
    }

    /// Evict LRU entries until `new_sz` fits within capacity.
    fn mk_room(&self, new_sz: u64) -> SysResult<()> {
        loop {
            let head = lru::read_lru(&self.root, HEAD)?;
            if head.sz + new_sz <= self.capacity {
                return Ok(());
            }
            let victim = head.prev.clone();
            if victim == HEAD {
                return Ok(()); // nothing left to evict
            }
            debug!(victim, "evicting cache entry");
            let sz = lru::unlink_entry(&self.root, &victim)?;
            self.adjust_head_sz(-(sz as i64))?;
            let dir = self.entry_dir(&victim);
            fs::remove_dir_all(&dir).map_err(|e| SystemError::cache_io(&dir, e))?;
        }
    }

    fn adjust_head_sz(&self, delta: i64) -> SysResult<()> {
        let mut head = lru::read_lru(&self.root, HEAD)?;
        head.sz = (head.sz as i64 + delta).max(0) as u64;
        lru::write_lru(&self.root, HEAD, &head)
    }

    fn read_data(&self, key: &str) -> SysResult<EntryData> {
        let path = self.entry_dir(key).join("data");
        let bytes = fs::read(&path).map_err(|e| SystemError::cache_io(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            SystemError::cache_io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    fn read_deps(&self, key: &str) -> SysResult<Vec<(String, DepDigest)>> {
        let path = self.entry_dir(key).join("deps");
        let bytes = fs::read(&path).map_err(|e| SystemError::cache_io(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            SystemError::cache_io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    /// Integrity check used by tests: list is consistent and entry sizes
    /// sum to the head total.
    pub fn chk(&self) -> SysResult<()> {
        let entries = lru::walk(&self.root)?;
        let total: u64 = entries.iter().map(|(_, sz)| sz).sum();
        let head = lru::read_lru(&self.root, HEAD)?;
        if total != head.sz {
            return Err(SystemError::cache_io(
                lru::lru_file(&self.root, HEAD),
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("head.sz {} != sum of entries {}", head.sz, total),
                ),
            ));
        }
        Ok(())
    }
}

enum EntryMatch {
    Hit,
    Miss,
    New(Vec<String>),
}

/// Walk one entry's recorded deps against the engine's current knowledge.
fn walk_entry_deps(
    deps: &[(String, DepDigest)],
    resolve: &mut impl FnMut(&str) -> DepLookup,
) -> EntryMatch {
    let mut new_deps: Vec<String> = Vec::new();
    let mut stop_after_group = false;
    for (name, dd) in deps.iter() {
        if stop_after_group && !dd.parallel {
            break;
        }
        match resolve(name) {
            DepLookup::Crc(crc) => {
                let stored = dd.value.crc().unwrap_or(Crc::Unknown);
                if !stored.matches(crc, dd.accesses) {
                    return EntryMatch::Miss;
                }
            }
            DepLookup::NotDone => {
                new_deps.push(name.clone());
                if dd.dflags.critical() {
                    // Finish this parallel group, then stop walking.
                    stop_after_group = true;
                }
            }
        }
    }
    if new_deps.is_empty() {
        EntryMatch::Hit
    } else {
        EntryMatch::New(new_deps)
    }
}

/// Replace path separators so a job name becomes one directory level.
fn sanitize(name: &str) -> String {
    name.replace('/', "\u{1}")
}

/// Copy a regular file or symlink preserving its nature.
fn copy_blob(src: &Path, dst: &Path) -> SysResult<()> {
    let meta = fs::symlink_metadata(src).map_err(|e| SystemError::cache_io(src, e))?;
    if meta.file_type().is_symlink() {
        let tgt = fs::read_link(src).map_err(|e| SystemError::cache_io(src, e))?;
        let _ = fs::remove_file(dst);
        #[cfg(unix)]
        std::os::unix::fs::symlink(&tgt, dst).map_err(|e| SystemError::cache_io(dst, e))?;
        #[cfg(not(unix))]
        return Err(SystemError::cache_io(
            dst,
            std::io::Error::new(std::io::ErrorKind::Unsupported, "symlink targets"),
        ));
    } else {
        fs::copy(src, dst).map_err(|e| SystemError::cache_io(dst, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Accesses;
    use crate::digest::DepFlags;
    use crate::hash::DepValue;

    fn dd(crc: Crc, critical: bool, parallel: bool) -> DepDigest {
        DepDigest {
            date: crate::hash::FileDate(1),
            accesses: Accesses::data(),
            dflags: if critical { DepFlags::CRITICAL } else { DepFlags::NONE },
            parallel,
            value: DepValue::Crc(crc),
        }
    }

    #[test]
    fn walk_hit_miss_and_new() {
        let deps = vec![
            ("a".to_string(), dd(Crc::Reg(1), false, false)),
            ("b".to_string(), dd(Crc::Reg(2), false, false)),
        ];
        let m = walk_entry_deps(&deps, &mut |n| match n {
            "a" => DepLookup::Crc(Crc::Reg(1)),
            _ => DepLookup::Crc(Crc::Reg(2)),
        });
        assert!(matches!(m, EntryMatch::Hit));

        let m = walk_entry_deps(&deps, &mut |_| DepLookup::Crc(Crc::Reg(9)));
        assert!(matches!(m, EntryMatch::Miss));

        let m = walk_entry_deps(&deps, &mut |n| match n {
            "a" => DepLookup::NotDone,
            _ => DepLookup::Crc(Crc::Reg(2)),
        });
        match m {
            EntryMatch::New(v) => assert_eq!(v, vec!["a".to_string()]),
            _ => panic!("expected New"),
        }
    }

    #[test]
    fn critical_new_dep_stops_past_parallel_group() {
        let deps = vec![
            ("crit".to_string(), dd(Crc::Reg(1), true, false)),
            ("par".to_string(), dd(Crc::Reg(2), false, true)),
            ("seq".to_string(), dd(Crc::Reg(3), false, false)),
        ];
        let mut asked = Vec::new();
        let m = walk_entry_deps(&deps, &mut |n| {
            asked.push(n.to_string());
            DepLookup::NotDone
        });
        // The sequential dep after the critical group is never consulted.
        assert_eq!(asked, vec!["crit".to_string(), "par".to_string()]);
        match m {
            EntryMatch::New(v) => assert_eq!(v, vec!["crit".to_string(), "par".to_string()]),
            _ => panic!("expected New"),
        }
    }
}
