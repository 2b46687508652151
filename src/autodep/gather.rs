// src/autodep/gather.rs

//! Per-job aggregation of access reports into an ordered access record.
//!
//! Frames for one job may arrive over several sockets, so their relative
//! order is not trustworthy. Ambiguities between a read and a write of the
//! same file are resolved as "write earliest, read latest": the write is
//! assumed to have happened first, so the read observes the job's own
//! output and no dep is recorded, preferring to ignore a potential error
//! over raising a spurious one. The merge itself is commutative (all first
//! dates min-merge), so the final record does not depend on arrival order.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::autodep::protocol::{AccessFrame, AccessProc};
use crate::digest::{
    AccessDigest, Accesses, Bool3, DepDigest, DepFlags, JobDigest, JobStats, Status, TargetDigest,
    TargetFlags,
};
use crate::hash::{Crc, DepValue, FileDate, FileSig};

const N_ACCESS_KINDS: usize = 3;

fn kind_indices(accesses: Accesses) -> impl Iterator<Item = usize> {
    let mut v = Vec::new();
    if accesses.stat() {
        v.push(0);
    }
    if accesses.lnk() {
        v.push(1);
    }
    if accesses.reg() {
        v.push(2);
    }
    v.into_iter()
}

/// Everything observed about one path during one job execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessInfo {
    /// First read date per access kind (stat, lnk, reg).
    pub read: [Option<FileDate>; N_ACCESS_KINDS],
    /// First write date.
    pub write: Option<FileDate>,
    /// First date the path was known to be a target.
    pub target: Option<FileDate>,
    /// First date the path was seen existing. Detects absent-then-existing
    /// flutter that a date alone cannot show.
    pub seen: Option<FileDate>,
    /// Content snapshot at the earliest access.
    pub value: DepValue,
    pub parallel_id: u32,
    pub digest: AccessDigest,
}

fn merge_first(slot: &mut Option<FileDate>, pd: FileDate) {
    match slot {
        Some(d) if *d <= pd => {}
        _ => *slot = Some(pd),
    }
}

impl AccessInfo {
    pub fn first_read(&self) -> Option<FileDate> {
        self.read.iter().flatten().min().copied()
    }

    /// Merge one observation. Commutative: the result is independent of the
    /// order in which frames arrive.
    pub fn update(&mut self, pd: FileDate, ad: AccessDigest, value: DepValue, parallel_id: u32) {
        self.digest.dflags = self.digest.dflags.union(ad.dflags);
        self.digest.tflags = self.digest.tflags.union(ad.tflags);
        if !ad.accesses.is_empty() {
            // Earliest access owns the content snapshot and the parallel
            // group.
            let is_earliest = self.first_read().map_or(true, |d| pd < d);
            if is_earliest {
                self.value = value;
                self.parallel_id = parallel_id;
            }
            for k in kind_indices(ad.accesses) {
                merge_first(&mut self.read[k], pd);
            }
            self.digest.accesses = self.digest.accesses.union(ad.accesses);
        }
        if ad.write >= Bool3::Maybe {
            merge_first(&mut self.write, pd);
            if ad.write > self.digest.write {
                self.digest.write = ad.write;
            }
        }
        if ad.tflags.has(TargetFlags::ALLOW) {
            merge_first(&mut self.target, pd);
        }
        if value_seen(value) {
            merge_first(&mut self.seen, pd);
        }
    }

    /// Reads that happened strictly before the first write are external
    /// observations; the rest saw the job's own output.
    fn dep_accesses(&self) -> Accesses {
        let horizon = match (self.write, self.target) {
            (Some(w), Some(t)) => Some(w.min(t)),
            (Some(w), None) => Some(w),
            (None, Some(t)) => Some(t),
            (None, None) => None,
        };
        let mut out = Accesses::NONE;
        let masks = [Accesses::STAT, Accesses::LNK, Accesses::REG];
        for (k, mask) in masks.iter().enumerate() {
            if let Some(r) = self.read[k] {
                if horizon.map_or(true, |h| r < h) {
                    out = out.union(*mask);
                }
            }
        }
        out
    }
}

fn value_seen(value: DepValue) -> bool {
    match value {
        DepValue::Crc(c) => c.exists(),
        DepValue::Sig(s) => s.exists(),
    }
}

/// Per-job observer, fed by the autodep socket(s) and drained at job end.
#[derive(Debug, Default)]
pub struct Gather {
    access_map: HashMap<String, usize>,
    accesses: Vec<(String, AccessInfo)>,
    /// Dirs created/deleted that must be re-probed before trusting listings.
    guards: HashSet<String>,
    pub seen_tmp: bool,
    parallel_id: u32,
    /// Entries below this index already carry their critical flag.
    critical_done: usize,
    pub start_date: FileDate,
    pub end_date: FileDate,
    pub last_heartbeat: FileDate,
    pub stderr: String,
}

impl Gather {
    pub fn new(start_date: FileDate) -> Gather {
        Gather { start_date, last_heartbeat: start_date, ..Gather::default() }
    }

    pub fn n_accesses(&self) -> usize {
        self.accesses.len()
    }

    pub fn info(&self, path: &str) -> Option<&AccessInfo> {
        self.access_map.get(path).map(|&i| &self.accesses[i].1)
    }

    /// Record one access. `parallel` links this access to the previous
    /// one's group.
    pub fn new_access(
        &mut self,
        pd: FileDate,
        file: String,
        ad: AccessDigest,
        value: DepValue,
        parallel: bool,
        comment: &str,
    ) {
        if file.is_empty() {
            warn!(comment, "ignoring access with empty path");
            return;
        }
        if !parallel {
            self.parallel_id += 1;
        }
        let idx = match self.access_map.get(&file) {
            Some(&i) => i,
            None => {
                let i = self.accesses.len();
                self.access_map.insert(file.clone(), i);
                self.accesses.push((file, AccessInfo::default()));
                i
            }
        };
        debug!(file = %self.accesses[idx].0, ?ad, comment, "access");
        let pid = self.parallel_id;
        self.accesses[idx].1.update(pd, ad, value, pid);
    }

    pub fn new_deps(
        &mut self,
        pd: FileDate,
        files: Vec<(String, Option<FileSig>)>,
        accesses: Accesses,
        dflags: DepFlags,
        comment: &str,
    ) {
        let mut parallel = false;
        for (f, sig) in files {
            let value = match sig {
                Some(s) => DepValue::Sig(s),
                None => DepValue::Crc(Crc::Unknown),
            };
            let ad = AccessDigest { accesses, dflags, ..AccessDigest::default() };
            self.new_access(pd, f, ad, value, parallel, comment);
            parallel = true;
        }
    }

    pub fn new_target(&mut self, pd: FileDate, file: String, tflags: TargetFlags, comment: &str) {
        let ad = AccessDigest {
            write: Bool3::Yes,
            tflags: tflags.with(TargetFlags::ALLOW),
            ..AccessDigest::default()
        };
        self.new_access(pd, file, ad, DepValue::default(), false, comment);
    }

    pub fn new_unlnk(&mut self, pd: FileDate, file: String, comment: &str) {
        let ad = AccessDigest { write: Bool3::Yes, ..AccessDigest::default() };
        self.new_access(pd, file, ad, DepValue::default(), false, comment);
    }

    /// Dep on an executed interpreter or script.
    pub fn new_exec(&mut self, pd: FileDate, exe: String) {
        let ad = AccessDigest {
            accesses: Accesses::all(),
            ..AccessDigest::default()
        };
        self.new_access(pd, exe, ad, DepValue::default(), false, "exec");
    }

    pub fn new_guard(&mut self, file: String) {
        self.guards.insert(file);
    }

    /// Close the current critical section: every dep recorded so far is
    /// flagged critical.
    pub fn critical_barrier(&mut self) {
        for (_, info) in &mut self.accesses[self.critical_done..] {
            info.digest.dflags = info.digest.dflags.union(DepFlags::CRITICAL);
        }
        self.critical_done = self.accesses.len();
    }

    /// Apply one non-sync frame. Sync frames (`DepCrcs`, `ChkDeps`) are
    /// consulted on the engine and not recorded here.
    pub fn handle_frame(&mut self, frame: AccessFrame) {
        let pd = frame.date;
        match frame.proc {
            AccessProc::Deps => {
                self.new_deps(pd, frame.files, frame.accesses, DepFlags::NONE, &frame.comment)
            }
            AccessProc::Updates => {
                // Read-then-write: record the read part, then the write.
                let files = frame.files.clone();
                self.new_deps(pd, frame.files, frame.accesses, DepFlags::NONE, &frame.comment);
                for (f, _) in files {
                    let ad = AccessDigest { write: Bool3::Yes, ..AccessDigest::default() };
                    self.new_access(pd, f, ad, DepValue::default(), true, &frame.comment);
                }
            }
            AccessProc::Targets => {
                for (f, _) in frame.files {
                    self.new_target(pd, f, TargetFlags::NONE, &frame.comment);
                }
            }
            AccessProc::Unlinks => {
                for (f, _) in frame.files {
                    self.new_unlnk(pd, f, &frame.comment);
                }
            }
            AccessProc::CriticalBarrier => self.critical_barrier(),
            AccessProc::Tmp => self.seen_tmp = true,
            AccessProc::Heartbeat => self.last_heartbeat = pd,
            AccessProc::DepCrcs | AccessProc::ChkDeps => {
                warn!("sync frame reached gather; dropped");
            }
        }
    }

    /// Sort entries by first read date and silence reads that only saw the
    /// job's own output. Called before producing the digest (`at_end`) and
    /// on demand for intermediate `ChkDeps` consultations.
    pub fn reorder(&mut self, at_end: bool) {
        for (_, info) in &mut self.accesses {
            let dep_accesses = info.dep_accesses();
            if at_end && dep_accesses.is_empty() {
                info.digest.accesses = Accesses::NONE;
            } else {
                info.digest.accesses = dep_accesses;
            }
        }
        self.accesses.sort_by_key(|(_, info)| {
            (info.first_read().is_none(), info.first_read())
        });
        self.access_map.clear();
        for (i, (f, _)) in self.accesses.iter().enumerate() {
            self.access_map.insert(f.clone(), i);
        }
        // Sorting invalidated the critical watermark.
        self.critical_done = self.accesses.len();
    }

    /// Deps in report order, with parallel bits derived from group ids.
    pub fn dep_digests(&self) -> Vec<(String, DepDigest)> {
        let mut out: Vec<(String, DepDigest)> = Vec::new();
        let mut prev_group: Option<u32> = None;
        for (file, info) in &self.accesses {
            let accesses = info.digest.accesses;
            if accesses.is_empty() {
                continue;
            }
            // A path that ended up as a target is not also a dep.
            if info.target.is_some() || info.digest.write == Bool3::Yes {
                continue;
            }
            let parallel = prev_group == Some(info.parallel_id);
            prev_group = Some(info.parallel_id);
            let date = match info.value {
                DepValue::Sig(s) => s.date,
                DepValue::Crc(_) => info.first_read().unwrap_or_default(),
            };
            out.push((
                file.clone(),
                DepDigest {
                    date,
                    accesses,
                    dflags: info.digest.dflags,
                    parallel,
                    value: info.value,
                },
            ));
        }
        out
    }

    /// Targets with the union of reads observed before the first write.
    pub fn target_digests(&self) -> Vec<(String, TargetDigest)> {
        let mut out = Vec::new();
        for (file, info) in &self.accesses {
            if info.target.is_none() && info.write.is_none() {
                continue;
            }
            out.push((
                file.clone(),
                TargetDigest {
                    tflags: info.digest.tflags,
                    accesses: info.digest.accesses,
                    write: info.digest.write == Bool3::Yes,
                    crc: Crc::Unknown,
                },
            ));
        }
        out
    }

    /// Produce the end-of-job digest. Target CRCs are left `Unknown` here;
    /// end-processing hashes them under its own worker threads.
    pub fn make_digest(&mut self, status: Status, stats: JobStats) -> JobDigest {
        self.reorder(true);
        JobDigest {
            status,
            targets: self.target_digests(),
            deps: self.dep_digests(),
            stderr: std::mem::take(&mut self.stderr),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_ad() -> AccessDigest {
        AccessDigest { accesses: Accesses::data(), ..AccessDigest::default() }
    }

    fn write_ad() -> AccessDigest {
        AccessDigest { write: Bool3::Yes, ..AccessDigest::default() }
    }

    fn sig(date: u64) -> DepValue {
        DepValue::Sig(FileSig { date: FileDate(date), tag: crate::hash::FileTag::Reg })
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = AccessInfo::default();
        a.update(FileDate(1), read_ad(), sig(1), 1);
        a.update(FileDate(5), write_ad(), DepValue::default(), 2);

        let mut b = AccessInfo::default();
        b.update(FileDate(5), write_ad(), DepValue::default(), 2);
        b.update(FileDate(1), read_ad(), sig(1), 1);

        assert_eq!(a, b);
        assert!(a.first_read().unwrap() <= a.write.unwrap());
    }

    #[test]
    fn read_before_write_is_a_dep() {
        let mut g = Gather::new(FileDate(0));
        g.new_deps(FileDate(1), vec![("f".into(), None)], Accesses::data(), DepFlags::NONE, "r");
        let ad = write_ad();
        g.new_access(FileDate(5), "f".into(), ad, DepValue::default(), false, "w");
        g.reorder(true);
        // Written files are targets, and the pre-write read survives in the
        // target's access mask rather than as a dep.
        assert!(g.dep_digests().is_empty());
        let tgts = g.target_digests();
        assert_eq!(tgts.len(), 1);
        assert_eq!(tgts[0].1.accesses, Accesses::data());
        assert!(tgts[0].1.write);
    }

    #[test]
    fn read_after_write_is_silenced() {
        let mut g = Gather::new(FileDate(0));
        g.new_target(FileDate(1), "f".into(), TargetFlags::NONE, "w");
        g.new_deps(FileDate(5), vec![("f".into(), None)], Accesses::data(), DepFlags::NONE, "r");
        g.reorder(true);
        let tgts = g.target_digests();
        assert_eq!(tgts.len(), 1);
        assert!(tgts[0].1.accesses.is_empty());
        assert!(g.dep_digests().is_empty());
    }

    #[test]
    fn parallel_groups_produce_parallel_bits() {
        let mut g = Gather::new(FileDate(0));
        g.new_deps(
            FileDate(1),
            vec![("a".into(), None), ("b".into(), None)],
            Accesses::data(),
            DepFlags::NONE,
            "grp",
        );
        g.new_deps(FileDate(2), vec![("c".into(), None)], Accesses::data(), DepFlags::NONE, "seq");
        g.reorder(true);
        let deps = g.dep_digests();
        assert_eq!(deps.len(), 3);
        assert!(!deps[0].1.parallel);
        assert!(deps[1].1.parallel);
        assert!(!deps[2].1.parallel);
    }

    #[test]
    fn critical_barrier_flags_prior_deps() {
        let mut g = Gather::new(FileDate(0));
        g.new_deps(FileDate(1), vec![("a".into(), None)], Accesses::data(), DepFlags::NONE, "");
        g.critical_barrier();
        g.new_deps(FileDate(2), vec![("b".into(), None)], Accesses::data(), DepFlags::NONE, "");
        g.reorder(true);
        let deps = g.dep_digests();
        let a = deps.iter().find(|(f, _)| f == "a").unwrap();
        let b = deps.iter().find(|(f, _)| f == "b").unwrap();
        assert!(a.1.dflags.critical());
        assert!(!b.1.dflags.critical());
    }

    #[test]
    fn deps_ordered_by_first_read() {
        let mut g = Gather::new(FileDate(0));
        g.new_deps(FileDate(9), vec![("late".into(), None)], Accesses::data(), DepFlags::NONE, "");
        g.new_deps(FileDate(2), vec![("early".into(), None)], Accesses::data(), DepFlags::NONE, "");
        g.reorder(true);
        let deps = g.dep_digests();
        assert_eq!(deps[0].0, "early");
        assert_eq!(deps[1].0, "late");
    }
}
