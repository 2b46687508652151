// tests/cache_flow.rs

//! Content cache behaviour: hits across engine sessions, LRU eviction,
//! and on-disk list integrity.

mod common;

use std::fs;

use common::*;
use depmake::cache::lru::{self, HEAD};
use depmake::cache::{DirCache, EntryData};
use depmake::digest::{JobStats, Status};
use depmake::hash::{Crc, FileSig};

const CFG_CACHE: &str = r#"
[config]
cache_dir = ".cache"
cache_capacity = 10000000

[sources]
files = ["a.txt"]

[rule.cp]
targets = ["b.txt"]
deps = ["a.txt"]
cmd = "cp a.txt b.txt"
"#;

#[test]
fn second_session_hits_the_cache() {
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("a.txt"), "alpha").unwrap();

    // First session: build and upload.
    {
        let mut eng = mk_engine(ws.path(), CFG_CACHE);
        eng.open_req(&["b.txt".to_string()]).unwrap();
        let job = submits(&eng.take_actions())[0];
        run_job_ok(&mut eng, ws.path(), job, &[("b.txt", "alpha")], &[]);
        eng.take_actions();
        eng.cache.as_ref().unwrap().chk().unwrap();
    }

    // Second session: same stems, same dep CRCs.
    let mut eng = mk_engine(ws.path(), CFG_CACHE);
    let req = eng.open_req(&["b.txt".to_string()]).unwrap();
    let acts = eng.take_actions();
    assert!(submits(&acts).is_empty(), "a cache hit must not reach the backend");
    assert!(has_req_done(&acts));
    assert_eq!(eng.reqs.get(req).stats.hit, 1);
    assert_eq!(fs::read_to_string(ws.path().join("b.txt")).unwrap(), "alpha");

    let node = eng.names.lookup_node("b.txt").unwrap();
    assert!(eng.nodes.get(node).crc.is_valid());
}

#[test]
fn changed_dep_crc_misses_the_cache() {
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("a.txt"), "alpha").unwrap();
    {
        let mut eng = mk_engine(ws.path(), CFG_CACHE);
        eng.open_req(&["b.txt".to_string()]).unwrap();
        let job = submits(&eng.take_actions())[0];
        run_job_ok(&mut eng, ws.path(), job, &[("b.txt", "alpha")], &[]);
        eng.take_actions();
    }

    std::thread::sleep(std::time::Duration::from_millis(20));
    fs::write(ws.path().join("a.txt"), "beta content").unwrap();

    let mut eng = mk_engine(ws.path(), CFG_CACHE);
    let req = eng.open_req(&["b.txt".to_string()]).unwrap();
    let subs = submits(&eng.take_actions());
    assert_eq!(subs.len(), 1, "a changed dep must run the job");
    assert_eq!(eng.reqs.get(req).stats.hit, 0);
}

fn entry(job_name: &str, target: &str) -> EntryData {
    EntryData {
        job_name: job_name.to_string(),
        stems: vec![],
        cmd_crc: Crc::Reg(7),
        digest: depmake::digest::JobDigest {
            status: Status::Ok,
            targets: vec![wrote(target)],
            deps: vec![],
            stderr: String::new(),
            stats: JobStats::default(),
        },
        target_names: vec![target.to_string()],
    }
}

fn sigs_for(ws: &std::path::Path, target: &str) -> Vec<(String, FileSig)> {
    vec![(target.to_string(), FileSig::probe(&ws.join(target)))]
}

#[test]
fn lru_evicts_oldest_entry_when_over_capacity() {
    let cache_dir = tempfile::tempdir().unwrap();
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("t_a"), vec![b'x'; 60]).unwrap();
    fs::write(ws.path().join("t_b"), vec![b'y'; 60]).unwrap();

    // Measure entry A's on-disk size with an ample capacity.
    let cache = DirCache::open(cache_dir.path(), "repo", 1 << 20).unwrap();
    assert!(cache
        .upload("a+r", &entry("a+r", "t_a"), ws.path(), &sigs_for(ws.path(), "t_a"))
        .unwrap());
    cache.chk().unwrap();
    let sz_a = lru::read_lru(cache_dir.path(), HEAD).unwrap().sz;
    assert!(sz_a >= 60);

    // Reopen with room for one entry only: uploading B evicts A.
    let cache = DirCache::open(cache_dir.path(), "repo", sz_a + sz_a / 2).unwrap();
    assert!(cache
        .upload("b+r", &entry("b+r", "t_b"), ws.path(), &sigs_for(ws.path(), "t_b"))
        .unwrap());
    cache.chk().unwrap();

    let entries = lru::walk(cache_dir.path()).unwrap();
    let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["b+r/repo"]);
    let head = lru::read_lru(cache_dir.path(), HEAD).unwrap();
    assert_eq!(head.next, "b+r/repo");
    assert_eq!(head.prev, "b+r/repo");
    assert_eq!(head.sz, entries[0].1);
    assert!(!cache_dir.path().join("a+r").join("repo").exists());
}

#[test]
fn download_moves_entry_to_most_recent() {
    let cache_dir = tempfile::tempdir().unwrap();
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("t_a"), "aaa").unwrap();
    fs::write(ws.path().join("t_b"), "bbb").unwrap();

    let cache = DirCache::open(cache_dir.path(), "repo", 1 << 20).unwrap();
    cache.upload("a+r", &entry("a+r", "t_a"), ws.path(), &sigs_for(ws.path(), "t_a")).unwrap();
    cache.upload("b+r", &entry("b+r", "t_b"), ws.path(), &sigs_for(ws.path(), "t_b")).unwrap();

    // b is MRU now; downloading a moves it to the front.
    let out = tempfile::tempdir().unwrap();
    let (data, sigs) = cache.download("a+r/repo", out.path()).unwrap();
    assert_eq!(data.target_names, vec!["t_a".to_string()]);
    assert_eq!(fs::read_to_string(out.path().join("t_a")).unwrap(), "aaa");
    assert!(sigs[0].1.exists());

    let keys: Vec<String> =
        lru::walk(cache_dir.path()).unwrap().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["a+r/repo".to_string(), "b+r/repo".to_string()]);
    cache.chk().unwrap();
}
