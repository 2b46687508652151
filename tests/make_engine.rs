// tests/make_engine.rs

//! Scenario tests for the make engine, driven synchronously: the test
//! plays the backend, writing target files and feeding end digests.

mod common;

use std::fs;
use std::thread::sleep;
use std::time::Duration;

use common::*;
use depmake::digest::{Status, TargetFlags};
use depmake::engine::EngineAction;
use depmake::store::ReasonTag;

const CFG: &str = r#"
[sources]
files = ["a.txt", "hidden.cfg"]

[rule.cp]
targets = ["b.txt"]
deps = ["a.txt"]
cmd = "cp a.txt b.txt"
"#;

#[test]
fn first_build_submits_then_second_request_is_up_to_date() {
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("a.txt"), "alpha").unwrap();
    let mut eng = mk_engine(ws.path(), CFG);

    let req = eng.open_req(&["b.txt".to_string()]).unwrap();
    let subs = submits(&eng.take_actions());
    assert_eq!(subs.len(), 1, "fresh target must be submitted");
    let job = subs[0];

    run_job_ok(&mut eng, ws.path(), job, &[("b.txt", "alpha")], &[]);
    let acts = eng.take_actions();
    assert!(has_req_done(&acts));
    assert_eq!(eng.reqs.get(req).stats.done, 1);
    assert_eq!(eng.jobs.get(job).status, Status::Ok);

    // Every Crc-flagged target of an Ok job carries a computed CRC.
    for t in &eng.jobs.get(job).targets {
        if t.tflags.has(TargetFlags::CRC) {
            assert!(eng.nodes.get(t.node).crc.is_valid());
        }
    }

    // Second request: goal reached through analysis alone.
    let req2 = eng.open_req(&["b.txt".to_string()]).unwrap();
    let acts = eng.take_actions();
    assert!(submits(&acts).is_empty(), "up-to-date target must not resubmit");
    assert!(acts.iter().any(|a| matches!(a, EngineAction::ReqDone { req: r } if *r == req2)));
    assert_eq!(eng.reqs.get(req2).stats.failed, 0);
    assert_eq!(eng.jobs.get(job).status, Status::Ok);
}

#[test]
fn make_pass_is_idempotent_without_events() {
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("a.txt"), "alpha").unwrap();
    let mut eng = mk_engine(ws.path(), CFG);

    let _req = eng.open_req(&["b.txt".to_string()]).unwrap();
    let job = submits(&eng.take_actions())[0];
    run_job_ok(&mut eng, ws.path(), job, &[("b.txt", "alpha")], &[]);
    eng.take_actions();

    eng.open_req(&["b.txt".to_string()]).unwrap();
    eng.take_actions();
    let status1 = eng.jobs.get(job).status;
    let deps1 = eng.jobs.get(job).deps.len();
    let crc1 = {
        let n = eng.names.lookup_node("b.txt").unwrap();
        eng.nodes.get(n).crc
    };

    eng.open_req(&["b.txt".to_string()]).unwrap();
    let acts = eng.take_actions();
    assert!(submits(&acts).is_empty());
    assert_eq!(eng.jobs.get(job).status, status1);
    assert_eq!(eng.jobs.get(job).deps.len(), deps1);
    let crc2 = {
        let n = eng.names.lookup_node("b.txt").unwrap();
        eng.nodes.get(n).crc
    };
    assert_eq!(crc1, crc2);
}

#[test]
fn hidden_dep_change_forces_rerun() {
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("a.txt"), "alpha").unwrap();
    fs::write(ws.path().join("hidden.cfg"), "v1").unwrap();
    let mut eng = mk_engine(ws.path(), CFG);

    eng.open_req(&["b.txt".to_string()]).unwrap();
    let job = submits(&eng.take_actions())[0];
    run_job_ok(&mut eng, ws.path(), job, &[("b.txt", "alpha")], &["hidden.cfg"]);
    eng.take_actions();

    // The hidden dep is now recorded after the statics.
    assert_eq!(eng.jobs.get(job).deps.len(), 2);

    sleep(Duration::from_millis(20));
    fs::write(ws.path().join("hidden.cfg"), "v2 changed").unwrap();

    let req2 = eng.open_req(&["b.txt".to_string()]).unwrap();
    let subs = submits(&eng.take_actions());
    assert_eq!(subs, vec![job], "modified hidden dep must rerun the job");

    let ji = eng.reqs.get(req2).job_infos.get(&job).unwrap();
    assert_eq!(ji.reason.tag, ReasonTag::DepChanged);
    let reason_node = ji.reason.node.unwrap();
    assert_eq!(eng.node_name(reason_node), "hidden.cfg");

    run_job_ok(&mut eng, ws.path(), job, &[("b.txt", "alpha2")], &["hidden.cfg"]);
    let acts = eng.take_actions();
    assert!(has_req_done(&acts));
    assert_eq!(eng.reqs.get(req2).stats.done, 1);
}

const CFG_CRIT: &str = r#"
[sources]
files = ["conf.lst", "data.in"]

[rule.build]
targets = ["out.bin"]
deps = ["conf.lst|critical", "data.in"]
cmd = "gen out.bin"
"#;

#[test]
fn modified_critical_dep_truncates_following_deps() {
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("conf.lst"), "c1").unwrap();
    fs::write(ws.path().join("data.in"), "d1").unwrap();
    let mut eng = mk_engine(ws.path(), CFG_CRIT);

    eng.open_req(&["out.bin".to_string()]).unwrap();
    let job = submits(&eng.take_actions())[0];
    run_job_ok(&mut eng, ws.path(), job, &[("out.bin", "c1d1")], &[]);
    eng.take_actions();
    assert_eq!(eng.jobs.get(job).deps.len(), 2);

    sleep(Duration::from_millis(20));
    fs::write(ws.path().join("conf.lst"), "c2 changed").unwrap();

    let req2 = eng.open_req(&["out.bin".to_string()]).unwrap();
    let subs = submits(&eng.take_actions());
    assert_eq!(subs, vec![job]);

    // The non-critical dep was discarded and not re-validated: the job's
    // dep vector stops after the critical section and data.in was never
    // visited in this request.
    assert_eq!(eng.jobs.get(job).deps.len(), 1);
    let data_node = eng.names.lookup_node("data.in").unwrap();
    assert!(!eng.reqs.get(req2).node_infos.contains_key(&data_node));

    // The rerun rediscovers data.in; end-processing folds it back into the
    // rebuilt static dep vector.
    run_job_ok(&mut eng, ws.path(), job, &[("out.bin", "c2d1")], &["data.in"]);
    let acts = eng.take_actions();
    assert!(has_req_done(&acts));
    assert_eq!(eng.jobs.get(job).deps.len(), 2);
}

const CFG_CLASH: &str = r#"
[sources]
files = ["a.src", "b.src"]

[rule.ra]
targets = ["a.txt"]
deps = ["a.src"]
cmd = "gen a"

[rule.rb]
targets = ["b.txt"]
deps = ["b.src"]
cmd = "gen b"
"#;

#[test]
fn concurrent_writes_to_shared_target_are_detected() {
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("a.src"), "a").unwrap();
    fs::write(ws.path().join("b.src"), "b").unwrap();
    let mut eng = mk_engine(ws.path(), CFG_CLASH);

    let req = eng.open_req(&["a.txt".to_string(), "b.txt".to_string()]).unwrap();
    let subs = submits(&eng.take_actions());
    assert_eq!(subs.len(), 2);
    let ja = job_for(&eng, "a.txt").unwrap();
    let jb = job_for(&eng, "b.txt").unwrap();

    // Both jobs run concurrently and both write shared.out.
    run_job_ok(&mut eng, ws.path(), ja, &[("a.txt", "a"), ("shared.out", "from a")], &[]);
    run_job_ok(&mut eng, ws.path(), jb, &[("b.txt", "b"), ("shared.out", "from b")], &[]);
    eng.take_actions();

    let shared = eng.names.lookup_node("shared.out").unwrap();
    let rd = eng.reqs.get(req);
    assert!(rd.clash_nodes.contains(&shared), "shared.out must be in clash_nodes");
    for j in [ja, jb] {
        let ji = rd.job_infos.get(&j).unwrap();
        assert_eq!(ji.reason.tag, ReasonTag::ClashTarget, "job {j:?} must carry ClashTarget");
        assert_eq!(ji.reason.node, Some(shared));
    }
}

#[test]
fn missing_static_dep_precludes_the_job() {
    let ws = tempfile::tempdir().unwrap();
    // a.txt is declared a source but absent on disk.
    let mut eng = mk_engine(ws.path(), CFG);

    let req = eng.open_req(&["b.txt".to_string()]).unwrap();
    let acts = eng.take_actions();
    assert!(submits(&acts).is_empty(), "job with a missing static dep must not run");
    assert!(has_req_done(&acts));
    let rd = eng.reqs.get(req);
    assert_eq!(rd.stats.failed, 1);
    let job = job_for(&eng, "b.txt").unwrap();
    assert_eq!(
        eng.jobs.get(job).run_status,
        depmake::store::RunStatus::NoDep
    );
}
