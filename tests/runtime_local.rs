// tests/runtime_local.rs

//! End-to-end: a real request through the runtime and the local backend,
//! with actual processes.

mod common;

use std::fs;

use common::mk_engine;
use depmake::backend::local::LocalBackend;
use depmake::engine::runtime::{Runtime, RuntimeEvent, RuntimeOptions};
use tokio::sync::{mpsc, oneshot};

const CFG: &str = r#"
[sources]
files = ["a.txt"]

[rule.cp]
targets = ["b.txt"]
deps = ["a.txt"]
cmd = "cp a.txt b.txt"
autodep = "none"
"#;

#[tokio::test]
async fn local_backend_builds_a_real_target() {
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("a.txt"), "real content\n").unwrap();
    let engine = mk_engine(ws.path(), CFG);

    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);
    let (be_tx, mut be_rx) = mpsc::channel(64);
    {
        let rt_tx = rt_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = be_rx.recv().await {
                if rt_tx.send(RuntimeEvent::Backend(ev)).await.is_err() {
                    break;
                }
            }
        });
    }
    let backend = LocalBackend::new(be_tx, 2);

    let (done_tx, done_rx) = oneshot::channel();
    rt_tx
        .send(RuntimeEvent::OpenReq { targets: vec!["b.txt".to_string()], done: done_tx })
        .await
        .unwrap();
    drop(rt_tx);

    let runtime = Runtime::new(
        engine,
        Box::new(backend),
        RuntimeOptions { exit_when_idle: true },
        rt_rx,
    );
    runtime.run().await.unwrap();

    let summary = done_rx.await.unwrap();
    assert!(summary.ok, "audit: {:?}", summary.audit);
    assert_eq!(summary.stats.done, 1);
    assert_eq!(
        fs::read_to_string(ws.path().join("b.txt")).unwrap(),
        "real content\n"
    );
}

#[tokio::test]
async fn failing_command_surfaces_an_error() {
    let ws = tempfile::tempdir().unwrap();
    fs::write(ws.path().join("a.txt"), "x").unwrap();
    let cfg = r#"
[sources]
files = ["a.txt"]

[rule.boom]
targets = ["b.txt"]
deps = ["a.txt"]
cmd = "echo oops >&2; exit 3"
autodep = "none"
"#;
    let engine = mk_engine(ws.path(), cfg);

    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);
    let (be_tx, mut be_rx) = mpsc::channel(64);
    {
        let rt_tx = rt_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = be_rx.recv().await {
                if rt_tx.send(RuntimeEvent::Backend(ev)).await.is_err() {
                    break;
                }
            }
        });
    }
    let backend = LocalBackend::new(be_tx, 2);

    let (done_tx, done_rx) = oneshot::channel();
    rt_tx
        .send(RuntimeEvent::OpenReq { targets: vec!["b.txt".to_string()], done: done_tx })
        .await
        .unwrap();
    drop(rt_tx);

    let runtime = Runtime::new(
        engine,
        Box::new(backend),
        RuntimeOptions { exit_when_idle: true },
        rt_rx,
    );
    runtime.run().await.unwrap();

    let summary = done_rx.await.unwrap();
    assert!(!summary.ok);
    assert_eq!(summary.stats.failed, 1);
    assert!(
        summary.audit.iter().any(|l| l.text.contains("oops")),
        "stderr must appear in the error block: {:?}",
        summary.audit
    );
}
