// src/lib.rs

pub mod autodep;
pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod digest;
pub mod engine;
pub mod errors;
pub mod hash;
pub mod logging;
pub mod req;
pub mod rule;
pub mod store;
pub mod wash;

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::backend::local::LocalBackend;
use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::engine::runtime::{Runtime, RuntimeEvent, RuntimeOptions};
use crate::engine::Engine;
use crate::req::AuditKind;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - engine / backend / runtime
/// - Ctrl-C handling
/// - the initial request from the command line targets
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let root_dir = config_root_dir(&config_path);
    let engine = Engine::new(root_dir, &cfg)?;

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);

    // Backend events are forwarded into the unified runtime stream.
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
    let backend = LocalBackend::new(be_tx, cfg.backend.max_parallel);

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    // Seed the request from the command line.
    let (done_tx, done_rx) = oneshot::channel();
    rt_tx
        .send(RuntimeEvent::OpenReq { targets: args.targets.clone(), done: done_tx })
        .await?;

    // Print the audit when the request resolves.
    let reporter = tokio::spawn(async move {
        let Ok(summary) = done_rx.await else { return false };
        for line in &summary.audit {
            match line.kind {
                AuditKind::Err => eprintln!("error: {}", line.text),
                AuditKind::Warn => eprintln!("warning: {}", line.text),
                AuditKind::Note => println!("{}", line.text),
            }
        }
        summary.ok
    });

    let options = RuntimeOptions { exit_when_idle: true };
    let runtime = Runtime::new(engine, Box::new(backend), options, rt_rx);
    runtime.run().await?;

    let ok = reporter.await.unwrap_or(false);
    info!(ok, "request finished");
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// The workspace root is the directory containing the config file.
fn config_root_dir(config_path: &Path) -> PathBuf {
    let dir = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    if dir.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        dir
    }
}

/// Simple dry-run output: print rules, targets, deps and commands.
fn print_dry_run(cfg: &ConfigFile) {
    println!("depmake dry-run");
    println!("  cache_dir = {:?}", cfg.config.cache_dir);
    println!("  backend = {} (max_parallel {})", cfg.backend.kind, cfg.backend.max_parallel);
    println!();

    println!("rules ({}):", cfg.rule.len());
    for (name, rule) in cfg.rule.iter() {
        println!("  - {name}");
        println!("      cmd: {}", rule.cmd);
        println!("      targets: {:?}", rule.targets);
        if !rule.deps.is_empty() {
            println!("      deps: {:?}", rule.deps);
        }
        if rule.prio != 0 {
            println!("      prio: {}", rule.prio);
        }
        if rule.force {
            println!("      force: true");
        }
    }

    debug!("dry-run complete (no execution)");
}
