// src/engine/runtime.rs

//! The orchestration runtime.
//!
//! Responsibilities:
//! - Consume [`RuntimeEvent`]s from the backend, request front-ends and
//!   Ctrl-C.
//! - Feed observations into the engine (which stays synchronous).
//! - Perform the engine's outward actions: submissions, kills, ETA
//!   notifications, request completion replies.

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::backend::local::BackendEvent;
use crate::backend::Backend;
use crate::digest::{JobDigest, Status};
use crate::engine::{Engine, EngineAction, JobEvent};
use crate::req::{AuditKind, AuditLine, ReqStats};
use crate::store::idx::Idx;
use crate::store::ReqId;

/// Events sent into the runtime from the backend, front-ends, or signals.
#[derive(Debug)]
pub enum RuntimeEvent {
    Backend(BackendEvent),
    OpenReq { targets: Vec<String>, done: oneshot::Sender<ReqSummary> },
    KillReq { req: ReqId },
    ShutdownRequested,
}

/// What a request front-end gets back when its build finishes.
#[derive(Debug)]
pub struct ReqSummary {
    pub ok: bool,
    pub stats: ReqStats,
    pub audit: Vec<AuditLine>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Exit once no request is open.
    pub exit_when_idle: bool,
}

pub struct Runtime {
    engine: Engine,
    backend: Box<dyn Backend>,
    options: RuntimeOptions,
    events_rx: mpsc::Receiver<RuntimeEvent>,
    pending: HashMap<ReqId, oneshot::Sender<ReqSummary>>,
}

impl Runtime {
    pub fn new(
        engine: Engine,
        backend: Box<dyn Backend>,
        options: RuntimeOptions,
        events_rx: mpsc::Receiver<RuntimeEvent>,
    ) -> Runtime {
        Runtime { engine, backend, options, events_rx, pending: HashMap::new() }
    }

    /// Main event loop.
    pub async fn run(mut self) -> Result<()> {
        info!("depmake runtime started");

        while let Some(event) = self.events_rx.recv().await {
            match event {
                RuntimeEvent::Backend(ev) => self.handle_backend(ev),
                RuntimeEvent::OpenReq { targets, done } => {
                    debug!(?targets, "request opened");
                    match self.engine.open_req(&targets) {
                        Ok(req) => {
                            self.pending.insert(req, done);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to open request");
                            let _ = done.send(ReqSummary {
                                ok: false,
                                stats: ReqStats::default(),
                                audit: vec![AuditLine {
                                    kind: AuditKind::Err,
                                    job: None,
                                    text: e.to_string(),
                                }],
                            });
                        }
                    }
                }
                RuntimeEvent::KillReq { req } => self.engine.kill_req(req),
                RuntimeEvent::ShutdownRequested => {
                    info!("shutdown requested, stopping runtime");
                    break;
                }
            }

            self.perform_actions();

            if self.options.exit_when_idle && self.pending.is_empty() {
                info!("runtime idle and exit_when_idle=true, stopping");
                break;
            }
        }

        info!("depmake runtime exiting");
        Ok(())
    }

    fn handle_backend(&mut self, ev: BackendEvent) {
        match ev {
            BackendEvent::Started { job } => self.engine.job_event(JobEvent::Started { job }),
            BackendEvent::Ended { job, digest } => {
                self.engine.job_event(JobEvent::Ended { job, digest })
            }
            BackendEvent::LiveOut { job, txt } => {
                let reqs: Vec<ReqId> = self
                    .engine
                    .running
                    .get(&job)
                    .map(|r| r.reqs.clone())
                    .unwrap_or_default();
                for req in reqs {
                    if self.engine.reqs.lookup(req).is_some() {
                        self.engine.reqs.get_mut(req).audit(AuditKind::Note, Some(job), &txt);
                    }
                }
            }
            BackendEvent::Consult { job, frame, reply } => {
                let answer = self.engine.consult(job, &frame);
                let _ = reply.send(answer);
            }
        }
    }

    fn perform_actions(&mut self) {
        for action in self.engine.take_actions() {
            match action {
                EngineAction::Submit { job, req } => {
                    let spec = self.engine.submit_spec(job);
                    debug!(job = job.index(), req = req.index(), "submitting to backend");
                    if let Err(e) = self.backend.submit(spec) {
                        error!(job = job.index(), error = %e, "backend refused submission");
                        let digest =
                            JobDigest { status: Status::SystemErr, ..JobDigest::default() };
                        self.engine.job_event(JobEvent::Ended { job, digest });
                    }
                }
                EngineAction::KillJob { job } => self.backend.kill(job),
                EngineAction::EtaChanged => {
                    self.backend.notify_eta_order(self.engine.reqs.open_reqs().to_vec());
                }
                EngineAction::ReqDone { req } => self.finish_req(req),
            }
        }
        // Actions may cascade (a submission failure ends a job which
        // completes a request).
        if !self.engine.actions.is_empty() {
            self.perform_actions();
        }
    }

    fn finish_req(&mut self, req: ReqId) {
        let Some(rd) = self.engine.reqs.close(req) else { return };
        let ok = rd.stats.failed == 0
            && !rd.audit.iter().any(|l| l.kind == AuditKind::Err);
        let summary = ReqSummary { ok, stats: rd.stats, audit: rd.audit };
        match self.pending.remove(&req) {
            Some(done) => {
                let _ = done.send(summary);
            }
            None => warn!(req = req.index(), "request completed with no waiter"),
        }
    }
}
