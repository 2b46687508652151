// src/backend/local.rs

//! Local process backend.
//!
//! Each submitted job gets its own autodep socket and its own process
//! group. Access frames from the job feed a per-job [`Gather`];
//! synchronous queries are forwarded to the engine through
//! [`BackendEvent::Consult`]. On exit (or timeout, kill, or a poisoned
//! gather) the gather is drained into the end digest.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use crate::autodep::gather::Gather;
use crate::autodep::protocol::{read_frame, write_frame, AccessFrame, AccessProc, AccessReply};
use crate::backend::{Backend, SubmitSpec};
use crate::digest::{JobDigest, JobStats, Status};
use crate::errors::{SysResult, SystemError};
use crate::hash::{FileDate, FileSig};
use crate::store::idx::Idx;
use crate::store::{JobId, ReqId};

/// Events the local backend emits toward the runtime.
#[derive(Debug)]
pub enum BackendEvent {
    Started { job: JobId },
    Ended { job: JobId, digest: JobDigest },
    LiveOut { job: JobId, txt: String },
    /// Synchronous query from a running job; the engine must answer.
    Consult { job: JobId, frame: AccessFrame, reply: oneshot::Sender<AccessReply> },
}

struct KillHandle {
    pid: i32,
    kill_sigs: Vec<i32>,
    kill_escalation: Duration,
    /// Set when the engine asked for termination.
    killed: Arc<AtomicBool>,
}

pub struct LocalBackend {
    tx: mpsc::Sender<BackendEvent>,
    sem: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<JobId, KillHandle>>>,
}

impl LocalBackend {
    pub fn new(tx: mpsc::Sender<BackendEvent>, max_parallel: usize) -> LocalBackend {
        LocalBackend {
            tx,
            sem: Arc::new(Semaphore::new(max_parallel.max(1))),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Backend for LocalBackend {
    fn submit(&mut self, spec: SubmitSpec) -> SysResult<()> {
        let tx = self.tx.clone();
        let sem = self.sem.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let _permit = sem.acquire_owned().await;
            let job = spec.job;
            if let Err(e) = run_one(spec, tx.clone(), running.clone()).await {
                error!(job = job.index(), error = %e, "job execution error");
                running.lock().expect("backend lock").remove(&job);
                let digest = JobDigest { status: Status::SystemErr, ..JobDigest::default() };
                let _ = tx.send(BackendEvent::Ended { job, digest }).await;
            }
        });
        Ok(())
    }

    fn kill(&mut self, job: JobId) {
        let handle = {
            let running = self.running.lock().expect("backend lock");
            running.get(&job).map(|h| {
                h.killed.store(true, Ordering::SeqCst);
                (h.pid, h.kill_sigs.clone(), h.kill_escalation)
            })
        };
        if let Some((pid, sigs, escalation)) = handle {
            tokio::spawn(escalate_kill(pid, sigs, escalation));
        }
    }

    fn notify_eta_order(&mut self, order: Vec<ReqId>) {
        // The local backend runs strictly FIFO per submission; the order
        // only matters to queue-aware remote backends.
        debug!(?order, "eta order changed");
    }
}

/// Walk the signal list against the job's process group.
async fn escalate_kill(pid: i32, sigs: Vec<i32>, escalation: Duration) {
    for (i, sig) in sigs.iter().enumerate() {
        unsafe {
            libc::kill(-pid, *sig);
        }
        if i + 1 < sigs.len() {
            tokio::time::sleep(escalation).await;
            // Stop escalating once the group is gone.
            let alive = unsafe { libc::kill(-pid, 0) } == 0;
            if !alive {
                return;
            }
        }
    }
}

async fn run_one(
    spec: SubmitSpec,
    tx: mpsc::Sender<BackendEvent>,
    running: Arc<Mutex<HashMap<JobId, KillHandle>>>,
) -> SysResult<()> {
    let job = spec.job;
    let submit_time = Instant::now();

    // Per-job autodep socket.
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| SystemError::Spawn { job: format!("{}", job.index()), source: e })?;
    let addr = listener.local_addr().map_err(|e| SystemError::Spawn {
        job: format!("{}", job.index()),
        source: e,
    })?;
    let mut autodep_env = spec.autodep_env.clone();
    // The env string uses ':' as its own separator, so the service field
    // carries host and port separated by ';'.
    autodep_env.service = format!("{};{}", addr.ip(), addr.port());

    let gather = Arc::new(Mutex::new(Gather::new(FileDate::now())));
    let gather_poisoned = Arc::new(AtomicBool::new(false));
    let pid_cell = Arc::new(std::sync::atomic::AtomicI32::new(0));

    // Accept loop lives as long as the listener.
    {
        let gather = gather.clone();
        let tx = tx.clone();
        let poisoned = gather_poisoned.clone();
        let cwd = spec.cwd.clone();
        let pid_cell = pid_cell.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let gather = gather.clone();
                        let tx = tx.clone();
                        let poisoned = poisoned.clone();
                        let cwd = cwd.clone();
                        let pid_cell = pid_cell.clone();
                        tokio::spawn(async move {
                            serve_frames(job, stream, gather, tx, poisoned, cwd, pid_cell).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
    }

    // Spawn the child in its own process group so kill reaches the whole
    // tree.
    let mut cmd = Command::new(&spec.interpreter[0]);
    for arg in &spec.interpreter[1..] {
        cmd.arg(arg);
    }
    cmd.arg(&spec.cmd);
    cmd.current_dir(&spec.cwd);
    cmd.envs(&spec.env);
    cmd.env("DEPMAKE_AUTODEP", autodep_env.to_string());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    let mut child = cmd.spawn().map_err(|e| SystemError::Spawn {
        job: format!("{}", job.index()),
        source: e,
    })?;
    let pid = child.id().unwrap_or_default() as i32;
    pid_cell.store(pid, Ordering::SeqCst);
    let killed = Arc::new(AtomicBool::new(false));
    {
        let mut map = running.lock().expect("backend lock");
        map.insert(
            job,
            KillHandle {
                pid,
                kill_sigs: spec.kill_sigs.clone(),
                kill_escalation: spec.kill_escalation,
                killed: killed.clone(),
            },
        );
    }
    info!(job = job.index(), pid, "job started");
    let start_time = Instant::now();
    let _ = tx.send(BackendEvent::Started { job }).await;

    // Heartbeat supervision: only jobs that heartbeated at least once are
    // held to the cadence; silent shim-less jobs are exempt.
    let lost = Arc::new(AtomicBool::new(false));
    let hb_task = {
        let gather = gather.clone();
        let lost = lost.clone();
        let interval = spec.heartbeat;
        let boot_hb = gather.lock().expect("gather lock").last_heartbeat;
        let kill_sigs = spec.kill_sigs.clone();
        let kill_escalation = spec.kill_escalation;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let last = gather.lock().expect("gather lock").last_heartbeat;
                if last == boot_hb {
                    continue; // never heartbeated; nothing to supervise
                }
                let stale = FileDate::now().0.saturating_sub(last.0)
                    > 2 * interval.as_nanos() as u64;
                if stale {
                    warn!(job = job.index(), "heartbeat lost; killing job");
                    lost.store(true, Ordering::SeqCst);
                    escalate_kill(pid, kill_sigs, kill_escalation).await;
                    return;
                }
            }
        })
    };

    // Stdout: forward live when requested, keep buffers drained always.
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        let live = spec.live_out;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if live {
                    let _ = tx.send(BackendEvent::LiveOut { job, txt: line }).await;
                } else {
                    debug!(job = job.index(), "stdout: {line}");
                }
            }
        });
    }
    let stderr_buf = Arc::new(Mutex::new(String::new()));
    if let Some(stderr) = child.stderr.take() {
        let buf = stderr_buf.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut buf = buf.lock().expect("stderr buffer lock");
                buf.push_str(&line);
                buf.push('\n');
            }
        });
    }

    // Wait, bounded by the per-rule timeout.
    let mut timed_out = false;
    let exit = match spec.timeout {
        Some(t) => match tokio::time::timeout(t, child.wait()).await {
            Ok(res) => res,
            Err(_) => {
                timed_out = true;
                warn!(job = job.index(), "job timed out");
                escalate_kill(pid, spec.kill_sigs.clone(), spec.kill_escalation).await;
                child.wait().await
            }
        },
        None => child.wait().await,
    };
    let exit = exit.map_err(|e| SystemError::Spawn {
        job: format!("{}", job.index()),
        source: e,
    })?;

    running.lock().expect("backend lock").remove(&job);
    hb_task.abort();

    let status = if gather_poisoned.load(Ordering::SeqCst) {
        Status::SystemErr
    } else if timed_out {
        Status::Timeout
    } else if lost.load(Ordering::SeqCst) {
        Status::Lost
    } else if killed.load(Ordering::SeqCst) {
        Status::Killed
    } else if exit.success() {
        Status::Ok
    } else {
        Status::Err
    };
    let stats = JobStats {
        cpu: Duration::ZERO,
        job: start_time.elapsed(),
        total: submit_time.elapsed(),
        mem: 0,
    };
    let digest = {
        let mut g = gather.lock().expect("gather lock");
        g.end_date = FileDate::now();
        g.stderr = std::mem::take(&mut *stderr_buf.lock().expect("stderr buffer lock"));
        g.make_digest(status, stats)
    };
    info!(job = job.index(), ?status, "job ended");
    let _ = tx.send(BackendEvent::Ended { job, digest }).await;
    Ok(())
}

/// Read frames from one autodep connection into the gather.
///
/// A parse failure poisons only this job's gather: the job is killed and
/// classified `SystemErr`; the engine keeps going.
async fn serve_frames(
    job: JobId,
    stream: TcpStream,
    gather: Arc<Mutex<Gather>>,
    tx: mpsc::Sender<BackendEvent>,
    poisoned: Arc<AtomicBool>,
    cwd: std::path::PathBuf,
    pid_cell: Arc<std::sync::atomic::AtomicI32>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        match read_frame::<AccessFrame, _>(&mut reader).await {
            Ok(Some(mut frame)) => {
                if frame.auto_date {
                    stamp_dates(&mut frame, &cwd);
                }
                let sync = frame.sync;
                match frame.proc {
                    AccessProc::DepCrcs | AccessProc::ChkDeps => {
                        let (otx, orx) = oneshot::channel();
                        let _ = tx
                            .send(BackendEvent::Consult { job, frame, reply: otx })
                            .await;
                        let reply = orx.await.unwrap_or(AccessReply::Ok);
                        let _ = write_frame(&mut write_half, &reply).await;
                    }
                    _ => {
                        gather.lock().expect("gather lock").handle_frame(frame);
                        if sync {
                            let _ = write_frame(&mut write_half, &AccessReply::Ok).await;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(job = job.index(), error = %e, "bad autodep frame; killing job");
                poisoned.store(true, Ordering::SeqCst);
                let pid = pid_cell.load(Ordering::SeqCst);
                if pid > 0 {
                    unsafe {
                        libc::kill(-pid, libc::SIGKILL);
                    }
                }
                break;
            }
        }
    }
}

/// Probe disk for files whose dates the engine must stamp itself.
fn stamp_dates(frame: &mut AccessFrame, cwd: &std::path::Path) {
    for (file, sig) in &mut frame.files {
        if sig.is_none() {
            *sig = Some(FileSig::probe(&cwd.join(file.as_str())));
        }
    }
}
