// src/autodep/protocol.rs

//! Wire protocol between the engine and running jobs.
//!
//! Two message families share the per-job socket:
//!
//! - *access frames* ([`AccessFrame`]): dep/target/unlink reports and the
//!   synchronous queries (`DepCrcs`, `ChkDeps`), sent by the interception
//!   layer inside the job;
//! - *job RPC* ([`JobReport`] / [`StartReply`]): boot confirmation, live
//!   stdout, and the end digest.
//!
//! Frames are newline-delimited JSON. Multiple sockets may carry frames for
//! one job, so no global FIFO order may be assumed across frames; the
//! gather resolves ambiguities with the "write earliest, read latest"
//! policy.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::autodep::env::{AutodepMethod, LinkSupport};
use crate::digest::{Accesses, Bool3, JobDigest, TargetFlags};
use crate::errors::{SysResult, SystemError};
use crate::hash::{Crc, FileDate, FileSig};

/// Kind of an access frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessProc {
    /// Fire-and-forget dep report.
    Deps,
    /// Read-then-write notification.
    Updates,
    /// Write notification.
    Targets,
    /// Delete notification.
    Unlinks,
    /// Synchronous: reply with the engine's current CRC for each file.
    DepCrcs,
    /// Synchronous: reply whether deps so far are ok / in error / not ready.
    ChkDeps,
    /// Advisory ordering marker closing a critical section.
    CriticalBarrier,
    /// Writes detected in the tmp dir.
    Tmp,
    /// Liveness.
    Heartbeat,
}

/// One framed report from the interception layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessFrame {
    pub proc: AccessProc,
    pub date: FileDate,
    /// Sender awaits a reply.
    #[serde(default)]
    pub sync: bool,
    /// Engine must stamp dates itself by probing disk. Only used for
    /// engine-internal dispatch, never sent by jobs.
    #[serde(default)]
    pub auto_date: bool,
    #[serde(default)]
    pub accesses: Accesses,
    /// Files with their observed signature, absent when not probed.
    #[serde(default)]
    pub files: Vec<(String, Option<FileSig>)>,
    #[serde(default)]
    pub comment: String,
}

impl AccessFrame {
    pub fn new(proc: AccessProc, date: FileDate) -> AccessFrame {
        AccessFrame {
            proc,
            date,
            sync: false,
            auto_date: false,
            accesses: Accesses::NONE,
            files: Vec::new(),
            comment: String::new(),
        }
    }
}

/// Engine reply to a synchronous access frame, or a kill injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReply {
    Ok,
    DepCrcs { crcs: Vec<Crc> },
    /// `Yes` = all deps ok, `No` = some in error, `Maybe` = not ready, rerun.
    ChkDeps { ok: Bool3 },
    /// Engine asks the job to terminate.
    Kill,
}

/// Pre-execution action the job runner must apply before exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreAction {
    Unlink { path: String },
    Mkdir { path: String },
    /// Move a manually edited file aside instead of deleting it.
    Quarantine { path: String },
}

/// Target pattern shipped to the job so the interception layer can flag
/// writes on sight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPatternSpec {
    pub pattern: String,
    pub tflags: TargetFlags,
}

/// Everything a job runner needs to boot, served as the `Start` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReply {
    pub small_id: u32,
    pub seq_id: u64,
    pub cmd: String,
    pub interpreter: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    #[serde(default)]
    pub chroot: String,
    pub autodep_method: AutodepMethod,
    pub lnk_support: LinkSupport,
    pub targets: Vec<TargetPatternSpec>,
    pub rsrcs: BTreeMap<String, u64>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    pub kill_sigs: Vec<i32>,
    pub network_delay: Duration,
    pub pre_actions: Vec<PreAction>,
    /// Where structured logs for this execution are stored.
    pub ancillary_file: String,
}

/// Job-to-engine RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobReport {
    /// Boot confirmation with the port the job listens on for kills.
    Start { seq_id: u64, port: u16 },
    /// Incremental stdout text, forwarded when live output is requested.
    LiveOut { seq_id: u64, txt: String },
    /// Final digest.
    End { seq_id: u64, digest: JobDigest },
}

/// Write one frame as a JSON line.
pub async fn write_frame<T, W>(w: &mut W, frame: &T) -> SysResult<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut line =
        serde_json::to_vec(frame).map_err(|e| SystemError::BadFrame(e.to_string()))?;
    line.push(b'\n');
    w.write_all(&line)
        .await
        .map_err(|e| SystemError::BadFrame(e.to_string()))
}

/// Read one frame from a buffered line reader. `Ok(None)` on clean EOF.
pub async fn read_frame<T, R>(r: &mut BufReader<R>) -> SysResult<Option<T>>
where
    T: DeserializeOwned,
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let n = r
        .read_line(&mut line)
        .await
        .map_err(|e| SystemError::BadFrame(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }
    let frame =
        serde_json::from_str(line.trim_end()).map_err(|e| SystemError::BadFrame(e.to_string()))?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_frame_json_roundtrip() {
        let mut f = AccessFrame::new(AccessProc::Deps, FileDate(42));
        f.accesses = Accesses::data();
        f.files = vec![("src/a.c".into(), Some(FileSig::default())), ("gen/b.h".into(), None)];
        f.comment = "open".into();
        let line = serde_json::to_string(&f).unwrap();
        let back: AccessFrame = serde_json::from_str(&line).unwrap();
        assert_eq!(back.proc, AccessProc::Deps);
        assert_eq!(back.files.len(), 2);
        assert_eq!(back.accesses, Accesses::data());
    }

    #[test]
    fn reply_roundtrip() {
        let r = AccessReply::ChkDeps { ok: Bool3::Maybe };
        let line = serde_json::to_string(&r).unwrap();
        assert_eq!(serde_json::from_str::<AccessReply>(&line).unwrap(), r);
    }
}
