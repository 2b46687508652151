// src/errors.rs

//! System-error taxonomy.
//!
//! Engine-internal failures (store I/O, protocol framing, spawn failures)
//! are [`SystemError`]s: they abort the current make iteration and mark the
//! affected job `SystemErr`. Everything recoverable (deps in error, jobs
//! precluded from running, executions gone wrong) is *not* an error here;
//! it travels as `JobReason` / `RunStatus` / `Status` values instead.
//!
//! `anyhow` stays at the application boundary (config loading, CLI).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use anyhow::Result as AnyResult;

pub type SysResult<T> = Result<T, SystemError>;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("store i/o on {path:?}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache i/o on {path:?}: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("rule {rule}: {msg}")]
    BadRule { rule: String, msg: String },

    #[error("autodep env: {0}")]
    BadAutodepEnv(String),

    #[error("protocol frame: {0}")]
    BadFrame(String),

    #[error("spawning job {job}: {source}")]
    Spawn {
        job: String,
        #[source]
        source: io::Error,
    },

    #[error("engine channel closed")]
    ChannelClosed,
}

impl SystemError {
    pub fn store_io(path: impl Into<PathBuf>, source: io::Error) -> SystemError {
        SystemError::StoreIo { path: path.into(), source }
    }

    pub fn cache_io(path: impl Into<PathBuf>, source: io::Error) -> SystemError {
        SystemError::CacheIo { path: path.into(), source }
    }
}
