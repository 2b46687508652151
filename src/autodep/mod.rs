// src/autodep/mod.rs

//! Observation of running jobs: the wire protocol, the autodep environment
//! handed to spawned processes, and the per-job gather that merges reports
//! into an ordered access record.

pub mod env;
pub mod gather;
pub mod protocol;

pub use env::{AutodepEnv, AutodepMethod, LinkSupport};
pub use gather::{AccessInfo, Gather};
pub use protocol::{
    AccessFrame, AccessProc, AccessReply, JobReport, PreAction, StartReply, TargetPatternSpec,
};
