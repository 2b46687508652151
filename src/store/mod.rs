// src/store/mod.rs

//! Node/job/name stores and the compressed dep vectors.

pub mod deps;
pub mod idx;
pub mod job;
pub mod names;
pub mod node;

pub use deps::{Dep, DepSlot, DepsVec};
pub use idx::{IdxMap, JobId, NodeId, ReqId, RuleId};
pub use job::{JobData, JobReason, ReasonTag, RunStatus, Target};
pub use names::{JobName, NameStore};
pub use node::{Buildable, NodeData, NodeStatus, RuleTgt};
