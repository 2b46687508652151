// src/store/node.rs

//! Node records: one per abstract file path.

use serde::{Deserialize, Serialize};

use crate::digest::Accesses;
use crate::hash::{Crc, DepValue, FileSig};
use crate::store::idx::{JobId, RuleId};

/// How a node can be produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Buildable {
    /// No candidate rule and not a source.
    #[default]
    No,
    /// Buildable through an unspecified mechanism (data dependent).
    Yes,
    /// Declared source file.
    Src,
    /// Lies under a declared source file (e.g. inside a source archive dir).
    SubSrc,
    /// A declared source directory itself.
    SrcDir,
    /// Matches an anti-rule: explicitly never buildable.
    Anti,
    /// Produced by one or more plain rules.
    Plain,
    /// Value decoded from an association table.
    Decode,
    /// Value encoded into an association table.
    Encode,
}

impl Buildable {
    pub fn is_src(self) -> bool {
        matches!(self, Buildable::Src | Buildable::SubSrc | Buildable::SrcDir)
    }

    /// May the make engine try jobs for this node?
    pub fn has_jobs(self) -> bool {
        matches!(self, Buildable::Plain | Buildable::Yes)
    }
}

/// How the node is currently produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Not produced by anything known.
    #[default]
    None,
    /// Produced by `actual_job`.
    Plain,
    /// Several jobs claim it at equal priority.
    Multi,
    /// Source: content is authoritative as found on disk.
    Src,
    /// Lies under a generated node; cannot exist as a file.
    Uphill,
    /// Exists only while some job runs (e.g. tmp view).
    Transient,
}

/// A candidate (rule, target-pattern) pair for a node, priority ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTgt {
    pub rule: RuleId,
    /// Index of the matching target pattern within the rule.
    pub tgt_idx: usize,
}

/// Persistent record of a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeData {
    pub crc: Crc,
    /// Signature observed when `crc` was computed; the CRC is only trusted
    /// while the on-disk signature still equals it.
    pub sig: FileSig,
    pub buildable: Buildable,
    pub status: NodeStatus,
    /// The job whose execution last wrote this node.
    pub actual_job: Option<JobId>,
    /// The candidate job selected to answer for this node (producer, or
    /// the error-bearing candidate when none produced it).
    pub conform_job: Option<JobId>,
    /// Candidate rule targets, decreasing priority.
    pub rule_tgts: Vec<RuleTgt>,
    /// Candidate jobs, decreasing priority.
    pub job_tgts: Vec<JobId>,
    /// Match results above are authoritative iff this equals the global
    /// match generation.
    pub match_gen: u32,
}

impl NodeData {
    /// Record a freshly computed CRC together with the signature under
    /// which it was computed.
    pub fn refresh(&mut self, crc: Crc, sig: FileSig) -> bool {
        let modified = !crc.matches(self.crc, Accesses::all());
        self.crc = crc;
        self.sig = sig;
        modified
    }

    /// Does the stored content still match `value` under `accesses`?
    ///
    /// A date-known dep matches on signature equality; a crc-known dep on
    /// masked CRC equality.
    pub fn value_matches(&self, value: DepValue, accesses: Accesses) -> bool {
        match value {
            DepValue::Crc(c) => c.matches(self.crc, accesses),
            DepValue::Sig(s) => s == self.sig && s.exists(),
        }
    }

    /// Drop cached match results (used when the global generation bumps
    /// past us lazily).
    pub fn invalidate_match(&mut self) {
        self.rule_tgts.clear();
        self.job_tgts.clear();
        self.buildable = Buildable::No;
        self.match_gen = 0;
    }
}
