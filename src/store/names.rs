// src/store/names.rs

//! The name store: the single authority for identity.
//!
//! Bidirectional mapping between paths and dense [`NodeId`]s, and between
//! rule-suffixed target paths and [`JobId`]s. Paths are workspace-relative,
//! `/`-separated, without leading `./`. Nodes are created lazily on first
//! mention and never destroyed during a session.

use std::collections::HashMap;

use crate::store::idx::{Idx, JobId, NodeId, RuleId};

/// Identity of a job: its official target plus a rule discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobName {
    pub target: NodeId,
    pub rule: RuleId,
}

#[derive(Debug, Default)]
pub struct NameStore {
    node_names: Vec<String>,
    node_by_name: HashMap<String, NodeId>,
    job_names: Vec<JobName>,
    job_by_name: HashMap<JobName, JobId>,
}

impl NameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a path, creating the node id on first mention.
    pub fn intern_node(&mut self, path: &str) -> NodeId {
        if let Some(&id) = self.node_by_name.get(path) {
            return id;
        }
        let id = NodeId::from_usize(self.node_names.len());
        self.node_names.push(path.to_string());
        self.node_by_name.insert(path.to_string(), id);
        id
    }

    pub fn lookup_node(&self, path: &str) -> Option<NodeId> {
        self.node_by_name.get(path).copied()
    }

    pub fn node_name(&self, id: NodeId) -> &str {
        &self.node_names[id.index()]
    }

    pub fn n_nodes(&self) -> usize {
        self.node_names.len()
    }

    /// Parent directory of a node, interned on demand.
    ///
    /// Returns `None` for top-level paths.
    pub fn dir_of(&mut self, id: NodeId) -> Option<NodeId> {
        let name = self.node_names[id.index()].clone();
        let parent = name.rsplit_once('/')?.0.to_string();
        if parent.is_empty() {
            return None;
        }
        Some(self.intern_node(&parent))
    }

    /// Intern a job identity.
    pub fn intern_job(&mut self, target: NodeId, rule: RuleId) -> JobId {
        let key = JobName { target, rule };
        if let Some(&id) = self.job_by_name.get(&key) {
            return id;
        }
        let id = JobId::from_usize(self.job_names.len());
        self.job_names.push(key);
        self.job_by_name.insert(key, id);
        id
    }

    pub fn lookup_job(&self, target: NodeId, rule: RuleId) -> Option<JobId> {
        self.job_by_name.get(&JobName { target, rule }).copied()
    }

    pub fn job_name(&self, id: JobId) -> JobName {
        self.job_names[id.index()]
    }

    /// Canonical full name of a job: target path suffixed with the rule
    /// discriminator.
    pub fn job_full_name(&self, id: JobId, rule_name: &str) -> String {
        let jn = self.job_names[id.index()];
        format!("{}+{}", self.node_name(jn.target), rule_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let mut ns = NameStore::new();
        let a = ns.intern_node("dir/a.txt");
        let b = ns.intern_node("dir/a.txt");
        assert_eq!(a, b);
        assert_eq!(ns.node_name(a), "dir/a.txt");
    }

    #[test]
    fn dir_of_walks_up_and_interns() {
        let mut ns = NameStore::new();
        let n = ns.intern_node("a/b/c.o");
        let d = ns.dir_of(n).unwrap();
        assert_eq!(ns.node_name(d), "a/b");
        let dd = ns.dir_of(d).unwrap();
        assert_eq!(ns.node_name(dd), "a");
        assert!(ns.dir_of(dd).is_none());
    }

    #[test]
    fn jobs_are_keyed_by_target_and_rule() {
        let mut ns = NameStore::new();
        let t = ns.intern_node("out/x");
        let j1 = ns.intern_job(t, RuleId(0));
        let j2 = ns.intern_job(t, RuleId(1));
        let j3 = ns.intern_job(t, RuleId(0));
        assert_ne!(j1, j2);
        assert_eq!(j1, j3);
    }
}
