// src/cache/lru.rs

//! On-disk LRU records.
//!
//! Every cache entry directory holds an `lru` file: a doubly linked list
//! record `{prev, next, sz}` where `prev` points toward more recently used
//! entries and `next` toward less recently used ones. The distinguished
//! head record (under the admin dir) anchors the list: `head.next` is the
//! most recently used entry, `head.prev` the least recently used (the
//! eviction victim), and `head.sz` the total size of all entries.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{SysResult, SystemError};

/// Key of the head record; also the admin directory name.
pub const HEAD: &str = "DEPMAKE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lru {
    /// More recent neighbour (or the head).
    pub prev: String,
    /// Less recent neighbour (or the head).
    pub next: String,
    /// Size of this entry; total size for the head.
    pub sz: u64,
}

impl Default for Lru {
    fn default() -> Self {
        Lru { prev: HEAD.to_string(), next: HEAD.to_string(), sz: 0 }
    }
}

pub fn lru_file(root: &Path, key: &str) -> PathBuf {
    root.join(key).join("lru")
}

pub fn read_lru(root: &Path, key: &str) -> SysResult<Lru> {
    let path = lru_file(root, key);
    match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            SystemError::cache_io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Lru::default()),
        Err(e) => Err(SystemError::cache_io(&path, e)),
    }
}

/// Write an lru record atomically (tmp file + rename), so a concurrent
/// reader never observes a half-written record.
pub fn write_lru(root: &Path, key: &str, lru: &Lru) -> SysResult<()> {
    let path = lru_file(root, key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SystemError::cache_io(parent, e))?;
    }
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec(lru).map_err(|e| {
        SystemError::cache_io(&tmp, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    fs::write(&tmp, bytes).map_err(|e| SystemError::cache_io(&tmp, e))?;
    fs::rename(&tmp, &path).map_err(|e| SystemError::cache_io(&path, e))
}

/// Unlink an entry from the usage list, returning its size.
pub fn unlink_entry(root: &Path, key: &str) -> SysResult<u64> {
    let here = read_lru(root, key)?;
    let mut prev = read_lru(root, &here.prev)?;
    prev.next = here.next.clone();
    write_lru(root, &here.prev, &prev)?;
    if here.next == here.prev {
        // prev and next are the same record; re-read to not lose the
        // update above.
        let mut n = read_lru(root, &here.next)?;
        n.prev = here.prev.clone();
        write_lru(root, &here.next, &n)?;
    } else {
        let mut next = read_lru(root, &here.next)?;
        next.prev = here.prev.clone();
        write_lru(root, &here.next, &next)?;
    }
    Ok(here.sz)
}

/// Insert (or move) an entry at the most recently used position.
pub fn push_front(root: &Path, key: &str, sz: u64) -> SysResult<()> {
    let mut head = read_lru(root, HEAD)?;
    let first = head.next.clone();
    let entry = Lru { prev: HEAD.to_string(), next: first.clone(), sz };
    write_lru(root, key, &entry)?;
    if first == HEAD {
        head.prev = key.to_string();
        head.next = key.to_string();
        write_lru(root, HEAD, &head)?;
    } else {
        head.next = key.to_string();
        write_lru(root, HEAD, &head)?;
        let mut f = read_lru(root, &first)?;
        f.prev = key.to_string();
        write_lru(root, &first, &f)?;
    }
    Ok(())
}

/// Walk the list from MRU to LRU, returning the keys in order. Errors on
/// inconsistent prev/next pointers or cycles.
pub fn walk(root: &Path) -> SysResult<Vec<(String, u64)>> {
    let head = read_lru(root, HEAD)?;
    let mut out = Vec::new();
    let mut prev_key = HEAD.to_string();
    let mut key = head.next.clone();
    while key != HEAD {
        let lru = read_lru(root, &key)?;
        if lru.prev != prev_key {
            return Err(SystemError::cache_io(
                lru_file(root, &key),
                std::io::Error::new(std::io::ErrorKind::InvalidData, "prev pointer mismatch"),
            ));
        }
        if out.len() > 1_000_000 {
            return Err(SystemError::cache_io(
                lru_file(root, &key),
                std::io::Error::new(std::io::ErrorKind::InvalidData, "lru list cycle"),
            ));
        }
        out.push((key.clone(), lru.sz));
        prev_key = key;
        key = lru.next;
    }
    let tail = out.last().map(|(k, _)| k.as_str()).unwrap_or(HEAD);
    if head.prev != tail {
        return Err(SystemError::cache_io(
            lru_file(root, HEAD),
            std::io::Error::new(std::io::ErrorKind::InvalidData, "head.prev mismatch"),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_unlink_keeps_list_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_lru(root, HEAD, &Lru::default()).unwrap();

        push_front(root, "a/r", 10).unwrap();
        push_front(root, "b/r", 20).unwrap();
        push_front(root, "c/r", 30).unwrap();
        let keys: Vec<String> = walk(root).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["c/r", "b/r", "a/r"]);

        unlink_entry(root, "b/r").unwrap();
        let keys: Vec<String> = walk(root).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["c/r", "a/r"]);

        unlink_entry(root, "c/r").unwrap();
        unlink_entry(root, "a/r").unwrap();
        assert!(walk(root).unwrap().is_empty());
        let head = read_lru(root, HEAD).unwrap();
        assert_eq!(head.next, HEAD);
        assert_eq!(head.prev, HEAD);
    }

    #[test]
    fn single_entry_links_back_to_head() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_lru(root, HEAD, &Lru::default()).unwrap();
        push_front(root, "only/r", 5).unwrap();
        let head = read_lru(root, HEAD).unwrap();
        assert_eq!(head.next, "only/r");
        assert_eq!(head.prev, "only/r");
    }
}
