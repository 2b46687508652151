// src/store/deps.rs

//! Compressed dep vectors.
//!
//! A job's deps are stored as a chunked slot sequence. Each chunk is a
//! header slot carrying the shared attributes (accesses, flags, parallel
//! bit) plus its own dep value, followed by `sz` bare node slots that
//! inherit the header's attributes. Within a chunk the bare deps come
//! logically *first*; the header's own dep is the chunk's last logical dep
//! and is the only one that may carry a distinct crc-or-date value.
//!
//! A dep is eligible for a bare slot iff its stored value is the `Unknown`
//! CRC (not yet individually snapshotted): static dep vectors compress
//! well, post-run vectors degenerate to one-header chunks. The iterator
//! expands the encoding back into plain logical deps, so consumers never
//! see chunks.

use serde::{Deserialize, Serialize};

use crate::digest::{Accesses, DepFlags};
use crate::hash::{Crc, DepValue};
use crate::store::idx::NodeId;

/// One fully expanded dep edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dep {
    pub node: NodeId,
    pub accesses: Accesses,
    pub dflags: DepFlags,
    /// Opened simultaneously with the previous dep.
    pub parallel: bool,
    pub value: DepValue,
}

impl Dep {
    pub fn new(node: NodeId, accesses: Accesses, dflags: DepFlags, parallel: bool) -> Dep {
        Dep { node, accesses, dflags, parallel, value: DepValue::default() }
    }

    pub fn is_crc(&self) -> bool {
        self.value.is_crc()
    }

    fn bare_eligible(&self) -> bool {
        self.value == DepValue::Crc(Crc::Unknown)
    }

    fn shares_attrs(&self, other: &Dep) -> bool {
        self.accesses == other.accesses
            && self.dflags == other.dflags
            && self.parallel == other.parallel
    }
}

/// Serialized slot: a chunk header or a bare node reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepSlot {
    Hdr {
        node: NodeId,
        accesses: Accesses,
        dflags: DepFlags,
        parallel: bool,
        value: DepValue,
        /// Number of bare slots following this header.
        sz: u8,
    },
    Bare(NodeId),
}

const MAX_CHUNK: usize = u8::MAX as usize;

/// Ordered dep vector with chunked serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<DepSlot>", try_from = "Vec<DepSlot>")]
pub struct DepsVec {
    deps: Vec<Dep>,
}

impl DepsVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_deps(deps: Vec<Dep>) -> Self {
        DepsVec { deps }
    }

    pub fn push(&mut self, dep: Dep) {
        self.deps.push(dep);
    }

    pub fn extend(&mut self, deps: impl IntoIterator<Item = Dep>) {
        self.deps.extend(deps);
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Dep> {
        self.deps.get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut Dep> {
        self.deps.get_mut(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dep> {
        self.deps.iter()
    }

    /// Drop the last `n` logical deps (speculative truncation).
    pub fn shorten_by(&mut self, n: usize) {
        let keep = self.deps.len().saturating_sub(n);
        self.deps.truncate(keep);
    }

    pub fn truncate(&mut self, len: usize) {
        self.deps.truncate(len);
    }

    /// Replace every dep from logical position `from` onward.
    pub fn replace_tail(&mut self, from: usize, deps: impl IntoIterator<Item = Dep>) {
        self.deps.truncate(from.min(self.deps.len()));
        self.deps.extend(deps);
    }

    /// Chunked slot encoding.
    ///
    /// Scans for maximal runs of bare-eligible deps whose attributes match
    /// the dep that closes the run; that closing dep becomes the chunk
    /// header.
    pub fn encode(&self) -> Vec<DepSlot> {
        let mut slots = Vec::with_capacity(self.deps.len());
        let mut i = 0;
        while i < self.deps.len() {
            // Extend the chunk while deps are bare-eligible and share attrs.
            let first = &self.deps[i];
            let mut j = i;
            while j < self.deps.len()
                && j - i < MAX_CHUNK
                && self.deps[j].bare_eligible()
                && self.deps[j].shares_attrs(first)
            {
                j += 1;
            }
            // The header is the dep closing the run if it shares attrs,
            // otherwise the last bare-eligible dep itself becomes the header.
            let hdr_idx;
            if j < self.deps.len() && j - i < MAX_CHUNK && self.deps[j].shares_attrs(first) {
                hdr_idx = j;
            } else if j > i {
                hdr_idx = j - 1;
            } else {
                hdr_idx = i;
            }
            let hdr = self.deps[hdr_idx];
            let sz = hdr_idx - i;
            slots.push(DepSlot::Hdr {
                node: hdr.node,
                accesses: hdr.accesses,
                dflags: hdr.dflags,
                parallel: hdr.parallel,
                value: hdr.value,
                sz: sz as u8,
            });
            for dep in &self.deps[i..hdr_idx] {
                slots.push(DepSlot::Bare(dep.node));
            }
            i = hdr_idx + 1;
        }
        slots
    }

    /// Decode a slot stream, expanding bare slots with their header's
    /// attributes.
    pub fn decode(slots: &[DepSlot]) -> Result<DepsVec, DepsDecodeError> {
        let mut deps = Vec::with_capacity(slots.len());
        let mut it = slots.iter();
        while let Some(slot) = it.next() {
            let &DepSlot::Hdr { node, accesses, dflags, parallel, value, sz } = slot else {
                return Err(DepsDecodeError::BareWithoutHeader);
            };
            let mut bares = Vec::with_capacity(sz as usize);
            for _ in 0..sz {
                match it.next() {
                    Some(&DepSlot::Bare(n)) => bares.push(n),
                    _ => return Err(DepsDecodeError::TruncatedChunk),
                }
            }
            for n in bares {
                deps.push(Dep {
                    node: n,
                    accesses,
                    dflags,
                    parallel,
                    value: DepValue::Crc(Crc::Unknown),
                });
            }
            deps.push(Dep { node, accesses, dflags, parallel, value });
        }
        Ok(DepsVec { deps })
    }
}

impl From<DepsVec> for Vec<DepSlot> {
    fn from(v: DepsVec) -> Vec<DepSlot> {
        v.encode()
    }
}

impl TryFrom<Vec<DepSlot>> for DepsVec {
    type Error = DepsDecodeError;
    fn try_from(slots: Vec<DepSlot>) -> Result<DepsVec, DepsDecodeError> {
        DepsVec::decode(&slots)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DepsDecodeError {
    #[error("bare dep slot without a preceding chunk header")]
    BareWithoutHeader,
    #[error("chunk header announces more bare slots than present")]
    TruncatedChunk,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(node: u32, critical: bool, value: DepValue) -> Dep {
        let dflags = if critical { DepFlags::STATIC.with(DepFlags::CRITICAL) } else { DepFlags::STATIC };
        Dep { node: NodeId(node), accesses: Accesses::data(), dflags, parallel: false, value }
    }

    #[test]
    fn unknown_run_compresses_to_one_chunk() {
        let unknown = DepValue::Crc(Crc::Unknown);
        let v = DepsVec::from_deps(vec![
            dep(0, false, unknown),
            dep(1, false, unknown),
            dep(2, false, unknown),
        ]);
        let slots = v.encode();
        assert_eq!(slots.len(), 3);
        assert!(matches!(slots[0], DepSlot::Hdr { sz: 2, .. }));
        assert!(matches!(slots[1], DepSlot::Bare(NodeId(0))));
        assert!(matches!(slots[2], DepSlot::Bare(NodeId(1))));
        assert_eq!(DepsVec::decode(&slots).unwrap(), v);
    }

    #[test]
    fn attr_change_breaks_chunk() {
        let unknown = DepValue::Crc(Crc::Unknown);
        let v = DepsVec::from_deps(vec![
            dep(0, false, unknown),
            dep(1, true, unknown),
            dep(2, true, unknown),
        ]);
        let slots = v.encode();
        // node 0 is its own chunk, nodes 1-2 share one.
        assert!(matches!(slots[0], DepSlot::Hdr { sz: 0, .. }));
        assert!(matches!(slots[1], DepSlot::Hdr { sz: 1, .. }));
        assert_eq!(DepsVec::decode(&slots).unwrap(), v);
    }

    #[test]
    fn valued_deps_become_headers() {
        let v = DepsVec::from_deps(vec![
            dep(0, false, DepValue::Crc(Crc::Unknown)),
            dep(1, false, DepValue::Crc(Crc::Reg(42))),
            dep(2, false, DepValue::Crc(Crc::Reg(43))),
        ]);
        let slots = v.encode();
        // 0 is bare under 1's header; 2 is its own chunk.
        assert_eq!(slots.len(), 3);
        assert!(matches!(
            slots[0],
            DepSlot::Hdr { node: NodeId(1), value: DepValue::Crc(Crc::Reg(42)), sz: 1, .. }
        ));
        assert!(matches!(slots[1], DepSlot::Bare(NodeId(0))));
        assert!(matches!(slots[2], DepSlot::Hdr { node: NodeId(2), sz: 0, .. }));
        assert_eq!(DepsVec::decode(&slots).unwrap(), v);
    }

    #[test]
    fn shorten_and_replace_tail() {
        let unknown = DepValue::Crc(Crc::Unknown);
        let mut v = DepsVec::from_deps(vec![
            dep(0, true, unknown),
            dep(1, false, unknown),
            dep(2, false, unknown),
        ]);
        v.shorten_by(2);
        assert_eq!(v.len(), 1);
        v.replace_tail(1, vec![dep(7, false, unknown)]);
        assert_eq!(v.len(), 2);
        assert_eq!(v.get(1).unwrap().node, NodeId(7));
    }

    #[test]
    fn decode_rejects_stray_bare() {
        let err = DepsVec::decode(&[DepSlot::Bare(NodeId(0))]).unwrap_err();
        assert_eq!(err, DepsDecodeError::BareWithoutHeader);
    }
}
