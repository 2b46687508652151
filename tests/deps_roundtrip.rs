// tests/deps_roundtrip.rs

//! Property tests for the chunked dep encoding: every logical sequence
//! survives encode/decode and serde round-trips, whatever mix of bare and
//! valued deps it contains.

use proptest::prelude::*;

use depmake::digest::{Accesses, DepFlags};
use depmake::hash::{Crc, DepValue, FileDate, FileSig, FileTag};
use depmake::store::deps::{Dep, DepsVec};
use depmake::store::NodeId;

fn arb_accesses() -> impl Strategy<Value = Accesses> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(s, l, r)| {
        let mut a = Accesses::NONE;
        if s {
            a = a.union(Accesses::STAT);
        }
        if l {
            a = a.union(Accesses::LNK);
        }
        if r {
            a = a.union(Accesses::REG);
        }
        a
    })
}

fn arb_dflags() -> impl Strategy<Value = DepFlags> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(c, s, i)| {
        let mut f = DepFlags::NONE;
        if c {
            f = f.with(DepFlags::CRITICAL);
        }
        if s {
            f = f.with(DepFlags::STATIC);
        }
        if i {
            f = f.with(DepFlags::IGNORE_ERROR);
        }
        f
    })
}

fn arb_value() -> impl Strategy<Value = DepValue> {
    prop_oneof![
        Just(DepValue::Crc(Crc::Unknown)),
        Just(DepValue::Crc(Crc::None)),
        Just(DepValue::Crc(Crc::Empty)),
        any::<u64>().prop_map(|h| DepValue::Crc(Crc::Reg(h))),
        any::<u64>().prop_map(|h| DepValue::Crc(Crc::Lnk(h))),
        (any::<u64>(), 0u8..4).prop_map(|(d, t)| {
            let tag = match t {
                0 => FileTag::Reg,
                1 => FileTag::Lnk,
                2 => FileTag::Empty,
                _ => FileTag::None,
            };
            DepValue::Sig(FileSig { date: FileDate(d), tag })
        }),
    ]
}

fn arb_dep() -> impl Strategy<Value = Dep> {
    (0u32..64, arb_accesses(), arb_dflags(), any::<bool>(), arb_value()).prop_map(
        |(node, accesses, dflags, parallel, value)| Dep {
            node: NodeId(node),
            accesses,
            dflags,
            parallel,
            value,
        },
    )
}

proptest! {
    #[test]
    fn encode_decode_preserves_logical_sequence(deps in prop::collection::vec(arb_dep(), 0..64)) {
        let v = DepsVec::from_deps(deps.clone());
        let slots = v.encode();
        let back = DepsVec::decode(&slots).unwrap();
        let logical: Vec<Dep> = back.iter().copied().collect();
        prop_assert_eq!(logical, deps);
    }

    #[test]
    fn serde_roundtrip(deps in prop::collection::vec(arb_dep(), 0..64)) {
        let v = DepsVec::from_deps(deps);
        let json = serde_json::to_string(&v).unwrap();
        let back: DepsVec = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, v);
    }

    #[test]
    fn truncation_matches_plain_vector(
        deps in prop::collection::vec(arb_dep(), 0..32),
        n in 0usize..40,
    ) {
        let mut v = DepsVec::from_deps(deps.clone());
        v.shorten_by(n);
        let mut expect = deps;
        expect.truncate(expect.len().saturating_sub(n));
        prop_assert_eq!(v.iter().copied().collect::<Vec<_>>(), expect);
    }
}

/// Long uniform runs exceed the chunk size cap and still round-trip.
#[test]
fn oversized_uniform_run_roundtrips() {
    let deps: Vec<Dep> = (0..600)
        .map(|i| Dep::new(NodeId(i), Accesses::data(), DepFlags::STATIC, false))
        .collect();
    let v = DepsVec::from_deps(deps.clone());
    let back = DepsVec::decode(&v.encode()).unwrap();
    assert_eq!(back.iter().copied().collect::<Vec<_>>(), deps);
}
