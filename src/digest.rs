// src/digest.rs

//! Access masks, dep/target flags, and the digests exchanged between the
//! engine, the gather, and the cache.
//!
//! A digest is a compact, serializable summary: per-dep ([`DepDigest`]),
//! per-target ([`TargetDigest`]) or per-job ([`JobDigest`], produced at job
//! end and consumed by end-processing and the content cache).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hash::{Crc, DepValue, FileDate};

/// Three-valued logic used for write observation and speculation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Bool3 {
    #[default]
    No,
    Maybe,
    Yes,
}

impl Bool3 {
    pub fn min(self, other: Bool3) -> Bool3 {
        if self <= other {
            self
        } else {
            other
        }
    }
}

/// Which projections of a file's content a syscall observed.
///
/// `Stat` is inode-level (existence, kind), `Lnk` is the link target,
/// `Reg` is regular content.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Accesses(u8);

impl Accesses {
    pub const NONE: Accesses = Accesses(0);
    pub const STAT: Accesses = Accesses(1 << 0);
    pub const LNK: Accesses = Accesses(1 << 1);
    pub const REG: Accesses = Accesses(1 << 2);

    pub fn all() -> Accesses {
        Accesses(0b111)
    }

    /// Link + regular content, the mask of a plain data read.
    pub fn data() -> Accesses {
        Accesses(Self::LNK.0 | Self::REG.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn stat(self) -> bool {
        self.0 & Self::STAT.0 != 0
    }

    pub fn lnk(self) -> bool {
        self.0 & Self::LNK.0 != 0
    }

    pub fn reg(self) -> bool {
        self.0 & Self::REG.0 != 0
    }

    pub fn union(self, other: Accesses) -> Accesses {
        Accesses(self.0 | other.0)
    }
}

/// Flags attached to a dep edge.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DepFlags(u8);

impl DepFlags {
    pub const NONE: DepFlags = DepFlags(0);
    pub const CRITICAL: DepFlags = DepFlags(1 << 0);
    pub const ESSENTIAL: DepFlags = DepFlags(1 << 1);
    pub const IGNORE_ERROR: DepFlags = DepFlags(1 << 2);
    pub const REQUIRED: DepFlags = DepFlags(1 << 3);
    pub const STATIC: DepFlags = DepFlags(1 << 4);

    pub fn has(self, flag: DepFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn with(self, flag: DepFlags) -> DepFlags {
        DepFlags(self.0 | flag.0)
    }

    pub fn union(self, other: DepFlags) -> DepFlags {
        DepFlags(self.0 | other.0)
    }

    pub fn critical(self) -> bool {
        self.has(Self::CRITICAL)
    }

    pub fn is_static(self) -> bool {
        self.has(Self::STATIC)
    }
}

/// Flags attached to a target, both declared and observed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TargetFlags(u16);

impl TargetFlags {
    pub const NONE: TargetFlags = TargetFlags(0);
    pub const ESSENTIAL: TargetFlags = TargetFlags(1 << 0);
    pub const INCREMENTAL: TargetFlags = TargetFlags(1 << 1);
    pub const NO_UNIQUIFY: TargetFlags = TargetFlags(1 << 2);
    pub const NO_WARNING: TargetFlags = TargetFlags(1 << 3);
    pub const PHONY: TargetFlags = TargetFlags(1 << 4);
    pub const STATIC: TargetFlags = TargetFlags(1 << 5);
    pub const TARGET: TargetFlags = TargetFlags(1 << 6);
    /// A CRC is computed and recorded for this target.
    pub const CRC: TargetFlags = TargetFlags(1 << 7);
    /// Overwriting a manually edited file is allowed.
    pub const MANUAL_OK: TargetFlags = TargetFlags(1 << 8);
    // extra flags
    pub const IGNORE: TargetFlags = TargetFlags(1 << 9);
    pub const SOURCE_OK: TargetFlags = TargetFlags(1 << 10);
    pub const ALLOW: TargetFlags = TargetFlags(1 << 11);
    pub const WASH: TargetFlags = TargetFlags(1 << 12);

    /// Default flags for a declared target.
    pub fn dflt() -> TargetFlags {
        Self::TARGET
            .with(Self::CRC)
            .with(Self::ALLOW)
            .with(Self::WASH)
    }

    pub fn has(self, flag: TargetFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn with(self, flag: TargetFlags) -> TargetFlags {
        TargetFlags(self.0 | flag.0)
    }

    pub fn without(self, flag: TargetFlags) -> TargetFlags {
        TargetFlags(self.0 & !flag.0)
    }

    pub fn union(self, other: TargetFlags) -> TargetFlags {
        TargetFlags(self.0 | other.0)
    }
}

/// Terminal classification of a job execution.
///
/// The declaration order is the surface ordering: `<= Killed` means the job
/// was killed, `<= Garbage` means it did not run reliably, `>= Err` means it
/// ended in error.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Status {
    #[default]
    New,
    Lost,
    Killed,
    ChkDeps,
    Garbage,
    Ok,
    Frozen,
    Err,
    ErrFrozen,
    Timeout,
    SystemErr,
}

impl Status {
    pub fn was_killed(self) -> bool {
        self <= Status::Killed
    }

    /// True when the execution cannot be trusted and must not be recorded
    /// as authoritative.
    pub fn is_garbage(self) -> bool {
        self <= Status::Garbage
    }

    pub fn is_err(self) -> bool {
        self >= Status::Err
    }

    pub fn is_frozen(self) -> bool {
        matches!(self, Status::Frozen | Status::ErrFrozen)
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok | Status::Frozen)
    }
}

/// Running summary of the accesses observed on one path, kept by the gather.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDigest {
    pub write: Bool3,
    pub accesses: Accesses,
    pub dflags: DepFlags,
    pub tflags: TargetFlags,
}

/// Per-dep descriptor as reported at job end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepDigest {
    /// File date at observation time.
    pub date: FileDate,
    pub accesses: Accesses,
    pub dflags: DepFlags,
    /// Opened simultaneously with the previous dep.
    pub parallel: bool,
    /// CRC when the reporter already hashed the file, signature otherwise.
    pub value: DepValue,
}

impl DepDigest {
    pub fn is_crc(&self) -> bool {
        self.value.is_crc()
    }
}

/// Per-target descriptor as reported at job end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDigest {
    pub tflags: TargetFlags,
    /// Union of read accesses observed before the first write.
    pub accesses: Accesses,
    pub write: bool,
    /// Only meaningful when `write` is set.
    pub crc: Crc,
}

/// Execution time breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub cpu: Duration,
    /// Wall-clock spent inside the job.
    pub job: Duration,
    /// Wall-clock including engine overhead.
    pub total: Duration,
    /// Peak resident set, in bytes.
    pub mem: u64,
}

/// Everything the engine needs to end-process one job execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDigest {
    pub status: Status,
    pub targets: Vec<(String, TargetDigest)>,
    pub deps: Vec<(String, DepDigest)>,
    pub stderr: String,
    pub stats: JobStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering_bands() {
        assert!(Status::New.was_killed());
        assert!(Status::Killed.was_killed());
        assert!(!Status::ChkDeps.was_killed());
        assert!(Status::Garbage.is_garbage());
        assert!(!Status::Ok.is_garbage());
        assert!(Status::Err.is_err());
        assert!(Status::Timeout.is_err());
        assert!(!Status::Frozen.is_err());
        assert!(Status::ErrFrozen.is_frozen());
    }

    #[test]
    fn accesses_mask_ops() {
        let a = Accesses::STAT.union(Accesses::REG);
        assert!(a.stat() && a.reg() && !a.lnk());
        assert!(Accesses::NONE.is_empty());
        assert_eq!(Accesses::data(), Accesses::LNK.union(Accesses::REG));
    }

    #[test]
    fn speculation_is_monotone_under_min() {
        assert_eq!(Bool3::Yes.min(Bool3::Maybe), Bool3::Maybe);
        assert_eq!(Bool3::Maybe.min(Bool3::No), Bool3::No);
        assert_eq!(Bool3::No.min(Bool3::Yes), Bool3::No);
    }
}
