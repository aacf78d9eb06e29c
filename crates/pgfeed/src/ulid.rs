//! ULID keys and the cross-transaction generator state.
//!
//! # Purpose
//! Feed rows are ordered by a 128-bit ULID: a 48-bit millisecond time
//! prefix followed by 80 bits that are random-seeded but *monotonically
//! counted* within a shard. Unlike textbook ULIDs, the low 64 bits are a
//! counter that survives transaction boundaries: the shard row persists
//! the last `(prefix, suffix)` pair and the next transaction continues
//! from it, so ids on one shard are strictly increasing across writers.
//!
//! # Key invariants
//! - The prefix never moves backward: a stale time hint is corrected
//!   forward to the stored prefix rather than honored.
//! - The suffix is seeded with its two high bits clear whenever the
//!   prefix changes, leaving headroom for increments within the same
//!   millisecond prefix.
//! - State is persisted only on commit. A rolled-back transaction's
//!   reserved range is abandoned; this produces gaps, never duplicates.
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Mask applied to the random suffix seed when the prefix changes.
const SUFFIX_SEED_MASK: u64 = u64::MAX >> 2;

/// Largest representable ULID timestamp (48 bits of milliseconds).
const MAX_ULID_MILLIS: i64 = (1 << 48) - 1;

/// A 16-byte ordering key. Byte order equals key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeUlid(pub [u8; 16]);

impl ChangeUlid {
    pub fn from_parts(prefix: u64, suffix: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&prefix.to_be_bytes());
        bytes[8..].copy_from_slice(&suffix.to_be_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// High 8 bytes: 48-bit timestamp plus 16 entropy bits.
    pub fn prefix(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(bytes)
    }

    /// Low 8 bytes: the per-shard counter.
    pub fn suffix(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(bytes)
    }

    /// Millisecond timestamp encoded in the prefix.
    pub fn timestamp_ms(&self) -> i64 {
        (self.prefix() >> 16) as i64
    }
}

impl std::fmt::Display for ChangeUlid {
    /// Crockford base32, the canonical ULID text form.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        ulid::Ulid(u128::from_be_bytes(self.0)).fmt(f)
    }
}

impl std::str::FromStr for ChangeUlid {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed: ulid::Ulid = s.parse()?;
        Ok(Self(parsed.0.to_be_bytes()))
    }
}

impl Serialize for ChangeUlid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChangeUlid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

/// Generator state carried through one transaction attempt and persisted
/// on the shard row at commit.
///
/// Modeled as an explicit value passed into and out of each attempt
/// rather than shared mutable memory; see the shard lifecycle notes on
/// [`crate::store::ChangefeedStore::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UlidState {
    pub prefix: u64,
    pub suffix: u64,
}

impl UlidState {
    /// Zero state of a freshly inserted shard.
    pub fn initial() -> Self {
        Self {
            prefix: 0,
            suffix: 0,
        }
    }

    /// Rebuild from the two signed columns of the shard row.
    pub fn from_persisted(prefix: i64, suffix: i64) -> Self {
        // The sign conversions are intended: the columns are plain
        // bigints holding the raw bit patterns.
        Self {
            prefix: prefix as u64,
            suffix: suffix as u64,
        }
    }

    /// The two signed columns to write back on commit.
    pub fn to_persisted(self) -> (i64, i64) {
        (self.prefix as i64, self.suffix as i64)
    }

    pub fn timestamp_ms(&self) -> i64 {
        (self.prefix >> 16) as i64
    }

    /// Move the prefix forward to `hint_ms` if the hint is newer than
    /// the stored prefix; otherwise the stored (larger) prefix wins and
    /// the hint is silently corrected forward. Returns whether the
    /// prefix changed, which resets the suffix to a fresh random seed.
    pub fn advance_to(&mut self, hint_ms: i64) -> bool {
        let hint_ms = hint_ms.clamp(0, MAX_ULID_MILLIS);
        if hint_ms <= self.timestamp_ms() {
            return false;
        }
        let entropy: u16 = rand::random();
        self.prefix = ((hint_ms as u64) << 16) | u64::from(entropy);
        self.suffix = rand::random::<u64>() & SUFFIX_SEED_MASK;
        true
    }

    /// Hand out the next key and reserve it by bumping the counter.
    pub fn next(&mut self) -> ChangeUlid {
        let key = ChangeUlid::from_parts(self.prefix, self.suffix);
        self.suffix = self.suffix.wrapping_add(1);
        key
    }
}
