//! Opaque pagination cursors.
//!
//! A cursor is the raw 16-byte ordering key of the last row a reader
//! consumed. Readers persist it verbatim between reads; the only
//! operations they need are "start of feed" and equality. The byte
//! content is an implementation detail of the store.
use crate::ulid::ChangeUlid;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque position in a shard's ordered feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cursor(pub(crate) [u8; 16]);

impl Cursor {
    /// Position before the first row of the feed.
    pub const START: Cursor = Cursor([0u8; 16]);

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Rebuild a cursor persisted by a consumer. Anything but exactly
    /// 16 bytes is a corrupted checkpoint.
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl From<ChangeUlid> for Cursor {
    fn from(key: ChangeUlid) -> Self {
        Self(*key.as_bytes())
    }
}

impl std::fmt::Display for Cursor {
    /// Lowercase hex, for logs and CLI flags.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Cursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != 32 {
            return Err(format!("cursor must be 32 hex chars, got {}", s.len()));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let text = std::str::from_utf8(chunk).map_err(|e| e.to_string())?;
            bytes[i] = u8::from_str_radix(text, 16).map_err(|e| e.to_string())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}
