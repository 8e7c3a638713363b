//! Cache entries exchanged with cache backends.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::LockToken;

/// What a cache slot currently says about its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Someone is resolving this key; the value is their lock token.
    Locked,
    /// The backing store confirmed the entity does not exist.
    Absent,
    /// The value is a serialized entity snapshot.
    Present,
}

impl EntryStatus {
    /// Single-byte tag used by binary backends.
    pub fn as_byte(self) -> u8 {
        match self {
            EntryStatus::Locked => 1,
            EntryStatus::Absent => 2,
            EntryStatus::Present => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(EntryStatus::Locked),
            2 => Some(EntryStatus::Absent),
            3 => Some(EntryStatus::Present),
            _ => None,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryStatus::Locked => "locked",
            EntryStatus::Absent => "absent",
            EntryStatus::Present => "present",
        };
        f.write_str(s)
    }
}

/// Backend-private version stamp captured by a get and handed back on CAS.
///
/// The protocol never looks inside; backends encode whatever they compare.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CasToken(Vec<u8>);

impl CasToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CasToken({})", hex::encode(&self.0))
    }
}

/// The unit exchanged with a cache backend.
///
/// A `ttl` of zero means the entry never expires. The CAS token is fixed at
/// construction: backends attach it to entries they return, and the
/// protocol attaches a captured one to entries it CAS-writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub status: EntryStatus,
    pub ttl: Duration,
    cas: Option<CasToken>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, status: EntryStatus, value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            status,
            ttl,
            cas: None,
        }
    }

    /// A lock entry holding `token`.
    pub fn lock(key: impl Into<String>, token: LockToken, ttl: Duration) -> Self {
        Self::new(key, EntryStatus::Locked, token.as_bytes().to_vec(), ttl)
    }

    /// A negative-cache entry.
    pub fn absent(key: impl Into<String>, ttl: Duration) -> Self {
        Self::new(key, EntryStatus::Absent, Vec::new(), ttl)
    }

    /// An entity snapshot.
    pub fn present(key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        Self::new(key, EntryStatus::Present, value, ttl)
    }

    /// Attach the CAS token this entry will be compared against.
    pub fn with_cas(mut self, cas: CasToken) -> Self {
        self.cas = Some(cas);
        self
    }

    pub fn cas(&self) -> Option<&CasToken> {
        self.cas.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.status == EntryStatus::Locked
    }

    /// True when this is a lock entry holding exactly `token`.
    pub fn is_locked_by(&self, token: LockToken) -> bool {
        self.is_locked() && self.value == token.as_bytes()
    }
}
