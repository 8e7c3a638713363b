//! Lock tokens.
//!
//! A lock token is the value stored in a `Locked` cache entry. Reads mint a
//! fresh one per key so that, after racing an add-if-absent against other
//! callers, a re-read can tell "the lock I wrote" from "someone else's".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a lock token in bytes.
pub const LOCK_TOKEN_LEN: usize = 4;

/// Pseudorandom 4-byte lock value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken([u8; LOCK_TOKEN_LEN]);

impl LockToken {
    pub fn from_bytes(bytes: [u8; LOCK_TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LOCK_TOKEN_LEN] {
        &self.0
    }
}

impl From<u32> for LockToken {
    fn from(value: u32) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken({})", hex::encode(self.0))
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
