//! Heterogeneous mutations applied in one backing-store call.

use serde::{Deserialize, Serialize};

use crate::Key;

/// The kind of change a [`Mutation`] makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    /// Create; fails if the entity already exists.
    Insert,
    /// Create or overwrite.
    Upsert,
    /// Overwrite; fails if the entity does not exist.
    Update,
    Delete,
}

impl MutationKind {
    /// Whether the lock taken for this mutation is released once the store
    /// call succeeds. A delete keeps its lock: that lock is the desired
    /// negative state until it expires.
    pub fn reopens_cache(self) -> bool {
        !matches!(self, MutationKind::Delete)
    }

    pub fn carries_value(self) -> bool {
        !matches!(self, MutationKind::Delete)
    }
}

/// One entry of a mixed mutation batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation<V> {
    pub kind: MutationKind,
    pub key: Key,
    pub value: Option<V>,
}

impl<V> Mutation<V> {
    pub fn insert(key: Key, value: V) -> Self {
        Self {
            kind: MutationKind::Insert,
            key,
            value: Some(value),
        }
    }

    pub fn upsert(key: Key, value: V) -> Self {
        Self {
            kind: MutationKind::Upsert,
            key,
            value: Some(value),
        }
    }

    pub fn update(key: Key, value: V) -> Self {
        Self {
            kind: MutationKind::Update,
            key,
            value: Some(value),
        }
    }

    pub fn delete(key: Key) -> Self {
        Self {
            kind: MutationKind::Delete,
            key,
            value: None,
        }
    }

    /// Convert the payload, keeping kind and key.
    pub fn try_map<U, E>(self, f: impl FnOnce(V) -> Result<U, E>) -> Result<Mutation<U>, E> {
        let value = self.value.map(f).transpose()?;
        Ok(Mutation {
            kind: self.kind,
            key: self.key,
            value,
        })
    }
}
