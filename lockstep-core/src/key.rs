//! Backing-store entity keys.
//!
//! A [`Key`] names one entity: an optional namespace, an ancestor path and a
//! final element that is either a numeric id, a string name, or incomplete
//! (the store assigns an id on put). Two keys are cache-equivalent iff their
//! encodings are equal, so [`Key::encode`] must be injective; it uses a
//! length-prefixed, prefix-free format.
//!
//! # Encoding
//!
//! ```text
//! <len>:<namespace> ( '/' <len>:<kind> ( 'i' <id> | 'n' <len>:<name> | '*' ) )+
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ValidationError;

/// Identifier of the last path element of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyId {
    /// The backing store assigns an id when the entity is first put.
    Incomplete,
    Id(i64),
    Name(String),
}

/// Entity key in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    namespace: String,
    kind: String,
    id: KeyId,
    parent: Option<Box<Key>>,
}

impl Key {
    /// Key with a string name.
    pub fn named(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::build(kind, KeyId::Name(name.into()))
    }

    /// Key with a numeric id.
    pub fn with_id(kind: impl Into<String>, id: i64) -> Self {
        Self::build(kind, KeyId::Id(id))
    }

    /// Key whose id is allocated by the store on first put.
    pub fn incomplete(kind: impl Into<String>) -> Self {
        Self::build(kind, KeyId::Incomplete)
    }

    fn build(kind: impl Into<String>, id: KeyId) -> Self {
        Self {
            namespace: String::new(),
            kind: kind.into(),
            id,
            parent: None,
        }
    }

    /// Place this key under `parent`. The key inherits the parent's namespace.
    pub fn with_parent(mut self, parent: Key) -> Self {
        self.namespace = parent.namespace.clone();
        self.parent = Some(Box::new(parent));
        self
    }

    /// Move this key (and its ancestors) into `namespace`.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let mut cursor = Some(&mut self);
        while let Some(key) = cursor {
            key.namespace = namespace.clone();
            cursor = key.parent.as_deref_mut();
        }
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &KeyId {
        &self.id
    }

    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_deref()
    }

    /// A complete key names exactly one entity; an incomplete key does not
    /// name anything until the store allocates its id.
    pub fn is_complete(&self) -> bool {
        !matches!(self.id, KeyId::Incomplete)
    }

    /// The same path with the final element replaced by a numeric id.
    pub fn complete_with(&self, id: i64) -> Self {
        Self {
            id: KeyId::Id(id),
            ..self.clone()
        }
    }

    /// Check the structural invariants a store call relies on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.kind.is_empty() {
            return Err(ValidationError::EmptyKind);
        }
        match &self.parent {
            Some(parent) if !parent.is_complete() => Err(ValidationError::IncompleteKey {
                key: parent.to_string(),
            }),
            Some(parent) => parent.validate(),
            None => Ok(()),
        }
    }

    /// Unique, deterministic string form of this key.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        push_str(&mut out, &self.namespace);
        self.encode_path(&mut out);
        out
    }

    fn encode_path(&self, out: &mut String) {
        if let Some(parent) = &self.parent {
            parent.encode_path(out);
        }
        out.push('/');
        push_str(out, &self.kind);
        match &self.id {
            KeyId::Incomplete => out.push('*'),
            KeyId::Id(id) => {
                out.push('i');
                out.push_str(&id.to_string());
                out.push(';');
            }
            KeyId::Name(name) => {
                out.push('n');
                push_str(out, name);
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{}/", parent)?;
        } else if !self.namespace.is_empty() {
            write!(f, "[{}]", self.namespace)?;
        }
        match &self.id {
            KeyId::Incomplete => write!(f, "{},*", self.kind),
            KeyId::Id(id) => write!(f, "{},{}", self.kind, id),
            KeyId::Name(name) => write!(f, "{},{:?}", self.kind, name),
        }
    }
}

fn push_str(out: &mut String, s: &str) {
    out.push_str(&s.len().to_string());
    out.push(':');
    out.push_str(s);
}
