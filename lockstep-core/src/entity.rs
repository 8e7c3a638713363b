//! The entity capability: anything that can become bytes and come back.

use serde::{de::DeserializeOwned, Serialize};

use crate::{LockstepError, LockstepResult};

/// Types that can be stored in the backing store and snapshotted in the
/// cache.
///
/// Implemented for every serde type; the byte form is JSON.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn to_bytes(&self) -> LockstepResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(LockstepError::codec)
    }

    fn from_bytes(bytes: &[u8]) -> LockstepResult<Self> {
        serde_json::from_slice(bytes).map_err(LockstepError::codec)
    }
}

impl<T> Entity for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}
