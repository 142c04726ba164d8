//! In-memory store for compressed outputs
//!
//! Each successful session parks its output here and hands out a handle.
//! Handles are revoked explicitly when a result is superseded or discarded,
//! so the store never grows across repeated compress/discard cycles.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Reference to bytes held by a [`BlobStore`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobHandle {
    id: Uuid,
    size: u64,
}

impl BlobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug, Default)]
pub struct BlobStore {
    blobs: Mutex<HashMap<Uuid, Arc<[u8]>>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `bytes` and return a handle to them
    pub fn create(&self, bytes: Vec<u8>) -> BlobHandle {
        let handle = BlobHandle {
            id: Uuid::new_v4(),
            size: bytes.len() as u64,
        };
        self.blobs.lock().insert(handle.id, Arc::from(bytes));
        handle
    }

    /// Bytes behind a live handle
    pub fn get(&self, handle: &BlobHandle) -> Option<Arc<[u8]>> {
        self.blobs.lock().get(&handle.id).cloned()
    }

    /// Release the bytes; returns false if the handle was already revoked
    pub fn revoke(&self, handle: &BlobHandle) -> bool {
        self.blobs.lock().remove(&handle.id).is_some()
    }

    pub fn contains(&self, handle: &BlobHandle) -> bool {
        self.blobs.lock().contains_key(&handle.id)
    }

    /// Number of live blobs
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
