//! Global heap: variable-length objects owned by a file.
//!
//! The virtual layout stores its serialized mapping table here and keeps
//! only the [`HeapId`] in the dataset header.

use crate::error::{Result, VdsError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Address of one heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeapId {
    /// Collection the object lives in.
    pub collection: u64,
    /// Object index within the collection (1-based; 0 is never handed out).
    pub index: u16,
}

/// A heap collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalHeap {
    collection: u64,
    next_index: u16,
    objects: BTreeMap<u16, Vec<u8>>,
}

impl GlobalHeap {
    pub fn new(collection: u64) -> Self {
        Self {
            collection,
            next_index: 1,
            objects: BTreeMap::new(),
        }
    }

    /// Store a copy of `data` and return its ID.
    pub fn insert(&mut self, data: &[u8]) -> Result<HeapId> {
        let index = self.next_index.max(1);
        if self.objects.contains_key(&index) || index == u16::MAX {
            return Err(VdsError::OutOfMemory(format!(
                "heap collection {:#x} is full",
                self.collection
            )));
        }
        self.objects.insert(index, data.to_vec());
        self.next_index = index + 1;
        Ok(HeapId {
            collection: self.collection,
            index,
        })
    }

    pub fn get(&self, id: HeapId) -> Result<&[u8]> {
        self.check_collection(id)?;
        self.objects
            .get(&id.index)
            .map(Vec::as_slice)
            .ok_or_else(|| VdsError::NotFound(format!("heap object {}", id.index)))
    }

    pub fn remove(&mut self, id: HeapId) -> Result<()> {
        self.check_collection(id)?;
        self.objects
            .remove(&id.index)
            .map(|_| ())
            .ok_or_else(|| VdsError::NotFound(format!("heap object {}", id.index)))
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn check_collection(&self, id: HeapId) -> Result<()> {
        if id.collection != self.collection {
            return Err(VdsError::NotFound(format!(
                "heap collection {:#x}",
                id.collection
            )));
        }
        Ok(())
    }
}
