//! In-process snapshot store for tests and ephemeral servers.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{validate_id, DocumentSnapshot, DocumentStorage, StorageError};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    snapshots: RwLock<HashMap<String, DocumentSnapshot>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StorageError {
    StorageError::Io(std::io::Error::other("memory storage lock poisoned"))
}

impl DocumentStorage for MemoryStorage {
    fn save(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError> {
        validate_id(&snapshot.id)?;
        let mut snapshots = self.snapshots.write().map_err(|_| poisoned())?;
        snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    fn load(&self, document_id: &str) -> Result<DocumentSnapshot, StorageError> {
        let snapshots = self.snapshots.read().map_err(|_| poisoned())?;
        snapshots
            .get(document_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(document_id.to_string()))
    }

    fn exists(&self, document_id: &str) -> bool {
        self.snapshots
            .read()
            .map(|s| s.contains_key(document_id))
            .unwrap_or(false)
    }

    fn delete(&self, document_id: &str) -> Result<bool, StorageError> {
        let mut snapshots = self.snapshots.write().map_err(|_| poisoned())?;
        Ok(snapshots.remove(document_id).is_some())
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let snapshots = self.snapshots.read().map_err(|_| poisoned())?;
        let mut ids: Vec<String> = snapshots.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
