//! Directory-backed snapshot store: `<root>/<document id>.json`.
//!
//! Saves write to a sibling temp file and rename over the target, so a
//! crash mid-save leaves the previous snapshot intact.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{validate_id, DocumentSnapshot, DocumentStorage, StorageError};

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FileStorage {
    /// Directory holding one file per document
    root: PathBuf,
}

impl FileStorage {
    /// Open the store at `root`, creating the directory if missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::debug!("Document storage opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, document_id: &str) -> Result<PathBuf, StorageError> {
        validate_id(document_id)?;
        Ok(self.root.join(format!("{document_id}.{EXTENSION}")))
    }
}

impl DocumentStorage for FileStorage {
    fn save(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError> {
        let path = self.path_for(&snapshot.id)?;
        let json = serde_json::to_vec_pretty(snapshot)?;

        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &path)?;

        log::debug!("Saved document {} ({} bytes)", snapshot.id, json.len());
        Ok(())
    }

    fn load(&self, document_id: &str) -> Result<DocumentSnapshot, StorageError> {
        let path = self.path_for(document_id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(document_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn exists(&self, document_id: &str) -> bool {
        self.path_for(document_id).map(|p| p.is_file()).unwrap_or(false)
    }

    fn delete(&self, document_id: &str) -> Result<bool, StorageError> {
        let path = self.path_for(document_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
