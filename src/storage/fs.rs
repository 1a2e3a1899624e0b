use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{ObjectMeta, ObjectStore, StoreError, StoreErrorCode, validate_key};

/// A local directory used as the bucket; keys are relative paths inside it.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn io_error(key: &str, e: std::io::Error) -> StoreError {
    StoreError::new(StoreErrorCode::Io, format!("{}: {}", key, e))
}

impl ObjectStore for FsObjectStore {
    fn backend_name(&self) -> &'static str {
        "fs"
    }

    fn bucket(&self) -> String {
        self.bucket.clone()
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let path = self.path_for(key)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: Some(meta.len()),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, e)),
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::new(StoreErrorCode::NotFound, format!("{} not found", key))
            } else {
                io_error(key, e)
            }
        })
    }
}
