//! Object storage holding one folder per report.
//!
//! Backends are blocking: they are called from the render worker and from
//! script capabilities, both of which run on the blocking pool.

use serde::Serialize;
use thiserror::Error;

pub mod fs;
pub mod memory;
pub mod retry;
pub mod s3;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;
pub use retry::RetryPolicy;
pub use s3::S3LikeObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum StoreErrorCode {
    NotFound,
    Validation,
    Network,
    Io,
    Rejected,
    TooLarge,
}

impl StoreErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation_error",
            Self::Network => "network_error",
            Self::Io => "io_error",
            Self::Rejected => "rejected",
            Self::TooLarge => "too_large",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", .code.as_str())]
pub struct StoreError {
    pub code: StoreErrorCode,
    pub message: String,
}

impl StoreError {
    #[must_use]
    pub fn new(code: StoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// An object over the configured size cap
    pub fn too_large(key: &str, size: u64, limit: u64) -> Self {
        Self::new(
            StoreErrorCode::TooLarge,
            format!("{} is {} bytes, limit is {}", key, size, limit),
        )
    }

    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        self.code == StoreErrorCode::Network
    }
}

/// Result of a metadata-only existence probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: Option<u64>,
}

#[cfg_attr(test, mockall::automock)]
pub trait ObjectStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn bucket(&self) -> String;

    /// Probe an object without downloading it. `Ok(None)` means absent.
    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Reject keys that could escape the bucket
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::new(StoreErrorCode::Validation, "empty object key"));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(StoreError::new(
            StoreErrorCode::Validation,
            format!("invalid object key: {}", key),
        ));
    }
    if key.split('/').any(|segment| segment == "..") {
        return Err(StoreError::new(
            StoreErrorCode::Validation,
            format!("object key escapes the bucket: {}", key),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("r1/main.js").is_ok());
        assert!(validate_key("a/b/c.csv").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("r1/../../secret").is_err());
        assert!(validate_key("r1\\main.js").is_err());
    }

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(StoreError::new(StoreErrorCode::Network, "reset").is_transient());
        assert!(!StoreError::new(StoreErrorCode::NotFound, "gone").is_transient());
        assert!(!StoreError::new(StoreErrorCode::Io, "disk").is_transient());
    }

    #[test]
    fn test_display() {
        let err = StoreError::too_large("r1/main.js", 9_000_000, 1024);
        assert_eq!(
            err.to_string(),
            "too_large: r1/main.js is 9000000 bytes, limit is 1024"
        );
        assert!(!err.is_transient());
    }
}
