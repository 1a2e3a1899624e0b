//! Resolves a report to its entry script in object storage and stages it
//! for execution.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::PortalError;
use crate::metadata::ReportCatalog;
use crate::model::ReportRecord;
use crate::report_config::ReportConfig;
use crate::staging::StagingSession;
use crate::storage::{ObjectStore, RetryPolicy, StoreError, StoreErrorCode};

/// A script downloaded and staged for one render cycle
#[derive(Debug, Clone)]
pub struct FetchedScript {
    pub text: String,
    pub staged_path: PathBuf,
    pub key: String,
}

/// Presentation settings of a report plus a banner when they could not be read
#[derive(Debug, Clone, Default)]
pub struct Presentation {
    pub config: ReportConfig,
    pub warning: Option<String>,
}

#[derive(Clone)]
pub struct ScriptFetcher {
    store: Arc<dyn ObjectStore>,
    entry_file: String,
    config_file: String,
    retry: RetryPolicy,
    max_object_bytes: usize,
}

impl ScriptFetcher {
    pub fn new(store: Arc<dyn ObjectStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            entry_file: config.entry_file.clone(),
            config_file: config.config_file.clone(),
            retry: RetryPolicy::new(config.max_attempts, config.base_backoff_ms),
            max_object_bytes: config.max_object_bytes,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn entry_file(&self) -> &str {
        &self.entry_file
    }

    /// Resolve `report_id` in the catalog, then download and stage its script.
    pub fn fetch_script(
        &self,
        report_id: &str,
        catalog: &ReportCatalog,
        session: &StagingSession,
    ) -> Result<FetchedScript, PortalError> {
        let record = catalog.resolve(report_id)?;
        self.fetch_record_script(record, session)
    }

    /// Download and stage the entry script of an already resolved record.
    ///
    /// The existence probe runs first: an absent object is `NotFound` and
    /// nothing is written to the staging area.
    pub fn fetch_record_script(
        &self,
        record: &ReportRecord,
        session: &StagingSession,
    ) -> Result<FetchedScript, PortalError> {
        let key = record.object_key(&self.entry_file);
        if record.storage_path.trim_matches('/').is_empty() {
            return Err(PortalError::NotFound { key });
        }

        let bytes = self.download(&key)?;
        std::str::from_utf8(&bytes)
            .map_err(|e| PortalError::transfer(&key, format!("script is not valid UTF-8: {}", e)))?;

        let staged_path = session.stage(&self.entry_file, &bytes)?;
        let text = fs::read_to_string(&staged_path).map_err(|e| {
            PortalError::staging(format!("cannot read {}: {}", staged_path.display(), e))
        })?;

        debug!(
            report_id = %record.report_id,
            key = %key,
            staged = %staged_path.display(),
            bytes = text.len(),
            "script staged"
        );
        Ok(FetchedScript {
            text,
            staged_path,
            key,
        })
    }

    /// Probe, then download `key` with bounded retries.
    pub fn download(&self, key: &str) -> Result<Vec<u8>, PortalError> {
        let meta = self
            .retry
            .run(key, || self.store.head(key))
            .map_err(|e| to_portal_error(key, e))?
            .ok_or_else(|| PortalError::NotFound {
                key: key.to_string(),
            })?;
        if let Some(size) = meta.size {
            self.check_size(key, size)?;
        }

        let bytes = self
            .retry
            .run(key, || self.store.get(key))
            .map_err(|e| to_portal_error(key, e))?;
        self.check_size(key, bytes.len() as u64)?;
        Ok(bytes)
    }

    /// Whether `key` exists; probe failures are errors, not `false`.
    pub fn exists(&self, key: &str) -> Result<bool, PortalError> {
        self.retry
            .run(key, || self.store.head(key))
            .map(|meta| meta.is_some())
            .map_err(|e| to_portal_error(key, e))
    }

    /// Load the optional presentation file next to the script.
    ///
    /// Never fails: a missing file yields defaults, anything else yields
    /// defaults plus a warning for the report area.
    pub fn fetch_presentation(&self, record: &ReportRecord) -> Presentation {
        let key = record.object_key(&self.config_file);
        let bytes = match self.download(&key) {
            Ok(bytes) => bytes,
            Err(PortalError::NotFound { .. }) => return Presentation::default(),
            Err(e) => {
                warn!(report_id = %record.report_id, key = %key, error = %e, "presentation file unavailable");
                return Presentation::with_warning(format!(
                    "Report settings could not be loaded ({}); using defaults.",
                    e
                ));
            }
        };

        let text = String::from_utf8_lossy(&bytes);
        match ReportConfig::parse(&text) {
            Ok(config) => Presentation {
                config,
                warning: None,
            },
            Err(e) => {
                warn!(report_id = %record.report_id, key = %key, error = %e, "invalid presentation file");
                Presentation::with_warning(format!(
                    "Report settings in {} are invalid; using defaults.",
                    self.config_file
                ))
            }
        }
    }

    fn check_size(&self, key: &str, size: u64) -> Result<(), PortalError> {
        let limit = self.max_object_bytes as u64;
        if size > limit {
            return Err(to_portal_error(key, StoreError::too_large(key, size, limit)));
        }
        Ok(())
    }
}

impl Presentation {
    fn with_warning(message: String) -> Self {
        Self {
            config: ReportConfig::default(),
            warning: Some(message),
        }
    }
}

fn to_portal_error(key: &str, err: StoreError) -> PortalError {
    match err.code {
        StoreErrorCode::NotFound => PortalError::NotFound {
            key: key.to_string(),
        },
        _ => PortalError::transfer(key, err.to_string()),
    }
}
