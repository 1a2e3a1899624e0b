use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::PortalError;
use crate::model::{RecordRejection, ReportRecord};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata backend unreachable: {0}")]
    Unavailable(String),

    #[error("metadata document is malformed: {0}")]
    Malformed(String),
}

/// Read-only access to the report metadata table.
///
/// Implementations return raw items; normalization happens in [`list_reports`].
#[async_trait]
pub trait MetadataStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn scan(&self) -> Result<Vec<Value>, MetadataError>;
}

/// Result of one catalog load
#[derive(Debug, Default)]
pub struct ReportCatalog {
    reports: HashMap<String, ReportRecord>,
    /// Items dropped because they lacked an identifier
    pub skipped: usize,
    /// Set when the backing store could not be read
    pub unavailable: Option<PortalError>,
}

impl ReportCatalog {
    pub fn from_records(records: impl IntoIterator<Item = ReportRecord>) -> Self {
        Self {
            reports: records
                .into_iter()
                .map(|r| (r.report_id.clone(), r))
                .collect(),
            skipped: 0,
            unavailable: None,
        }
    }

    /// Every well-formed record, soft-deleted ones included
    pub fn all(&self) -> &HashMap<String, ReportRecord> {
        &self.reports
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Records visible in listings, sorted by title then id
    pub fn active(&self) -> Vec<&ReportRecord> {
        let mut active: Vec<&ReportRecord> = self.reports.values().filter(|r| !r.deleted).collect();
        active.sort_by(|a, b| {
            a.title
                .to_lowercase()
                .cmp(&b.title.to_lowercase())
                .then_with(|| a.report_id.cmp(&b.report_id))
        });
        active
    }

    /// Look up a report for rendering. Soft-deleted records resolve like unknown ones.
    pub fn resolve(&self, report_id: &str) -> Result<&ReportRecord, PortalError> {
        match self.reports.get(report_id) {
            Some(record) if !record.deleted => Ok(record),
            Some(_) => {
                debug!(report_id = %report_id, "refusing to resolve soft-deleted report");
                Err(PortalError::record_not_found(report_id))
            }
            None => Err(PortalError::record_not_found(report_id)),
        }
    }
}

/// Load every report record from the store.
///
/// Never fails: an unreachable store yields an empty catalog carrying a
/// `StoreUnavailable` condition, and malformed items are skipped and counted.
pub async fn list_reports(store: &dyn MetadataStore) -> ReportCatalog {
    let items = match store.scan().await {
        Ok(items) => items,
        Err(e) => {
            warn!(backend = store.backend_name(), error = %e, "failed to load report metadata");
            return ReportCatalog {
                unavailable: Some(PortalError::store_unavailable(e.to_string())),
                ..ReportCatalog::default()
            };
        }
    };

    let mut catalog = ReportCatalog::default();
    for item in &items {
        match ReportRecord::from_item(item) {
            Ok(record) => {
                catalog.reports.insert(record.report_id.clone(), record);
            }
            Err(RecordRejection::MissingId) | Err(RecordRejection::NotAnObject) => {
                catalog.skipped += 1;
            }
        }
    }

    if catalog.skipped > 0 {
        warn!(
            backend = store.backend_name(),
            skipped = catalog.skipped,
            "skipped metadata items without a report_id"
        );
    }
    debug!(
        backend = store.backend_name(),
        loaded = catalog.reports.len(),
        "loaded report metadata"
    );
    catalog
}

/// Metadata kept in a JSON document on disk.
///
/// The document is either an object keyed by report id or an array of items.
pub struct JsonMetadataStore {
    path: PathBuf,
}

impl JsonMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    fn backend_name(&self) -> &'static str {
        "json"
    }

    async fn scan(&self) -> Result<Vec<Value>, MetadataError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| MetadataError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        let document: Value =
            serde_json::from_str(&raw).map_err(|e| MetadataError::Malformed(e.to_string()))?;
        items_from_document(document)
    }
}

/// Flatten a keyed document into table items
pub fn items_from_document(document: Value) -> Result<Vec<Value>, MetadataError> {
    match document {
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, mut item)| {
                if let Value::Object(fields) = &mut item {
                    fields
                        .entry("report_id")
                        .or_insert_with(|| Value::String(key));
                }
                item
            })
            .collect()),
        _ => Err(MetadataError::Malformed(
            "expected an object keyed by report id or an array of items".to_string(),
        )),
    }
}

/// In-process metadata, used by tests and local development
#[derive(Clone, Default)]
pub struct MemoryMetadataStore {
    items: Arc<Mutex<Vec<Value>>>,
    offline: Arc<Mutex<bool>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<Value>) -> Self {
        let store = Self::default();
        store.replace(items);
        store
    }

    pub fn replace(&self, items: Vec<Value>) {
        if let Ok(mut guard) = self.items.lock() {
            *guard = items;
        }
    }

    pub fn push(&self, item: Value) {
        if let Ok(mut guard) = self.items.lock() {
            guard.push(item);
        }
    }

    /// Make subsequent scans fail as if the backend were down
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut guard) = self.offline.lock() {
            *guard = offline;
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn scan(&self) -> Result<Vec<Value>, MetadataError> {
        let offline = self
            .offline
            .lock()
            .map(|g| *g)
            .map_err(|_| MetadataError::Unavailable("memory store poisoned".to_string()))?;
        if offline {
            return Err(MetadataError::Unavailable("memory store offline".to_string()));
        }
        self.items
            .lock()
            .map(|g| g.clone())
            .map_err(|_| MetadataError::Unavailable("memory store poisoned".to_string()))
    }
}
