//! The report resolution and execution flow, plus the shared application state.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::capabilities::{HostCapabilities, build_context};
use crate::config::{Config, MetadataBackend, StorageBackend};
use crate::conversion::blocks_to_html;
use crate::database::PgMetadataStore;
use crate::error::{ExecutionError, PortalError};
use crate::fetcher::{Presentation, ScriptFetcher};
use crate::js_engine::{self, ExecutionLimits};
use crate::metadata::{
    JsonMetadataStore, MemoryMetadataStore, MetadataStore, ReportCatalog, list_reports,
};
use crate::model::ReportRecord;
use crate::page::{HostPage, PageConfig, PageOutput};
use crate::render::{Banner, ErrorPanel, Renderer, ReportView};
use crate::report_config::ReportConfig;
use crate::staging::{PurgeReport, StagingArea, StagingSession};
use crate::storage::{FsObjectStore, ObjectStore, S3LikeObjectStore};

/// Id of the stand-in record used for ad-hoc scripts
pub const SANDBOX_REPORT_ID: &str = "sandbox";

/// Shared state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metadata: Arc<dyn MetadataStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub staging: StagingArea,
    pub renderer: Arc<Renderer>,
}

impl AppState {
    /// Build the stores named by the configuration.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate().map_err(PortalError::from)?;
        let metadata = metadata_from_config(&config).await?;
        let objects = objects_from_config(&config)?;
        Self::with_stores(config, metadata, objects)
    }

    /// Build state around already constructed stores.
    pub fn with_stores(
        config: Config,
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let renderer = Renderer::new(config.portal.clone()).context("Failed to compile templates")?;
        info!(
            metadata = metadata.backend_name(),
            storage = objects.backend_name(),
            bucket = %objects.bucket(),
            "report portal state ready"
        );
        Ok(Self {
            staging: StagingArea::new(&config.staging.dir),
            config: Arc::new(config),
            metadata,
            objects,
            renderer: Arc::new(renderer),
        })
    }

    pub fn fetcher(&self) -> ScriptFetcher {
        ScriptFetcher::new(Arc::clone(&self.objects), &self.config.storage)
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits::from_config(&self.config.execution)
    }

    pub fn debug_traces(&self) -> bool {
        self.config.execution.debug_traces
    }

    /// Fresh catalog; nothing is cached between requests.
    pub async fn catalog(&self) -> ReportCatalog {
        list_reports(self.metadata.as_ref()).await
    }

    /// Remove staging leftovers older than the configured threshold.
    pub fn purge_stale(&self) -> PurgeReport {
        self.staging
            .purge_stale(Duration::from_secs(self.config.staging.stale_after_secs))
    }

    /// Resolve, fetch, execute and clean up one report.
    ///
    /// Every failure is carried in the result; none of them escapes.
    pub async fn render_report(&self, report_id: &str, catalog: &ReportCatalog) -> RenderedReport {
        let record = match catalog.resolve(report_id) {
            Ok(record) => record.clone(),
            Err(e) => {
                let error = match &catalog.unavailable {
                    Some(PortalError::StoreUnavailable { message }) => {
                        PortalError::store_unavailable(message.clone())
                    }
                    _ => e,
                };
                return RenderedReport::failed(report_id, error);
            }
        };

        let fetcher = self.fetcher();
        let staging = self.staging.clone();
        let limits = self.limits();
        let id = report_id.to_string();
        tokio::task::spawn_blocking(move || render_record(&record, &fetcher, &staging, &limits))
            .await
            .unwrap_or_else(|e| {
                error!(report_id = %id, error = %e, "render worker failed");
                RenderedReport::failed(&id, worker_failure())
            })
    }

    /// Execute ad-hoc script text against a stand-in record.
    pub async fn run_sandbox(&self, code: String) -> RenderedReport {
        let fetcher = self.fetcher();
        let staging = self.staging.clone();
        let limits = self.limits();
        tokio::task::spawn_blocking(move || {
            let record = ReportRecord::local(SANDBOX_REPORT_ID, "Developer sandbox");
            render_source(&record, &code, &fetcher, &staging, &limits)
        })
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "sandbox worker failed");
            RenderedReport::failed(SANDBOX_REPORT_ID, worker_failure())
        })
    }

    /// Template input for a rendered report
    pub fn report_view(&self, rendered: &RenderedReport) -> ReportView {
        ReportView {
            record: rendered.record.clone(),
            report_id: rendered.report_id.clone(),
            content: blocks_to_html(&rendered.output.blocks),
            error: rendered
                .error
                .as_ref()
                .map(|e| ErrorPanel::from_error(e, self.debug_traces())),
            warnings: rendered.warnings.clone(),
            presentation: rendered.presentation.clone(),
            layout: rendered.output.config.layout,
        }
    }

    /// Banners for conditions affecting the whole page
    pub fn catalog_banners(catalog: &ReportCatalog) -> Vec<Banner> {
        let mut banners = Vec::new();
        if let Some(err) = &catalog.unavailable {
            banners.push(Banner::error(format!(
                "{}. Please try again later.",
                err.headline()
            )));
        }
        banners
    }
}

pub async fn metadata_from_config(config: &Config) -> Result<Arc<dyn MetadataStore>> {
    Ok(match config.metadata.backend {
        MetadataBackend::Json => Arc::new(JsonMetadataStore::new(&config.metadata.path)),
        MetadataBackend::Postgres => Arc::new(
            PgMetadataStore::connect(&config.metadata)
                .await
                .context("Failed to set up the metadata database")?,
        ),
        MetadataBackend::Memory => Arc::new(MemoryMetadataStore::new()),
    })
}

pub fn objects_from_config(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let storage = &config.storage;
    Ok(match storage.backend {
        StorageBackend::Fs => Arc::new(FsObjectStore::new(&storage.root, &storage.bucket)),
        StorageBackend::S3 => {
            let endpoint = storage
                .endpoint
                .as_deref()
                .context("storage.endpoint is required for the s3 backend")?;
            Arc::new(
                S3LikeObjectStore::new(endpoint, &storage.bucket)?
                    .with_bearer_token(storage.bearer_token.clone())
                    .with_max_bytes(storage.max_object_bytes as u64),
            )
        }
    })
}

fn worker_failure() -> PortalError {
    PortalError::Execution(ExecutionError::engine("the render worker stopped unexpectedly"))
}

/// What one render cycle produced
#[derive(Debug)]
pub struct RenderedReport {
    pub report_id: String,
    /// Record as displayed, `None` when the report could not be resolved
    pub record: Option<ReportRecord>,
    /// Blocks produced before completion or failure
    pub output: PageOutput,
    pub presentation: ReportConfig,
    pub warnings: Vec<String>,
    pub error: Option<PortalError>,
    pub elapsed: Duration,
}

impl RenderedReport {
    pub fn failed(report_id: &str, error: PortalError) -> Self {
        Self {
            report_id: report_id.to_string(),
            record: None,
            output: HostPage::new().finish(),
            presentation: ReportConfig::default(),
            warnings: Vec::new(),
            error: Some(error),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Blocking render of a resolved record: presentation, fetch, execute, cleanup.
pub fn render_record(
    record: &ReportRecord,
    fetcher: &ScriptFetcher,
    staging: &StagingArea,
    limits: &ExecutionLimits,
) -> RenderedReport {
    let started = Instant::now();
    let Presentation { config, warning } = fetcher.fetch_presentation(record);
    let display = config.overlay(record);
    let session = Arc::new(staging.session(&record.report_id));
    let host = host_page(&display);

    let result = fetcher
        .fetch_record_script(record, &session)
        .and_then(|script| run_script(&script.text, &display, fetcher, &session, &host, limits));

    finish(
        display,
        config,
        warning.into_iter().collect(),
        host,
        &session,
        result,
        started,
    )
}

/// Blocking render of script text that did not come from storage.
///
/// The text is still staged so the cycle matches a regular render.
pub fn render_source(
    record: &ReportRecord,
    source: &str,
    fetcher: &ScriptFetcher,
    staging: &StagingArea,
    limits: &ExecutionLimits,
) -> RenderedReport {
    let started = Instant::now();
    let session = Arc::new(staging.session(&record.report_id));
    let host = host_page(record);

    let result = session
        .stage(fetcher.entry_file(), source.as_bytes())
        .and_then(|_| run_script(source, record, fetcher, &session, &host, limits));

    finish(
        record.clone(),
        ReportConfig::default(),
        Vec::new(),
        host,
        &session,
        result,
        started,
    )
}

fn host_page(record: &ReportRecord) -> HostPage {
    let host = HostPage::new();
    host.configure(PageConfig {
        title: record.title.clone(),
        ..PageConfig::default()
    });
    host
}

fn run_script(
    script: &str,
    record: &ReportRecord,
    fetcher: &ScriptFetcher,
    session: &Arc<StagingSession>,
    host: &HostPage,
    limits: &ExecutionLimits,
) -> Result<(), PortalError> {
    let namespace = build_context(HostCapabilities {
        record: record.clone(),
        fetcher: fetcher.clone(),
        session: Arc::clone(session),
        page: host.surface(),
    });
    js_engine::execute(script, &namespace, limits)?;
    Ok(())
}

fn finish(
    record: ReportRecord,
    presentation: ReportConfig,
    warnings: Vec<String>,
    host: HostPage,
    session: &StagingSession,
    result: Result<(), PortalError>,
    started: Instant,
) -> RenderedReport {
    let removed = session.finish();
    let elapsed = started.elapsed();
    match &result {
        Ok(()) => info!(
            report_id = %record.report_id,
            elapsed_ms = elapsed.as_millis() as u64,
            staged_removed = removed,
            "report rendered"
        ),
        Err(e) => warn!(
            report_id = %record.report_id,
            code = ?e.code(),
            error = %e,
            staged_removed = removed,
            "report render failed"
        ),
    }
    debug!(report_id = %record.report_id, "render cycle finished");

    RenderedReport {
        report_id: record.report_id.clone(),
        record: Some(record),
        output: host.finish(),
        presentation,
        warnings,
        error: result.err(),
        elapsed,
    }
}

/// Outcome of probing one report's entry script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckLine {
    pub report_id: String,
    pub key: String,
    pub status: Result<(), String>,
}

/// Probe the entry script of every active report without executing anything.
pub async fn check_reports(state: &AppState) -> Result<Vec<CheckLine>> {
    let catalog = state.catalog().await;
    if let Some(err) = catalog.unavailable {
        anyhow::bail!("{}", err);
    }
    let fetcher = state.fetcher();
    let records: Vec<ReportRecord> = catalog.active().into_iter().cloned().collect();
    let lines = tokio::task::spawn_blocking(move || {
        records
            .iter()
            .map(|record| {
                let key = record.object_key(fetcher.entry_file());
                let status = match fetcher.exists(&key) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err("entry script missing".to_string()),
                    Err(e) => Err(e.to_string()),
                };
                CheckLine {
                    report_id: record.report_id.clone(),
                    key,
                    status,
                }
            })
            .collect::<Vec<_>>()
    })
    .await
    .context("check worker failed")?;
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Block;
    use crate::storage::MemoryObjectStore;
    use serde_json::json;
    use std::fs;

    fn state(objects: MemoryObjectStore, metadata: MemoryMetadataStore) -> AppState {
        let mut config = Config::test_config_with_port(0);
        config.staging.dir =
            std::env::temp_dir().join(format!("reportportal-portal-{}", uuid::Uuid::new_v4()));
        config.storage.base_backoff_ms = 0;
        config.execution.timeout_ms = 300;
        AppState::with_stores(config, Arc::new(metadata), Arc::new(objects)).unwrap()
    }

    fn staged_files(state: &AppState) -> usize {
        fs::read_dir(state.staging.dir()).map(|d| d.count()).unwrap_or(0)
    }

    fn metadata() -> MemoryMetadataStore {
        MemoryMetadataStore::with_items(vec![
            json!({ "report_id": "r1", "titulo": "A", "deletado": false }),
            json!({ "report_id": "r2", "titulo": "B", "deletado": true }),
            json!({ "report_id": "r3", "titulo": "C" }),
        ])
    }

    #[tokio::test]
    async fn test_render_success_cleans_staging() {
        let objects = MemoryObjectStore::new("reports");
        objects.put("r1/main.js", "page.title(REPORT.title); paths.writeTemp('x.txt', 'tmp');");
        let state = state(objects, metadata());

        let catalog = state.catalog().await;
        let rendered = state.render_report("r1", &catalog).await;

        assert!(rendered.is_ok(), "{:?}", rendered.error);
        assert_eq!(rendered.output.blocks, vec![Block::Title { text: "A".to_string() }]);
        assert_eq!(rendered.output.config.title, "A");
        assert_eq!(staged_files(&state), 0);
    }

    #[tokio::test]
    async fn test_fault_is_scoped_and_next_render_succeeds() {
        let objects = MemoryObjectStore::new("reports");
        objects.put("r1/main.js", "page.text('partial'); undefinedFunction();");
        objects.put("r3/main.js", "page.text('fine');");
        let state = state(objects, metadata());
        let catalog = state.catalog().await;

        let failed = state.render_report("r1", &catalog).await;
        match &failed.error {
            Some(PortalError::Execution(e)) => assert_eq!(e.name, "ReferenceError"),
            other => panic!("expected an execution error, got {:?}", other),
        }
        assert_eq!(failed.output.blocks.len(), 1);
        assert_eq!(staged_files(&state), 0);

        let ok = state.render_report("r3", &catalog).await;
        assert!(ok.is_ok());
        assert_eq!(ok.output.blocks, vec![Block::Text { text: "fine".to_string() }]);
    }

    #[tokio::test]
    async fn test_missing_script_and_unknown_ids() {
        let state = state(MemoryObjectStore::new("reports"), metadata());
        let catalog = state.catalog().await;

        let missing = state.render_report("r1", &catalog).await;
        assert!(matches!(missing.error, Some(PortalError::NotFound { .. })));
        assert!(missing.record.is_some());
        assert_eq!(staged_files(&state), 0);

        for id in ["r2", "nope"] {
            let rendered = state.render_report(id, &catalog).await;
            assert!(matches!(rendered.error, Some(PortalError::RecordNotFound { .. })));
            assert!(rendered.record.is_none());
        }
    }

    #[tokio::test]
    async fn test_store_outage_is_reported_as_unavailable() {
        let metadata = metadata();
        metadata.set_offline(true);
        let state = state(MemoryObjectStore::new("reports"), metadata);
        let catalog = state.catalog().await;

        assert!(catalog.is_empty());
        assert_eq!(AppState::catalog_banners(&catalog).len(), 1);
        let rendered = state.render_report("r1", &catalog).await;
        assert!(matches!(rendered.error, Some(PortalError::StoreUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_presentation_overrides_display() {
        let objects = MemoryObjectStore::new("reports");
        objects.put("r1/main.js", "page.text(REPORT.title);");
        objects.put("r1/config.toml", "[report]\ntitle = \"Painel\"\n");
        let state = state(objects, metadata());
        let catalog = state.catalog().await;

        let rendered = state.render_report("r1", &catalog).await;
        assert_eq!(rendered.record.as_ref().unwrap().title, "Painel");
        assert_eq!(rendered.output.blocks, vec![Block::Text { text: "Painel".to_string() }]);
        let html = state
            .renderer
            .report(&catalog, &state.report_view(&rendered), &[])
            .unwrap();
        assert!(html.contains("Painel"));
    }

    #[tokio::test]
    async fn test_sandbox_runs_and_cleans_up() {
        let state = state(MemoryObjectStore::new("reports"), metadata());
        let rendered = state.run_sandbox("page.header('hi');".to_string()).await;
        assert!(rendered.is_ok());
        assert_eq!(rendered.report_id, SANDBOX_REPORT_ID);
        assert_eq!(staged_files(&state), 0);

        let failed = state.run_sandbox("while (true) {}".to_string()).await;
        assert!(matches!(
            failed.error,
            Some(PortalError::Execution(ref e)) if e.kind == crate::error::ExecutionErrorKind::Timeout
        ));
    }

    #[tokio::test]
    async fn test_check_reports_probes_active_entries() {
        let objects = MemoryObjectStore::new("reports");
        objects.put("r1/main.js", "1;");
        let state = state(objects, metadata());

        let mut lines = check_reports(&state).await.unwrap();
        lines.sort_by(|a, b| a.report_id.cmp(&b.report_id));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].status, Ok(()));
        assert_eq!(lines[1].report_id, "r3");
        assert!(lines[1].status.is_err());
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid_configuration() {
        let config = Config::test_config_with_port(0);
        let err = match AppState::from_config(config).await {
            Ok(_) => panic!("port 0 should be rejected"),
            Err(e) => e,
        };
        let portal = err.downcast_ref::<PortalError>().expect("portal error");
        assert!(matches!(portal, PortalError::Config(_)));
        assert!(portal.to_string().contains("server.port"));
    }
}
