use axum::{
    Extension, Form, Json, Router,
    extract::{OriginalUri, Path, Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

pub mod capabilities;
pub mod config;
pub mod conversion;
pub mod database;
pub mod error;
pub mod fetcher;
pub mod js_engine;
pub mod metadata;
pub mod middleware;
pub mod model;
pub mod page;
pub mod portal;
pub mod render;
pub mod report_config;
pub mod staging;
pub mod storage;
pub mod table;

use crate::error::{ErrorCode, ErrorResponse, ErrorResponseBuilder};
use crate::middleware::RequestId;
use crate::page::{Block, PageConfig};
use crate::portal::{AppState, RenderedReport};
use crate::render::{PORTAL_CSS, RenderError};

/// Query parameters of the portal page
#[derive(Debug, Default, Deserialize)]
pub struct PortalQuery {
    pub id: Option<String>,
    /// Older links select the report through `rel`
    pub rel: Option<String>,
    pub path: Option<String>,
}

impl PortalQuery {
    pub fn report_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.rel.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn wants_sandbox(&self) -> bool {
        self.path.as_deref() == Some("dev")
    }
}

#[derive(Debug, Deserialize)]
pub struct SandboxForm {
    #[serde(default)]
    pub code: String,
}

/// Listing entry of the JSON API
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportSummary {
    pub report_id: String,
    pub title: String,
    pub description: String,
    pub author: String,
    pub updated_at: String,
    pub href: String,
}

/// Successful render of the JSON API
#[derive(Debug, Serialize, Deserialize)]
pub struct RenderResponse {
    pub report_id: String,
    pub page: PageConfig,
    pub blocks: Vec<Block>,
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
}

fn html_page(result: Result<String, RenderError>) -> Response {
    match result {
        Ok(body) => Html(body).into_response(),
        Err(e) => {
            error!(error = %e, "template rendering failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "page rendering failed").into_response()
        }
    }
}

async fn portal_page(State(state): State<AppState>, Query(query): Query<PortalQuery>) -> Response {
    let catalog = state.catalog().await;
    let banners = AppState::catalog_banners(&catalog);

    if query.wants_sandbox() && state.config.portal.dev_sandbox {
        return html_page(state.renderer.sandbox(&catalog, "", None));
    }

    match query.report_id() {
        None => {
            debug!(reports = catalog.len(), "listing page");
            html_page(state.renderer.listing(&catalog, &banners))
        }
        Some(report_id) => {
            let rendered = state.render_report(report_id, &catalog).await;
            let view = state.report_view(&rendered);
            let status = match &rendered.error {
                Some(e) if rendered.record.is_none() => {
                    StatusCode::from_u16(e.code().status()).unwrap_or(StatusCode::NOT_FOUND)
                }
                _ => StatusCode::OK,
            };
            let mut response = html_page(state.renderer.report(&catalog, &view, &banners));
            if response.status().is_success() {
                *response.status_mut() = status;
            }
            response
        }
    }
}

async fn sandbox_run(State(state): State<AppState>, Form(form): Form<SandboxForm>) -> Response {
    if !state.config.portal.dev_sandbox {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    let catalog = state.catalog().await;
    let rendered = state.run_sandbox(form.code.clone()).await;
    let view = state.report_view(&rendered);
    html_page(
        state
            .renderer
            .sandbox(&catalog, &form.code, Some((&view.content, view.error.as_ref()))),
    )
}

async fn api_reports(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    let catalog = state.catalog().await;
    if let Some(err) = &catalog.unavailable {
        return ErrorResponseBuilder::from_portal_error(err, false)
            .request_id(request_id.as_str())
            .path(uri.path())
            .build()
            .into_response();
    }
    let reports: Vec<ReportSummary> = catalog
        .active()
        .into_iter()
        .map(|r| ReportSummary {
            report_id: r.report_id.clone(),
            title: r.title.clone(),
            description: r.description.clone(),
            author: r.author.clone(),
            updated_at: r.updated_at.clone(),
            href: render::Renderer::report_href(&r.report_id),
        })
        .collect();
    Json(reports).into_response()
}

async fn api_render(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
    Extension(request_id): Extension<RequestId>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    let catalog = state.catalog().await;
    let rendered: RenderedReport = state.render_report(&report_id, &catalog).await;
    match rendered.error {
        Some(err) => ErrorResponseBuilder::from_portal_error(&err, state.debug_traces())
            .request_id(request_id.as_str())
            .path(uri.path())
            .context("blocks", rendered.output.blocks.len())
            .build()
            .into_response(),
        None => Json(RenderResponse {
            report_id: rendered.report_id,
            page: rendered.output.config,
            blocks: rendered.output.blocks,
            warnings: rendered.warnings,
            elapsed_ms: rendered.elapsed.as_millis() as u64,
        })
        .into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let catalog = state.catalog().await;
    let (status, label) = match &catalog.unavailable {
        None => (StatusCode::OK, "healthy"),
        Some(_) => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };
    let body = serde_json::json!({
        "status": label,
        "version": env!("CARGO_PKG_VERSION"),
        "git_sha": option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
        "build_timestamp": option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "metadata": {
            "backend": state.metadata.backend_name(),
            "reports": catalog.active().len(),
            "skipped": catalog.skipped,
        },
        "storage": {
            "backend": state.objects.backend_name(),
            "bucket": state.objects.bucket(),
        },
    });
    (status, Json(body)).into_response()
}

async fn portal_css() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], PORTAL_CSS).into_response()
}

async fn fallback(
    Extension(request_id): Extension<RequestId>,
    OriginalUri(uri): OriginalUri,
) -> ErrorResponse {
    ErrorResponseBuilder::new(ErrorCode::NotFound, "No route for this path")
        .request_id(request_id.as_str())
        .path(uri.path())
        .build()
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(portal_page))
        .route("/dev/run", post(sandbox_run))
        .route("/api/reports", get(api_reports))
        .route("/api/reports/{id}/render", get(api_render))
        .route("/health", get(health))
        .route("/static/portal.css", get(portal_css))
        .fallback(fallback)
        .layer(axum::middleware::from_fn(
            middleware::request_id_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the portal with the default configuration sources.
pub async fn start_server(shutdown_rx: tokio::sync::oneshot::Receiver<()>) -> anyhow::Result<u16> {
    start_server_with_config(config::Config::load(None)?, shutdown_rx).await
}

/// Build state from `config` and start serving; returns the bound port.
pub async fn start_server_with_config(
    config: config::Config,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<u16> {
    let state = AppState::from_config(config).await?;
    start_server_with_state(state, shutdown_rx).await
}

/// Serve an already built state. The server runs on a background task until
/// `shutdown_rx` fires.
pub async fn start_server_with_state(
    state: AppState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<u16> {
    if let Err(e) = state.staging.ensure() {
        warn!(dir = %state.staging.dir().display(), error = %e, "could not create staging directory");
    }
    state.purge_stale();

    let addr: SocketAddr = state
        .config
        .server_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;

    let app = build_router(state);
    let handle = axum_server::Handle::new();
    let server_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = axum_server::bind(addr)
            .handle(server_handle)
            .serve(app.into_make_service())
            .await
        {
            error!(error = %e, "server stopped with an error");
        }
    });

    let bound = handle
        .listening()
        .await
        .ok_or_else(|| anyhow::anyhow!("server failed to bind {}", addr))?;
    info!("listening on {}", bound);

    tokio::spawn(async move {
        let _ = shutdown_rx.await;
        info!("shutdown requested, draining connections");
        handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    Ok(bound.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portal_query_parsing() {
        let query: PortalQuery = serde_urlencoded::from_str("id=r1").unwrap();
        assert_eq!(query.report_id(), Some("r1"));

        let query: PortalQuery = serde_urlencoded::from_str("rel=sa%C3%BAde+df").unwrap();
        assert_eq!(query.report_id(), Some("saúde df"));

        let query: PortalQuery = serde_urlencoded::from_str("id=+&path=dev").unwrap();
        assert_eq!(query.report_id(), None);
        assert!(query.wants_sandbox());

        let query: PortalQuery = serde_urlencoded::from_str("").unwrap();
        assert_eq!(query.report_id(), None);
        assert!(!query.wants_sandbox());
    }
}
