#![allow(dead_code)]

use reportportal::config::Config;
use reportportal::metadata::MemoryMetadataStore;
use reportportal::portal::AppState;
use reportportal::start_server_with_state;
use reportportal::storage::MemoryObjectStore;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Portal running on an ephemeral port over in-memory stores
pub struct TestServer {
    port: u16,
    pub metadata: MemoryMetadataStore,
    pub objects: MemoryObjectStore,
    staging_dir: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Start with the two-report fixture: `r1` active, `r2` soft-deleted.
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(fixture_items(), |_| {}).await
    }

    pub async fn start_with(
        items: Vec<Value>,
        tweak: impl FnOnce(&mut Config),
    ) -> anyhow::Result<Self> {
        let mut config = Config::test_config_with_port(0);
        config.staging.dir =
            std::env::temp_dir().join(format!("reportportal-it-{}", uuid::Uuid::new_v4()));
        config.storage.base_backoff_ms = 0;
        tweak(&mut config);

        let staging_dir = config.staging.dir.clone();
        let metadata = MemoryMetadataStore::with_items(items);
        let objects = MemoryObjectStore::new(config.storage.bucket.clone());
        let state = AppState::with_stores(
            config,
            Arc::new(metadata.clone()),
            Arc::new(objects.clone()),
        )?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let port = start_server_with_state(state, shutdown_rx).await?;

        Ok(Self {
            port,
            metadata,
            objects,
            staging_dir,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Files currently left in the staging directory
    pub fn staged_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.staging_dir)
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        client()
            .get(self.url(path))
            .send()
            .await
            .expect("request failed")
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = std::fs::remove_dir_all(&self.staging_dir);
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .expect("client")
}

pub fn fixture_items() -> Vec<Value> {
    vec![
        json!({
            "report_id": "r1",
            "titulo": "A",
            "descricao": "Monthly numbers",
            "autor": "Ana",
            "deletado": false,
            "created_at": "2025-01-10T09:00:00Z",
            "updated_at": "2025-02-01T12:30:00Z"
        }),
        json!({ "report_id": "r2", "titulo": "B", "deletado": true }),
    ]
}

/// Wait until `/health` answers.
pub async fn wait_for_server(port: u16, max_attempts: u32) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()?;

    for attempt in 1..=max_attempts {
        if let Ok(response) = client
            .get(format!("http://127.0.0.1:{}/health", port))
            .send()
            .await
            && (response.status().is_success() || response.status().is_server_error())
        {
            return Ok(());
        }
        if attempt < max_attempts {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    Err(anyhow::anyhow!(
        "Server not ready after {} attempts",
        max_attempts
    ))
}
