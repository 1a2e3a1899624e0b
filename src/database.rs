use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::MetadataConfig;
use crate::metadata::{MetadataError, MetadataStore};

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .expect("identifier pattern is valid")
    })
}

/// Report metadata kept in a PostgreSQL table, one row per report.
///
/// Columns are free-form: each row is read back as a JSON object, so missing
/// or extra columns go through the same normalization as document items.
pub struct PgMetadataStore {
    pool: PgPool,
    table: String,
}

impl PgMetadataStore {
    /// Create a new connection pool for the metadata table
    pub async fn connect(config: &MetadataConfig) -> Result<Self> {
        let connection_string = config
            .connection_string
            .as_ref()
            .context("Database connection string is required")?;

        if !identifier_pattern().is_match(&config.table) {
            anyhow::bail!("Invalid metadata table name: {}", config.table);
        }

        info!("Connecting to metadata database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(2000))
            .connect_lazy(connection_string)
            .context("Failed to configure database pool")?;

        let store = Self {
            pool,
            table: config.table.clone(),
        };

        if config.auto_migrate {
            store.migrate().await?;
        }

        // A failing check is not fatal: the portal serves an empty listing
        // with a banner until the database comes back.
        if let Err(e) = store.health_check().await {
            warn!("Metadata database not reachable at startup: {:#}", e);
        } else {
            info!("Metadata database connection established");
        }

        Ok(store)
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    fn scan_sql(&self) -> String {
        format!("SELECT row_to_json(t)::text FROM {} t", self.table)
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn scan(&self) -> Result<Vec<Value>, MetadataError> {
        let rows: Vec<String> = sqlx::query_scalar(&self.scan_sql())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MetadataError::Unavailable(e.to_string()))?;

        rows.iter()
            .map(|row| {
                serde_json::from_str(row).map_err(|e| MetadataError::Malformed(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_identifier_validation() {
        assert!(identifier_pattern().is_match("reports"));
        assert!(identifier_pattern().is_match("portal.reports_v2"));
        assert!(!identifier_pattern().is_match("reports; DROP TABLE x"));
        assert!(!identifier_pattern().is_match("1reports"));
        assert!(!identifier_pattern().is_match(""));
    }

    #[tokio::test]
    async fn test_database_scan() {
        // This test requires a running PostgreSQL instance
        // Skip if DATABASE_URL is not set
        if std::env::var("DATABASE_URL").is_err() {
            eprintln!("Skipping database test - DATABASE_URL not set");
            return;
        }

        let config = MetadataConfig {
            backend: crate::config::MetadataBackend::Postgres,
            connection_string: std::env::var("DATABASE_URL").ok(),
            auto_migrate: true,
            ..MetadataConfig::default()
        };

        let store = PgMetadataStore::connect(&config)
            .await
            .expect("Failed to connect");
        store.health_check().await.expect("Health check failed");
        assert!(store.scan().await.is_ok());
    }
}
