//! libSQL storage layer (local mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the `events` and
//! `groups` document collections, the geocode cache, and the ingest-run log.
//! Document access goes through the [`DocumentStore`] trait so the upsert
//! engine can run against any store with the same single-document contract.

mod documents;
mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use uuid::Uuid;

use recapsync_shared::{RecapSyncError, Result};

pub use documents::{Collection, Document, DocumentStore, Filter};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

/// A cached geocoding outcome. `result_json` is `None` for a cached miss.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeCacheEntry {
    pub result_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One recorded batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRun {
    pub id: String,
    pub source: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub stats_json: Option<String>,
}

impl Storage {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RecapSyncError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| RecapSyncError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| RecapSyncError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        RecapSyncError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Geocode cache
    // -----------------------------------------------------------------------

    /// Look up a cached geocode by key.
    pub async fn get_geocode_cache(&self, key: &str) -> Result<Option<GeocodeCacheEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT result_json, created_at FROM geocode_cache WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| RecapSyncError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let result_json = row.get::<String>(0).ok();
                let created_at: String = row
                    .get(1)
                    .map_err(|e| RecapSyncError::Storage(e.to_string()))?;
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| RecapSyncError::Storage(format!("bad cache timestamp: {e}")))?
                    .with_timezone(&Utc);
                Ok(Some(GeocodeCacheEntry {
                    result_json,
                    created_at,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(RecapSyncError::Storage(e.to_string())),
        }
    }

    /// Store a geocode result (or a miss) in the cache (upserts).
    pub async fn set_geocode_cache(
        &self,
        key: &str,
        address: &str,
        result_json: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO geocode_cache (key, address, result_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                   result_json = excluded.result_json,
                   created_at = excluded.created_at",
                params![key, address, result_json, now.as_str()],
            )
            .await
            .map_err(|e| RecapSyncError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ingest runs
    // -----------------------------------------------------------------------

    /// Record the start of a batch run. Returns the run ID.
    pub async fn insert_ingest_run(&self, source: &str) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO ingest_runs (id, source, started_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), source, now.as_str()],
            )
            .await
            .map_err(|e| RecapSyncError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// Mark a batch run finished with its stats.
    pub async fn finish_ingest_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE ingest_runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now.as_str(), stats_json, run_id],
            )
            .await
            .map_err(|e| RecapSyncError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_ingest_runs(&self, limit: u32) -> Result<Vec<IngestRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, source, started_at, finished_at, stats_json
                 FROM ingest_runs ORDER BY started_at DESC, id DESC LIMIT ?1",
                params![i64::from(limit)],
            )
            .await
            .map_err(|e| RecapSyncError::Storage(e.to_string()))?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            runs.push(IngestRun {
                id: row
                    .get::<String>(0)
                    .map_err(|e| RecapSyncError::Storage(e.to_string()))?,
                source: row
                    .get::<String>(1)
                    .map_err(|e| RecapSyncError::Storage(e.to_string()))?,
                started_at: row
                    .get::<String>(2)
                    .map_err(|e| RecapSyncError::Storage(e.to_string()))?,
                finished_at: row.get::<String>(3).ok(),
                stats_json: row.get::<String>(4).ok(),
            });
        }
        Ok(runs)
    }
}
