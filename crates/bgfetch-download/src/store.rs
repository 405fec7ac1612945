//! Persistence of in-flight request metadata

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;

use bgfetch_storage::Database;

use crate::download::DownloadConfig;
use crate::engine::Downloader;
use crate::error::DownloadError;
use crate::handle::DownloadHandle;
use crate::Result;

/// Load and save the set of requests a host is tracking.
pub trait DownloadStore: Send + Sync {
    fn load_all(&self, downloader: &Downloader) -> Result<HashMap<String, DownloadHandle>>;

    fn save_all(&self, downloads: &HashMap<String, DownloadHandle>) -> Result<()>;
}

/// Store that remembers nothing: loads empty and drops every save.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl DownloadStore for NoopStore {
    fn load_all(&self, _downloader: &Downloader) -> Result<HashMap<String, DownloadHandle>> {
        Ok(HashMap::new())
    }

    fn save_all(&self, _downloads: &HashMap<String, DownloadHandle>) -> Result<()> {
        Ok(())
    }
}

/// SQLite-backed store.
///
/// Only requests still waiting at save time are kept. Loading starts each of
/// them again from byte zero under its saved identifier.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

#[derive(Debug, Clone)]
struct PendingRecord {
    id: String,
    config: DownloadConfig,
    created_at: DateTime<Utc>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn read_records(&self) -> Result<Vec<PendingRecord>> {
        let rows = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source, destination, created_at
                 FROM pending_downloads
                 ORDER BY created_at",
            )?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(id, source, destination, created_at)| {
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        DownloadError::InvalidRecord(format!("{}: bad created_at: {}", id, e))
                    })?;

                Ok(PendingRecord {
                    id,
                    config: DownloadConfig::new(source, PathBuf::from(destination)),
                    created_at,
                })
            })
            .collect()
    }
}

impl DownloadStore for SqliteStore {
    fn load_all(&self, downloader: &Downloader) -> Result<HashMap<String, DownloadHandle>> {
        let records = self.read_records()?;
        let mut downloads = HashMap::with_capacity(records.len());

        for record in records {
            tracing::info!(
                download_id = %record.id,
                source = %record.config.source,
                saved_at = %record.created_at.to_rfc3339(),
                "Restarting saved download"
            );

            let (handle, _task) = downloader.start_with_id(record.id.clone(), record.config);
            downloads.insert(record.id, handle);
        }

        Ok(downloads)
    }

    fn save_all(&self, downloads: &HashMap<String, DownloadHandle>) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        // Non-UTF-8 destinations cannot be stored without rewriting them
        let pending = downloads
            .iter()
            .filter(|(_, handle)| handle.keep_waiting())
            .map(|(id, handle)| {
                let destination = handle.config().destination.to_str().ok_or_else(|| {
                    DownloadError::InvalidRecord(format!(
                        "{}: destination {} is not valid UTF-8",
                        id,
                        handle.config().destination.display()
                    ))
                })?;
                Ok::<_, DownloadError>((id, handle.config().source.as_str(), destination))
            })
            .collect::<Result<Vec<_>>>()?;

        let saved = self.db.transaction(|conn| {
            conn.execute("DELETE FROM pending_downloads", [])?;

            let mut stmt = conn.prepare(
                "INSERT INTO pending_downloads (id, source, destination, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;

            for (id, source, destination) in &pending {
                stmt.execute(rusqlite::params![id, source, destination, now])?;
            }

            Ok(pending.len())
        })?;

        tracing::debug!(saved, total = downloads.len(), "Saved pending downloads");

        Ok(())
    }
}
