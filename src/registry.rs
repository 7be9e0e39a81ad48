//! Registry of rendered demos: one row per canonical demo filename, written
//! only once a final, publicly observable video URL exists.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{
    Context,
    Result,
    bail,
};
use rusqlite::{
    Connection,
    params,
};

use crate::sync_ext::MutexExt;

#[derive(Debug)]
pub struct RenderedDemoRegistry {
    connection: Mutex<Connection>,
}

impl RenderedDemoRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open registry database {}", path.display()))?;
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS rendered_demos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    filename VARCHAR(255) UNIQUE,
                    url VARCHAR(255)
                );",
            )
            .context("failed to initialize registry schema")?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Records the final video URL for a demo. Duplicate deliveries of the
    /// same terminal callback are expected after crash-retry; the unique
    /// filename constraint turns them into no-ops.
    pub fn record(&self, filename: &str, url: &str) -> Result<()> {
        let connection = self.connection.lock_unpoisoned();
        connection
            .execute(
                "INSERT OR IGNORE INTO rendered_demos (filename, url) VALUES (?1, ?2)",
                params![filename, url],
            )
            .with_context(|| format!("failed to record rendered demo {filename}"))?;
        Ok(())
    }

    /// Returns the recorded URL for a filename. More than one row would mean
    /// the unique constraint was violated out-of-band; that is corruption and
    /// fails loudly rather than picking a row.
    pub fn lookup(&self, filename: &str) -> Result<Option<String>> {
        let connection = self.connection.lock_unpoisoned();
        let mut statement = connection
            .prepare("SELECT url FROM rendered_demos WHERE filename = ?1")
            .context("failed to prepare registry lookup")?;
        let urls: Vec<String> = statement
            .query_map(params![filename], |row| row.get(0))
            .with_context(|| format!("failed to look up rendered demo {filename}"))?
            .collect::<Result<_, _>>()
            .with_context(|| format!("failed to read registry rows for {filename}"))?;
        match urls.len() {
            0 => Ok(None),
            1 => Ok(urls.into_iter().next()),
            n => bail!("registry corrupted: {n} rows for filename {filename}"),
        }
    }
}
