//! Durable state primitives: an atomic-rename JSON value store and the
//! per-channel message savepoint. Everything the pipeline persists goes
//! through one of these two writers.

use std::fs;
use std::io::{
    BufReader,
    Write,
};
use std::path::{
    Path,
    PathBuf,
};
use std::time::Instant;

use anyhow::{
    Context,
    Result,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A single JSON value persisted to one file. `flush()` writes `{path}.tmp`,
/// fsyncs it and atomically renames it over `path`; a crash can lose at most
/// the mutations since the last flush, never corrupt the file.
#[derive(Debug)]
pub struct StoredState<T> {
    path: PathBuf,
    value: T,
}

impl<T: Serialize + DeserializeOwned> StoredState<T> {
    /// Loads the value from `path`, installing `default` when the file does
    /// not exist yet. A present-but-unreadable file is an error, not a reset.
    pub fn open(path: impl Into<PathBuf>, default: T) -> Result<Self> {
        let path = path.into();
        let value = match fs::File::open(&path) {
            Ok(file) => serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("failed to parse state file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => default,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open state file {}", path.display()));
            }
        };
        Ok(Self { path, value })
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn flush(&self) -> Result<()> {
        let tmp_path = tmp_sibling(&self.path);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp state file {}", tmp_path.display()))?;
        serde_json::to_writer(&file, &self.value)
            .with_context(|| format!("failed to write state to {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to atomically rename {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

/// Largest fully processed message id of one channel, kept as a small text
/// file (`None` when unset, matching the historical on-disk format).
///
/// `set` updates the in-memory value on every call but flushes at most once
/// per second. The two hooks run immediately before and after a real flush so
/// the caller can bring an unrelated append-only journal to the same
/// durability point.
#[derive(Debug)]
pub struct Savepoint {
    path: PathBuf,
    value: Option<u64>,
    last_synced: Instant,
}

const SAVEPOINT_NONE: &str = "None";

impl Savepoint {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let value = match fs::read_to_string(&path) {
            Ok(text) => {
                let text = text.trim();
                if text == SAVEPOINT_NONE {
                    None
                } else {
                    Some(text.parse().with_context(|| {
                        format!("invalid savepoint value in {}", path.display())
                    })?)
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read savepoint {}", path.display()));
            }
        };
        Ok(Self {
            path,
            value,
            last_synced: Instant::now(),
        })
    }

    pub fn get(&self) -> Option<u64> {
        self.value
    }

    pub fn set<B, A>(&mut self, new_value: u64, before_sync: B, after_sync: A) -> Result<()>
    where
        B: FnOnce() -> Result<()>,
        A: FnOnce() -> Result<()>,
    {
        self.value = Some(new_value);
        if self.last_synced.elapsed().as_secs_f64() > 1.0 {
            before_sync()?;
            self.flush()?;
            self.last_synced = Instant::now();
            after_sync()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let tmp_path = tmp_sibling(&self.path);
        let mut file = fs::File::create(&tmp_path).with_context(|| {
            format!("failed to create temp savepoint {}", tmp_path.display())
        })?;
        let text = match self.value {
            Some(v) => v.to_string(),
            None => SAVEPOINT_NONE.to_string(),
        };
        file.write_all(text.as_bytes())
            .with_context(|| format!("failed to write savepoint {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to atomically rename {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
