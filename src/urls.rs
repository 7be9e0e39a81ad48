//! URL extraction from message bodies and the append-only URLs journal.

use std::fs::{
    File,
    OpenOptions,
};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{
    Context,
    Result,
};
use once_cell::sync::Lazy;
use regex::Regex;

static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").expect("url regex"));

/// Returns every `http(s)://…` substring of `text`, in order, each ending at
/// the next whitespace. Trailing punctuation is intentionally kept: the
/// journal records what was written, not a cleaned-up interpretation.
pub fn extract_urls(text: &str) -> Vec<String> {
    URL.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// Append-only journal of archived URLs. One line per URL, tab-separated
/// from a back-link to the message it came from. `sync()` is invoked through
/// the savepoint's before-flush hook so the journal never lags behind the
/// savepoint on disk.
#[derive(Debug)]
pub struct UrlJournal {
    path: PathBuf,
    file: File,
}

impl UrlJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open URLs journal {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn append(&mut self, url: &str, message_link: &str) -> Result<()> {
        writeln!(self.file, "{url}\t{message_link}")
            .with_context(|| format!("failed to append to {}", self.path.display()))
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .with_context(|| format!("failed to fsync {}", self.path.display()))
    }
}
