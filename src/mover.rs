//! Collision-renaming file mover that collapses byte-identical duplicates.
//!
//! Every distinct byte sequence ends up under exactly one canonical name in
//! the destination directory; that canonical name doubles as the dedup key
//! for the rendered-video registry.

use std::fs;
use std::io::{
    BufReader,
    Read,
};
use std::path::{
    Path,
    PathBuf,
};

use anyhow::{
    Context,
    Result,
};
use once_cell::sync::Lazy;
use regex::Regex;

/// Splits a destination path into prefix and its last `.xxx` suffix, where
/// the suffix contains no further dots or path separators.
static SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*)(\.[^/.\\]*)$").expect("suffix split regex"));

#[derive(Debug, Default)]
pub struct RenamingMover;

impl RenamingMover {
    pub fn new() -> Self {
        Self
    }

    /// Moves `src` to `dest`, renaming on collision: candidates are `dest`,
    /// `dest.1.ext`, `dest.2.ext`, … If a candidate already holds bytes
    /// identical to `src`, the source is deleted instead and the existing
    /// path is returned with `is_new = false`.
    pub fn move_file(&self, src: &Path, dest: &Path) -> Result<(PathBuf, bool)> {
        let mut index = 0u64;
        loop {
            let candidate = if index == 0 {
                dest.to_path_buf()
            } else {
                adjust_name(dest, index)
            };

            if candidate.exists() {
                if files_equal(src, &candidate)? {
                    fs::remove_file(src).with_context(|| {
                        format!("failed to remove duplicate source {}", src.display())
                    })?;
                    return Ok((candidate, false));
                }
                index += 1;
                continue;
            }

            match fs::rename(src, &candidate) {
                Ok(()) => return Ok((candidate, true)),
                // A concurrent writer can slip in between the exists() probe
                // and the rename; loop back into the equality test on the
                // same candidate.
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!(
                            "failed to rename {} -> {}",
                            src.display(),
                            candidate.display()
                        )
                    });
                }
            }
        }
    }
}

fn adjust_name(dest: &Path, index: u64) -> PathBuf {
    let dest_str = dest.to_string_lossy();
    match SPLIT.captures(&dest_str) {
        Some(caps) => PathBuf::from(format!("{}.{index}{}", &caps[1], &caps[2])),
        None => PathBuf::from(format!("{dest_str}.{index}")),
    }
}

fn files_equal(a: &Path, b: &Path) -> Result<bool> {
    let meta_a = fs::metadata(a).with_context(|| format!("failed to stat {}", a.display()))?;
    let meta_b = fs::metadata(b).with_context(|| format!("failed to stat {}", b.display()))?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut reader_a = BufReader::new(
        fs::File::open(a).with_context(|| format!("failed to open {}", a.display()))?,
    );
    let mut reader_b = BufReader::new(
        fs::File::open(b).with_context(|| format!("failed to open {}", b.display()))?,
    );
    let mut buf_a = [0u8; 64 * 1024];
    let mut buf_b = [0u8; 64 * 1024];
    loop {
        let n = reader_a
            .read(&mut buf_a)
            .with_context(|| format!("failed to read {}", a.display()))?;
        if n == 0 {
            return Ok(true);
        }
        reader_b
            .read_exact(&mut buf_b[..n])
            .with_context(|| format!("failed to read {}", b.display()))?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).expect("write fixture");
        path
    }

    #[test]
    fn moves_to_the_plain_destination_when_free() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = write(dir.path(), "tmp", b"X");
        let dest = dir.path().join("a.txt");

        let (actual, is_new) = RenamingMover::new().move_file(&src, &dest).expect("move");
        assert_eq!(actual, dest);
        assert!(is_new);
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).expect("read"), b"X");
    }

    #[test]
    fn identical_bytes_collapse_onto_the_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "a.txt", b"X");
        let src = write(dir.path(), "tmp", b"X");
        let dest = dir.path().join("a.txt");

        let (actual, is_new) = RenamingMover::new().move_file(&src, &dest).expect("move");
        assert_eq!(actual, dest);
        assert!(!is_new);
        assert!(!src.exists());
    }

    #[test]
    fn different_bytes_get_the_first_numbered_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "a.txt", b"X");
        let src = write(dir.path(), "tmp", b"Y");
        let dest = dir.path().join("a.txt");

        let (actual, is_new) = RenamingMover::new().move_file(&src, &dest).expect("move");
        assert_eq!(actual, dir.path().join("a.1.txt"));
        assert!(is_new);
    }

    #[test]
    fn walks_past_several_occupied_slots() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "a.txt", b"one");
        write(dir.path(), "a.1.txt", b"two");
        write(dir.path(), "a.2.txt", b"three");
        let src = write(dir.path(), "tmp", b"four");
        let dest = dir.path().join("a.txt");

        let (actual, is_new) = RenamingMover::new().move_file(&src, &dest).expect("move");
        assert_eq!(actual, dir.path().join("a.3.txt"));
        assert!(is_new);
    }

    #[test]
    fn dedups_against_a_numbered_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "a.txt", b"one");
        write(dir.path(), "a.1.txt", b"two");
        let src = write(dir.path(), "tmp", b"two");
        let dest = dir.path().join("a.txt");

        let (actual, is_new) = RenamingMover::new().move_file(&src, &dest).expect("move");
        assert_eq!(actual, dir.path().join("a.1.txt"));
        assert!(!is_new);
        assert!(!src.exists());
    }

    #[test]
    fn destinations_without_extension_append_the_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "demo", b"one");
        let src = write(dir.path(), "tmp", b"two");
        let dest = dir.path().join("demo");

        let (actual, is_new) = RenamingMover::new().move_file(&src, &dest).expect("move");
        assert_eq!(actual, dir.path().join("demo.1"));
        assert!(is_new);
    }

    #[test]
    fn multi_dot_names_keep_only_the_last_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "run.dm_68", b"one");
        let src = write(dir.path(), "tmp", b"two");
        let dest = dir.path().join("run.dm_68");

        let (actual, _) = RenamingMover::new().move_file(&src, &dest).expect("move");
        assert_eq!(actual, dir.path().join("run.1.dm_68"));
    }
}
