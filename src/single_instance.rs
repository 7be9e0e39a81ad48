//! Process-wide run lock. Exactly one daemon instance may own a state
//! directory; a second start waits briefly for the lock and then exits with
//! an operator-visible message.

use std::fs::OpenOptions;
use std::io::{
    ErrorKind,
    Seek,
    SeekFrom,
    Write,
};
use std::path::Path;
use std::thread;
use std::time::{
    Duration,
    Instant,
};

use anyhow::{
    Context,
    Result,
    bail,
};
use fs2::FileExt;

const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Holds the exclusive lock for the lifetime of the process. Dropping the
/// guard (or dying) releases the lock; the file itself is left in place.
#[derive(Debug)]
pub struct InstanceLock {
    _lock_file: std::fs::File,
}

pub fn acquire(lock_path: &Path, timeout: Duration) -> Result<InstanceLock> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let mut lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;

    let deadline = Instant::now() + timeout;
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                lock_file.set_len(0).context("failed to truncate lock file")?;
                lock_file
                    .seek(SeekFrom::Start(0))
                    .context("failed to seek lock file")?;
                writeln!(lock_file, "{}", std::process::id())
                    .context("failed to write pid to lock file")?;
                lock_file.sync_all().ok();
                return Ok(InstanceLock {
                    _lock_file: lock_file,
                });
            }
            Err(err) if is_lock_contended(&err) => {
                if Instant::now() >= deadline {
                    bail!(
                        "another instance is already running (lock {} is held); \
                         stop it or remove a stale lock before starting again",
                        lock_path.display()
                    );
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to acquire lock {}", lock_path.display()));
            }
        }
    }
}

fn is_lock_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_a_fresh_lock_and_records_the_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");
        let _guard = acquire(&path, Duration::from_millis(10)).expect("acquire");
        let contents = std::fs::read_to_string(&path).expect("read lock file");
        assert_eq!(
            contents.trim().parse::<u32>().expect("pid"),
            std::process::id()
        );
    }

    #[test]
    fn a_second_acquire_times_out_while_the_lock_is_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");
        let _guard = acquire(&path, Duration::from_millis(10)).expect("acquire");

        let err = acquire(&path, Duration::from_millis(300)).expect_err("second acquire");
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn the_lock_is_reacquirable_after_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");
        let guard = acquire(&path, Duration::from_millis(10)).expect("acquire");
        drop(guard);
        let _guard = acquire(&path, Duration::from_millis(10)).expect("reacquire");
    }
}
