//! The rendering-queue abstraction both execution models implement, plus the
//! process-wide shutdown signal every long wait observes.

use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::{
    Arc,
    Condvar,
    Mutex,
};
use std::time::{
    Duration,
    Instant,
};

use anyhow::Result;

use crate::domain::{
    ItemMeta,
    PipelineError,
    Submission,
};
use crate::sync_ext::{
    CondvarExt,
    MutexExt,
};

pub type DoneCallback = Arc<dyn Fn(&str, &ItemMeta) -> Result<()> + Send + Sync>;
pub type FailCallback = Arc<dyn Fn(&PipelineError, &ItemMeta) -> Result<()> + Send + Sync>;

/// A durable pipeline that turns submitted demos into published video URLs.
///
/// Two variants exist: one submits to a remote render-and-host service and
/// polls it, the other renders and uploads locally through three durable
/// stages. Both expose the same `submit`, the same additive callback
/// registration and the same blocking `run` lifecycle; the orchestrator
/// drives them identically.
pub trait RenderingQueue: Send + Sync {
    /// Accepts an item into the pipeline and persists it before returning.
    fn submit(&self, submission: Submission) -> Result<(), PipelineError>;

    /// Registers a success callback, invoked with `(video_url, meta)` at
    /// least once per finished item. Callbacks run in registration order.
    fn add_done_callback(&self, callback: DoneCallback);

    /// Registers a failure callback, invoked with the typed error and the
    /// item's metadata. Callbacks run in registration order.
    fn add_fail_callback(&self, callback: FailCallback);

    /// Drives the pipeline until shutdown or an unrecoverable error. The
    /// polling variant ticks its remote checks on an interval; the
    /// autonomous variant runs its stage workers.
    fn run(&self, shutdown: Arc<Shutdown>) -> Result<()>;

    /// Final flush of the backing store.
    fn close(&self) -> Result<()>;
}

/// Cooperative shutdown flag. Waits are bounded so every worker notices a
/// trigger within a few hundred milliseconds.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless shutdown fires first. Returns true when
    /// the sleep was interrupted by shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.mutex.lock_unpoisoned();
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next_guard, _) = self
                .condvar
                .wait_timeout_unpoisoned(guard, deadline - now);
            guard = next_guard;
        }
    }
}
