//! The autonomous rendering pipeline: three durable queues (render, upload,
//! delayed publish), each drained by its own worker thread.
//!
//! Crash-safety contract: a stage performs its side effect first, then
//! appends the item to the next queue, pops its own head and flushes in one
//! write. A crash between the side effect and the flush re-runs the item;
//! downstream consumers tolerate the resulting duplicates.

use std::collections::VecDeque;
use std::panic::{
    AssertUnwindSafe,
    catch_unwind,
};
use std::path::{
    Path,
    PathBuf,
};
use std::sync::mpsc;
use std::sync::{
    Arc,
    Condvar,
    Mutex,
};
use std::thread;
use std::time::Duration;

use anyhow::{
    Context,
    Result,
    anyhow,
};
use serde::{
    Deserialize,
    Serialize,
};
use tracing::{
    error,
    info,
};

use crate::domain::{
    ItemMeta,
    PipelineError,
    Submission,
};
use crate::queue::{
    DoneCallback,
    FailCallback,
    RenderingQueue,
    Shutdown,
};
use crate::renderer::DemoRenderer;
use crate::store::StoredState;
use crate::sync_ext::{
    CondvarExt,
    MutexExt,
};
use crate::uploader::RenderedVideoUploader;

/// Upper bound on one publish-stage sleep increment; keeps the delay
/// responsive to cancellation.
const MAX_PUBLISH_SLEEP: Duration = Duration::from_secs(5);
/// How often idle workers re-check the shutdown flag.
const WAIT_TICK: Duration = Duration::from_millis(500);

/// Fetches the demo bytes the render stage feeds to the engine.
pub trait DemoFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpDemoFetcher {
    http: reqwest::blocking::Client,
}

impl HttpDemoFetcher {
    pub fn new() -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("failed to build HTTP client for demo downloads")?;
        Ok(Self { http })
    }
}

impl DemoFetcher for HttpDemoFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .with_context(|| format!("failed to download demo {url}"))?;
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read demo body {url}"))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RenderEntry {
    demo_url: String,
    title: String,
    description: String,
    meta: ItemMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadEntry {
    demo_url: String,
    video_file: PathBuf,
    title: String,
    description: String,
    meta: ItemMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WaitingEntry {
    /// Seconds since the UNIX epoch at which the item may be announced.
    publish_at: f64,
    video_url: String,
    meta: ItemMeta,
    demo_url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalQueueState {
    rendering_queue: VecDeque<RenderEntry>,
    upload_queue: VecDeque<UploadEntry>,
    waiting_queue: VecDeque<WaitingEntry>,
}

struct Inner {
    state: Mutex<StoredState<LocalQueueState>>,
    render_cv: Condvar,
    upload_cv: Condvar,
    waiting_cv: Condvar,
    fetcher: Box<dyn DemoFetcher>,
    renderer: Box<dyn DemoRenderer>,
    uploader: Box<dyn RenderedVideoUploader>,
    delay_before_publishing: Duration,
    done_callbacks: Mutex<Vec<DoneCallback>>,
    fail_callbacks: Mutex<Vec<FailCallback>>,
}

/// The local rendering queue (see module docs). `run` owns three named
/// worker threads and terminates on shutdown or on the first stage failure,
/// cancelling and joining the rest.
pub struct LocalRenderingQueue {
    inner: Arc<Inner>,
}

impl LocalRenderingQueue {
    pub fn open(
        state_path: &Path,
        fetcher: Box<dyn DemoFetcher>,
        renderer: Box<dyn DemoRenderer>,
        uploader: Box<dyn RenderedVideoUploader>,
        delay_before_publishing: Duration,
    ) -> Result<Self> {
        let state = StoredState::open(state_path, LocalQueueState::default())?;
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                render_cv: Condvar::new(),
                upload_cv: Condvar::new(),
                waiting_cv: Condvar::new(),
                fetcher,
                renderer,
                uploader,
                delay_before_publishing,
                done_callbacks: Mutex::new(Vec::new()),
                fail_callbacks: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl RenderingQueue for LocalRenderingQueue {
    fn submit(&self, submission: Submission) -> Result<(), PipelineError> {
        let mut state = self.inner.state.lock_unpoisoned();
        state.value_mut().rendering_queue.push_back(RenderEntry {
            demo_url: submission.demo_url,
            title: submission.title,
            description: submission.description,
            meta: submission.meta,
        });
        state.flush().map_err(PipelineError::other)?;
        drop(state);
        self.inner.render_cv.notify_all();
        Ok(())
    }

    fn add_done_callback(&self, callback: DoneCallback) {
        self.inner.done_callbacks.lock_unpoisoned().push(callback);
    }

    fn add_fail_callback(&self, callback: FailCallback) {
        self.inner.fail_callbacks.lock_unpoisoned().push(callback);
    }

    fn run(&self, shutdown: Arc<Shutdown>) -> Result<()> {
        let stages: [(&str, fn(&Inner, &Shutdown) -> Result<()>); 3] = [
            ("demoflow-render-worker", Inner::run_rendering),
            ("demoflow-upload-worker", Inner::run_uploads),
            ("demoflow-publish-worker", Inner::run_publishing),
        ];

        let (tx, rx) = mpsc::channel::<Result<()>>();
        let mut handles = Vec::with_capacity(stages.len());
        for (name, stage) in stages {
            let inner = self.inner.clone();
            let shutdown = shutdown.clone();
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let result = guarded_stage(name, || stage(&inner, &shutdown));
                    let _ = tx.send(result);
                })
                .with_context(|| format!("failed to spawn {name} thread"))?;
            handles.push(handle);
        }
        drop(tx);

        // First failure wins: trigger shutdown so the remaining stages park
        // their in-flight items and exit, then surface that failure.
        let mut first_error: Option<anyhow::Error> = None;
        while let Ok(result) = rx.recv() {
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
                shutdown.trigger();
            }
        }
        for handle in handles {
            let _ = handle.join();
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<()> {
        self.inner.state.lock_unpoisoned().flush()
    }
}

fn guarded_stage<F>(name: &str, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(anyhow!("{name} panicked: {message}"))
        }
    }
}

impl Inner {
    fn run_rendering(&self, shutdown: &Shutdown) -> Result<()> {
        loop {
            let Some(entry) = self.next_render_entry(shutdown) else {
                return Ok(());
            };
            let result = self
                .fetcher
                .fetch(&entry.demo_url)
                .and_then(|bytes| self.renderer.render(&entry.demo_url, &bytes));
            match result {
                Ok(video_file) => {
                    info!(demo_url = %entry.demo_url, video = %video_file.display(), "demo rendered");
                    let mut state = self.state.lock_unpoisoned();
                    state.value_mut().upload_queue.push_back(UploadEntry {
                        demo_url: entry.demo_url,
                        video_file,
                        title: entry.title,
                        description: entry.description,
                        meta: entry.meta,
                    });
                    state.value_mut().rendering_queue.pop_front();
                    state.flush()?;
                }
                Err(err) => {
                    let err = PipelineError::Renderer(format!("{err:#}"));
                    self.report_error(&err, &entry.meta)?;
                    let mut state = self.state.lock_unpoisoned();
                    state.value_mut().rendering_queue.pop_front();
                    state.flush()?;
                }
            }
            self.upload_cv.notify_all();
        }
    }

    fn run_uploads(&self, shutdown: &Shutdown) -> Result<()> {
        loop {
            let Some(entry) = self.next_upload_entry(shutdown) else {
                return Ok(());
            };
            match self
                .uploader
                .upload(&entry.title, &entry.description, &entry.video_file)
            {
                Ok(video_url) => {
                    info!(video_url = %video_url, "rendered video uploaded");
                    let publish_at =
                        now_epoch_seconds() + self.delay_before_publishing.as_secs_f64();
                    let mut state = self.state.lock_unpoisoned();
                    state.value_mut().waiting_queue.push_back(WaitingEntry {
                        publish_at,
                        video_url,
                        meta: entry.meta,
                        demo_url: entry.demo_url,
                    });
                    state.value_mut().upload_queue.pop_front();
                    state.flush()?;
                }
                Err(err) => {
                    // A failed upload drops the item here; the failure
                    // fan-out decides whether the artifact gets a second
                    // life (re-render or direct chat upload).
                    let err = PipelineError::VideoUpload(err);
                    self.report_error(&err, &entry.meta)?;
                    let mut state = self.state.lock_unpoisoned();
                    state.value_mut().upload_queue.pop_front();
                    state.flush()?;
                }
            }
            self.waiting_cv.notify_all();
        }
    }

    fn run_publishing(&self, shutdown: &Shutdown) -> Result<()> {
        loop {
            let Some(entry) = self.next_waiting_entry(shutdown) else {
                return Ok(());
            };
            loop {
                let remaining = entry.publish_at - now_epoch_seconds();
                if remaining <= 0.0 {
                    break;
                }
                let step = Duration::from_secs_f64(remaining).min(MAX_PUBLISH_SLEEP);
                if shutdown.sleep(step) {
                    // Interrupted: the head stays parked for the next run.
                    return Ok(());
                }
            }
            for callback in self.done_callbacks.lock_unpoisoned().clone() {
                if let Err(err) = callback(&entry.video_url, &entry.meta) {
                    // A completed artifact that cannot be announced is an
                    // operator incident, not silent loss: fan out and halt.
                    let reported =
                        PipelineError::Other(format!("publish callback failed: {err:#}"));
                    self.report_error(&reported, &entry.meta)?;
                    return Err(err);
                }
            }
            let mut state = self.state.lock_unpoisoned();
            state.value_mut().waiting_queue.pop_front();
            state.flush()?;
        }
    }

    /// Invokes every fail callback in registration order. An error inside a
    /// fail callback itself aborts the stage: losing failure notifications
    /// silently would hide real incidents.
    fn report_error(&self, err: &PipelineError, meta: &ItemMeta) -> Result<()> {
        error!(error = %err, filename = %meta.filename, "pipeline item failed");
        for callback in self.fail_callbacks.lock_unpoisoned().clone() {
            if let Err(callback_err) = callback(err, meta) {
                error!(error = %callback_err, "failure callback raised");
                return Err(callback_err);
            }
        }
        Ok(())
    }

    fn next_render_entry(&self, shutdown: &Shutdown) -> Option<RenderEntry> {
        let mut state = self.state.lock_unpoisoned();
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            if let Some(entry) = state.value().rendering_queue.front() {
                return Some(entry.clone());
            }
            let (next, _) = self.render_cv.wait_timeout_unpoisoned(state, WAIT_TICK);
            state = next;
        }
    }

    fn next_upload_entry(&self, shutdown: &Shutdown) -> Option<UploadEntry> {
        let mut state = self.state.lock_unpoisoned();
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            if let Some(entry) = state.value().upload_queue.front() {
                return Some(entry.clone());
            }
            let (next, _) = self.upload_cv.wait_timeout_unpoisoned(state, WAIT_TICK);
            state = next;
        }
    }

    fn next_waiting_entry(&self, shutdown: &Shutdown) -> Option<WaitingEntry> {
        let mut state = self.state.lock_unpoisoned();
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            if let Some(entry) = state.value().waiting_queue.front() {
                return Some(entry.clone());
            }
            let (next, _) = self.waiting_cv.wait_timeout_unpoisoned(state, WAIT_TICK);
            state = next;
        }
    }
}

fn now_epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
