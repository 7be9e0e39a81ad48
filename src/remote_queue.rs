//! Remote rendering over the igmdb render-and-host service: submission with
//! queue-full back-pressure into a durable local overflow queue, and
//! completion by polling.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{
    Arc,
    Mutex,
};
use std::time::Duration;

use anyhow::{
    Context,
    Result,
    anyhow,
};
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use serde_json::Value;
use tracing::{
    info,
    warn,
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
use crate::store::StoredState;
use crate::sync_ext::MutexExt;

/// The provider's admission-control refusal, verbatim.
const QUEUE_FULL_ERROR: &str =
    "Can't submit; you are banned or have reached the maximum number of demos in queue";

const DEFAULT_BASE_URL: &str = "https://www.igmdb.org";

/// The remote render service surface: submit a demo, poll a render.
pub trait RemoteRenderService: Send + Sync {
    fn submit(
        &self,
        demo_url: &str,
        resolution: u32,
        title: &str,
        description: &str,
    ) -> Result<u64, PipelineError>;

    /// `Ok(Some(url))` once the render reached its final state, `Ok(None)`
    /// while it is still running.
    fn check_status(&self, render_id: u64) -> Result<Option<String>, PipelineError>;
}

/// Production igmdb client.
pub struct IgmdbClient {
    token: String,
    base_url: String,
    http: reqwest::blocking::Client,
}

impl IgmdbClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client for igmdb")?;
        Ok(Self {
            token: token.into(),
            base_url: base_url.into(),
            http,
        })
    }

    fn parse_submit_response(&self, body: &[u8], demo_url: &str) -> Result<u64, PipelineError> {
        // The endpoint escapes single quotes even outside strings; undo that
        // before treating the body as JSON.
        let cleaned = String::from_utf8_lossy(body).replace("\\'", "'");
        let response: Value = serde_json::from_str(&cleaned)
            .map_err(|err| PipelineError::Remote(format!("unparseable submit response: {err}")))?;
        let success = response["success"].as_bool().unwrap_or(false);
        let render_id = response["render_id"].as_u64().unwrap_or(0);
        if success && render_id == 0 {
            return Err(PipelineError::AlreadySubmitted {
                url: demo_url.to_string(),
            });
        }
        if !success {
            let error = response["error"].as_str().unwrap_or_default();
            if error == QUEUE_FULL_ERROR {
                return Err(PipelineError::QueueFull);
            }
            return Err(PipelineError::Remote(format!(
                "{error}; demo_url={demo_url}"
            )));
        }
        Ok(render_id)
    }
}

impl RemoteRenderService for IgmdbClient {
    fn submit(
        &self,
        demo_url: &str,
        resolution: u32,
        title: &str,
        description: &str,
    ) -> Result<u64, PipelineError> {
        let response = self
            .http
            .post(format!("{}/processor.php?action=submitDemo", self.base_url))
            .form(&[
                ("api_key", self.token.as_str()),
                ("demo_url", demo_url),
                ("resolution", &resolution.to_string()),
                ("output", "4"),
                ("stream_title", title),
                ("stream_description", description),
            ])
            .send()
            .map_err(|err| PipelineError::Transport(err.to_string()))?;
        let body = response
            .bytes()
            .map_err(|err| PipelineError::Transport(err.to_string()))?;
        self.parse_submit_response(&body, demo_url)
    }

    fn check_status(&self, render_id: u64) -> Result<Option<String>, PipelineError> {
        let response = self
            .http
            .get(format!(
                "{}/processor.php?action=getRenderInformation&render_id={render_id}",
                self.base_url
            ))
            .send()
            .map_err(|err| PipelineError::Transport(err.to_string()))?;
        let body: Value = response
            .json()
            .map_err(|err| PipelineError::Transport(err.to_string()))?;

        if !body["success"].as_bool().unwrap_or(false) {
            let error = body["output"]["error"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("unknown error when checking render {render_id}"));
            return Err(PipelineError::Remote(error));
        }
        if body["output"]["status_final"].as_str() != Some("1") {
            return Ok(None);
        }
        let output = &body["output"];
        let identifier = [
            output["donator_stream_identifier"].as_str(),
            output["stream_identifier"].as_str(),
        ]
        .into_iter()
        .flatten()
        .find(|id| !id.is_empty());
        match identifier {
            Some(id) => Ok(Some(format!("https://youtu.be/{id}"))),
            None => Err(PipelineError::Remote(format!(
                "render {render_id} finished without a stream identifier"
            ))),
        }
    }
}

/// One render awaiting remote completion. Wire form `[render_id, meta]`;
/// reads also accept the legacy bare id.
#[derive(Debug, Clone, PartialEq)]
struct UploadedEntry {
    render_id: u64,
    meta: ItemMeta,
}

impl Serialize for UploadedEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.render_id, &self.meta).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for UploadedEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::Number(id) => Ok(Self {
                render_id: id
                    .as_u64()
                    .ok_or_else(|| serde::de::Error::custom("render id must be unsigned"))?,
                meta: ItemMeta::unknown(),
            }),
            Value::Array(items) if !items.is_empty() => {
                let render_id = items[0]
                    .as_u64()
                    .ok_or_else(|| serde::de::Error::custom("render id must be unsigned"))?;
                let meta = ItemMeta::from_wire(items.get(1).unwrap_or(&Value::Null))
                    .map_err(serde::de::Error::custom)?;
                Ok(Self { render_id, meta })
            }
            other => Err(serde::de::Error::custom(format!(
                "unexpected uploaded-queue entry: {other}"
            ))),
        }
    }
}

/// A held-back submission. Wire form `[demo_url, resolution, title,
/// description, meta]`; reads also accept the legacy four-element form.
#[derive(Debug, Clone, PartialEq)]
struct QueuedSubmission(Submission);

impl Serialize for QueuedSubmission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = &self.0;
        (&s.demo_url, s.resolution, &s.title, &s.description, &s.meta).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueuedSubmission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Value::Array(items) = &value else {
            return Err(serde::de::Error::custom(format!(
                "unexpected local-queue entry: {value}"
            )));
        };
        if items.len() < 4 {
            return Err(serde::de::Error::custom(format!(
                "local-queue entry too short: {value}"
            )));
        }
        let demo_url = items[0]
            .as_str()
            .ok_or_else(|| serde::de::Error::custom("demo_url must be a string"))?
            .to_string();
        let resolution = items[1]
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("resolution must be unsigned"))?
            as u32;
        let title = items[2].as_str().unwrap_or_default().to_string();
        let description = items[3].as_str().unwrap_or_default().to_string();
        let meta = ItemMeta::from_wire(items.get(4).unwrap_or(&Value::Null))
            .map_err(serde::de::Error::custom)?;
        Ok(Self(Submission {
            demo_url,
            resolution,
            title,
            description,
            meta,
        }))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RemoteQueueState {
    uploaded_queue: Vec<UploadedEntry>,
    local_queue: VecDeque<QueuedSubmission>,
    queue_full: bool,
}

/// Queue-full-aware polling queue: submissions go to the remote service when
/// it admits them and are buffered durably when it refuses; completion is
/// observed by polling the status endpoint.
pub struct PollingRemoteQueue {
    service: Arc<dyn RemoteRenderService>,
    state: Mutex<StoredState<RemoteQueueState>>,
    done_callbacks: Mutex<Vec<DoneCallback>>,
    fail_callbacks: Mutex<Vec<FailCallback>>,
    polling_interval: Duration,
}

impl PollingRemoteQueue {
    pub fn open(
        state_path: &Path,
        service: Arc<dyn RemoteRenderService>,
        polling_interval: Duration,
    ) -> Result<Self> {
        let state = StoredState::open(state_path, RemoteQueueState::default())?;
        Ok(Self {
            service,
            state: Mutex::new(state),
            done_callbacks: Mutex::new(Vec::new()),
            fail_callbacks: Mutex::new(Vec::new()),
            polling_interval,
        })
    }

    /// Polls every uploaded item in insertion order. Finished items fire the
    /// done callbacks and are removed; failed polls fire the fail callbacks
    /// and are removed; still-running items stay. Each removal is flushed
    /// before the next item is considered, so a crash re-polls at most one
    /// already-delivered item.
    pub fn check_for_done(&self) -> Result<()> {
        let snapshot: Vec<UploadedEntry> = {
            let state = self.state.lock_unpoisoned();
            state.value().uploaded_queue.clone()
        };
        for entry in snapshot {
            match self.service.check_status(entry.render_id) {
                Ok(Some(video_url)) => {
                    for callback in self.done_callbacks.lock_unpoisoned().clone() {
                        callback(&video_url, &entry.meta)?;
                    }
                    self.remove_uploaded(entry.render_id)?;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(render_id = entry.render_id, error = %err, "remote render failed");
                    for callback in self.fail_callbacks.lock_unpoisoned().clone() {
                        callback(&err, &entry.meta)?;
                    }
                    self.remove_uploaded(entry.render_id)?;
                }
            }
        }
        Ok(())
    }

    /// Clears the queue-full latch and drains the overflow queue from the
    /// head until the remote refuses again.
    pub fn retry_uploads(&self) -> Result<()> {
        {
            let mut state = self.state.lock_unpoisoned();
            state.value_mut().queue_full = false;
        }
        loop {
            let head = {
                let state = self.state.lock_unpoisoned();
                state.value().local_queue.front().cloned()
            };
            let Some(QueuedSubmission(submission)) = head else {
                return Ok(());
            };
            match self.service.submit(
                &submission.demo_url,
                submission.resolution,
                &submission.title,
                &submission.description,
            ) {
                Ok(render_id) => {
                    let mut state = self.state.lock_unpoisoned();
                    state.value_mut().uploaded_queue.push(UploadedEntry {
                        render_id,
                        meta: submission.meta,
                    });
                    state.value_mut().local_queue.pop_front();
                    state.flush()?;
                }
                Err(PipelineError::QueueFull) => {
                    let mut state = self.state.lock_unpoisoned();
                    state.value_mut().queue_full = true;
                    state.flush()?;
                    return Ok(());
                }
                Err(PipelineError::AlreadySubmitted { url }) => {
                    // The remote side already has this demo; drop it here.
                    warn!(url = %url, "dropping duplicate submission from the overflow queue");
                    let mut state = self.state.lock_unpoisoned();
                    state.value_mut().local_queue.pop_front();
                    state.flush()?;
                }
                Err(other) => return Err(anyhow!(other)),
            }
        }
    }

    fn remove_uploaded(&self, render_id: u64) -> Result<()> {
        let mut state = self.state.lock_unpoisoned();
        let queue = &mut state.value_mut().uploaded_queue;
        if let Some(position) = queue.iter().position(|e| e.render_id == render_id) {
            queue.remove(position);
        }
        state.flush()
    }
}

impl RenderingQueue for PollingRemoteQueue {
    fn submit(&self, submission: Submission) -> Result<(), PipelineError> {
        {
            let mut state = self.state.lock_unpoisoned();
            if state.value().queue_full {
                state
                    .value_mut()
                    .local_queue
                    .push_back(QueuedSubmission(submission));
                return state.flush().map_err(PipelineError::other);
            }
        }
        match self.service.submit(
            &submission.demo_url,
            submission.resolution,
            &submission.title,
            &submission.description,
        ) {
            Ok(render_id) => {
                info!(render_id, demo_url = %submission.demo_url, "submitted demo to remote renderer");
                let mut state = self.state.lock_unpoisoned();
                state.value_mut().uploaded_queue.push(UploadedEntry {
                    render_id,
                    meta: submission.meta,
                });
                state.flush().map_err(PipelineError::other)
            }
            Err(PipelineError::QueueFull) => {
                let mut state = self.state.lock_unpoisoned();
                state.value_mut().queue_full = true;
                state
                    .value_mut()
                    .local_queue
                    .push_back(QueuedSubmission(submission));
                state.flush().map_err(PipelineError::other)
            }
            Err(other) => Err(other),
        }
    }

    fn add_done_callback(&self, callback: DoneCallback) {
        self.done_callbacks.lock_unpoisoned().push(callback);
    }

    fn add_fail_callback(&self, callback: FailCallback) {
        self.fail_callbacks.lock_unpoisoned().push(callback);
    }

    fn run(&self, shutdown: Arc<Shutdown>) -> Result<()> {
        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }
            self.check_for_done()?;
            self.retry_uploads()?;
            if shutdown.sleep(self.polling_interval) {
                return Ok(());
            }
        }
    }

    fn close(&self) -> Result<()> {
        self.state.lock_unpoisoned().flush()
    }
}
