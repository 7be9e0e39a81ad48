//! Chat ingestion: channel discovery, savepoint-gated history replay,
//! attachment archival and dispatch of demo files into the rendering queue.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{
    Arc,
    Mutex,
};

use anyhow::{
    Context,
    Result,
    bail,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{
    error,
    info,
    warn,
};

use crate::analyzer::{
    DemoMetadata,
    MetadataAnalyzer,
};
use crate::chat::{
    ChannelInfo,
    ChatClient,
    ChatMessage,
    MessageAttachment,
};
use crate::domain::{
    ItemMeta,
    PipelineError,
    Submission,
};
use crate::mover::RenamingMover;
use crate::queue::RenderingQueue;
use crate::reactor::{
    ReactionState,
    apply_reaction_state,
};
use crate::registry::RenderedDemoRegistry;
use crate::settings::Settings;
use crate::store::Savepoint;
use crate::sync_ext::MutexExt;
use crate::urls::{
    UrlJournal,
    extract_urls,
};

static DEMO_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.dm_6[0-9]$").expect("demo filename regex"));

/// Bidirectional mapping between stable channel names (`"{guild}--{channel}"`)
/// and the platform's channel records. Built once at ready time and validated
/// against the configuration: a missing configured channel or an ambiguous
/// name is a startup failure, not something to limp along with.
#[derive(Debug, Clone)]
pub struct ChannelDirectory {
    by_name: BTreeMap<String, ChannelInfo>,
}

impl ChannelDirectory {
    pub fn build(channels: Vec<ChannelInfo>, settings: &Settings) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for channel in channels {
            let name = format!("{}--{}", channel.guild, channel.name);
            if let Some(existing) = by_name.insert(name.clone(), channel) {
                bail!(
                    "multiple channels share the name {name} (one of them is {})",
                    existing.id
                );
            }
        }

        let mut required: Vec<&str> = settings.channels.keys().map(String::as_str).collect();
        for outputs in settings.channels.values() {
            for output in outputs.to_vec() {
                if !by_name.contains_key(&output) {
                    bail!("configured output channel {output} was not found");
                }
            }
        }
        if let Some(outputs) = &settings.rendering_output_channel {
            for output in outputs.to_vec() {
                if !by_name.contains_key(&output) {
                    bail!("configured default output channel {output} was not found");
                }
            }
        }
        required.retain(|name| !by_name.contains_key(*name));
        if !required.is_empty() {
            bail!("some configured channels were not found: {required:?}");
        }

        Ok(Self { by_name })
    }

    pub fn get(&self, name: &str) -> Option<&ChannelInfo> {
        self.by_name.get(name)
    }
}

pub struct Ingestor {
    client: Arc<dyn ChatClient>,
    settings: Arc<Settings>,
    directory: ChannelDirectory,
    mover: RenamingMover,
    analyzer: Box<dyn MetadataAnalyzer>,
    registry: Arc<RenderedDemoRegistry>,
    queue: Arc<dyn RenderingQueue>,
    journal: Mutex<UrlJournal>,
    /// Serializes replay passes: exactly one history traversal mutates the
    /// savepoints and the URL journal at a time.
    replay_lock: Mutex<()>,
}

impl Ingestor {
    pub fn new(
        client: Arc<dyn ChatClient>,
        settings: Arc<Settings>,
        directory: ChannelDirectory,
        analyzer: Box<dyn MetadataAnalyzer>,
        registry: Arc<RenderedDemoRegistry>,
        queue: Arc<dyn RenderingQueue>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&settings.temp_directory).with_context(|| {
            format!(
                "failed to create temp directory {}",
                settings.temp_directory.display()
            )
        })?;
        std::fs::create_dir_all(&settings.attachments_directory).with_context(|| {
            format!(
                "failed to create attachments directory {}",
                settings.attachments_directory.display()
            )
        })?;
        let journal = UrlJournal::open(&settings.urls_file)?;
        Ok(Self {
            client,
            settings,
            directory,
            mover: RenamingMover::new(),
            analyzer,
            registry,
            queue,
            journal: Mutex::new(journal),
            replay_lock: Mutex::new(()),
        })
    }

    /// Replays every configured input channel once. Returns the number of
    /// messages processed; the caller repeats the pass until that reaches
    /// zero so messages arriving mid-replay are still picked up.
    pub fn replay_all(&self) -> Result<usize> {
        let _guard = self.replay_lock.lock_unpoisoned();
        let mut processed = 0;
        let names: Vec<String> = self.settings.channels.keys().cloned().collect();
        for name in names {
            let Some(info) = self.directory.get(&name).cloned() else {
                // Validated at startup; a vanished channel is skippable.
                warn!(channel = %name, "configured channel disappeared; skipping");
                continue;
            };
            processed += self.replay_channel(&name, &info)?;
        }
        Ok(processed)
    }

    fn replay_channel(&self, name: &str, info: &ChannelInfo) -> Result<usize> {
        let savepoint_path = self
            .settings
            .state_directory
            .join(format!("{}.txt", urlencoding::encode(name)));
        let mut savepoint = Savepoint::open(&savepoint_path)?;
        let mut after = savepoint.get().or(self.settings.history_anchor);
        let mut processed = 0;

        loop {
            let page = match self.client.history_page(info.id, after) {
                Ok(page) => page,
                Err(err) => {
                    // Typically a permission problem on one channel; archive
                    // the rest instead of aborting the whole pass.
                    warn!(channel = %name, error = %format!("{err:#}"), "history replay failed; skipping channel");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            for message in page {
                self.handle_message(name, info, &message)?;
                savepoint.set(
                    message.id,
                    || self.journal.lock_unpoisoned().sync(),
                    || Ok(()),
                )?;
                after = Some(message.id);
                processed += 1;
            }
        }
        savepoint.close()?;
        Ok(processed)
    }

    fn handle_message(
        &self,
        in_channel: &str,
        info: &ChannelInfo,
        message: &ChatMessage,
    ) -> Result<()> {
        {
            let mut journal = self.journal.lock_unpoisoned();
            for url in extract_urls(&message.content) {
                journal.append(&url, &message.jump_url)?;
            }
        }

        for (index, attachment) in message.attachments.iter().enumerate() {
            let (archived, is_new) = self.archive_attachment(message, attachment, index)?;
            if DEMO_FILENAME.is_match(&attachment.filename) {
                self.dispatch_demo(in_channel, info, message, attachment, &archived, is_new)?;
            }
        }
        Ok(())
    }

    fn archive_attachment(
        &self,
        message: &ChatMessage,
        attachment: &MessageAttachment,
        index: usize,
    ) -> Result<(PathBuf, bool)> {
        let temp_path = self.settings.temp_directory.join(format!(
            "{}-{}-{}-{}",
            message.id,
            attachment.id,
            index,
            std::process::id()
        ));
        self.client.download_attachment(attachment, &temp_path)?;
        let dest = self
            .settings
            .attachments_directory
            .join(sanitize_filename(&attachment.filename));
        self.mover.move_file(&temp_path, &dest)
    }

    fn dispatch_demo(
        &self,
        in_channel: &str,
        info: &ChannelInfo,
        message: &ChatMessage,
        attachment: &MessageAttachment,
        archived: &std::path::Path,
        is_new: bool,
    ) -> Result<()> {
        let filename = archived
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !is_new {
            if let Some(url) = self.registry.lookup(&filename)? {
                info!(filename = %filename, url = %url, "duplicate demo; already rendered");
                apply_reaction_state(
                    self.client.as_ref(),
                    &self.settings.reactions,
                    info.id,
                    message.id,
                    ReactionState::Rejected,
                )?;
                self.client.send_message(
                    info.id,
                    &format!("This demo has already been rendered: {url}"),
                    Some((info.id, message.id)),
                )?;
                return Ok(());
            }
            // Known bytes without a recorded URL: an earlier attempt never
            // finished, so submit again.
        }

        apply_reaction_state(
            self.client.as_ref(),
            &self.settings.reactions,
            info.id,
            message.id,
            ReactionState::Wip,
        )?;

        let metadata = match self.analyzer.analyze(archived) {
            Ok(metadata) => metadata,
            Err(err) => {
                error!(filename = %filename, error = %format!("{err:#}"), "demo analysis failed");
                apply_reaction_state(
                    self.client.as_ref(),
                    &self.settings.reactions,
                    info.id,
                    message.id,
                    ReactionState::Failed,
                )?;
                return Ok(());
            }
        };

        let composed = compose_texts(&metadata, &filename, &message.jump_url);
        let meta = ItemMeta {
            in_channel: Some(in_channel.to_string()),
            message_id: Some(message.id),
            title: Some(composed.title.clone()),
            description: Some(composed.description.clone()),
            rerendering_round: None,
            demo_url: Some(attachment.url.clone()),
            has_unknown: composed.has_unknown,
            filename,
        };
        let submission = Submission {
            demo_url: attachment.url.clone(),
            resolution: self.settings.rendering_resolution,
            title: composed.title,
            description: composed.description,
            meta,
        };
        match self.queue.submit(submission) {
            Ok(()) => {}
            Err(PipelineError::AlreadySubmitted { url }) => {
                warn!(url = %url, "render service reports this demo as already submitted");
            }
            Err(err) => {
                error!(error = %err, "demo submission failed");
                apply_reaction_state(
                    self.client.as_ref(),
                    &self.settings.reactions,
                    info.id,
                    message.id,
                    ReactionState::Failed,
                )?;
            }
        }
        Ok(())
    }
}

struct ComposedTexts {
    title: String,
    description: String,
    has_unknown: bool,
}

/// Builds the human-readable video title and description from the analyzer
/// output. Missing fields become `?` and are flagged so the operator hears
/// about the incomplete metadata once the render succeeds.
fn compose_texts(metadata: &DemoMetadata, filename: &str, message_link: &str) -> ComposedTexts {
    let mut has_unknown = false;
    let mut field = |candidates: &[(&str, &str)]| -> String {
        for (element, attribute) in candidates {
            if let Some(value) = metadata
                .get(*element)
                .and_then(|attributes| attributes.get(*attribute))
                && !value.is_empty()
            {
                return value.clone();
            }
        }
        has_unknown = true;
        "?".to_string()
    };

    let nick = field(&[("player", "df_name"), ("player", "name")]);
    let time = field(&[("record", "bestTime"), ("record", "time"), ("client", "time")]);
    let physics = field(&[("client", "physic"), ("client", "df_promode"), ("game", "gameplay")]);
    let mapname = field(&[("client", "mapname"), ("client", "map"), ("game", "mapname")]);

    let title = format!("DeFRaG: {nick} {time} {physics} {mapname}");
    let description = format!(
        "Map: {mapname}\nPhysics: {physics}\nPlayer: {nick}\nTime: {time}\nDemo: {filename}\nSource: {message_link}"
    );
    ComposedTexts {
        title,
        description,
        has_unknown,
    }
}

/// Keeps ASCII alphanumerics, dots, dashes and underscores; anything else
/// becomes `_`. Dot-only results would escape the attachments directory and
/// are replaced wholesale.
fn sanitize_filename(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.chars().all(|c| c == '.') {
        return "attachment".to_string();
    }
    sanitized
}
