//! Converts pipeline outcomes into chat-visible effects: announcements,
//! reaction swaps on the origin message, direct re-uploads of artifacts the
//! hosting platform refused, re-render triggers for oversize videos and
//! operator DMs.

use std::fs;
use std::sync::Arc;

use anyhow::{
    Context,
    Result,
    anyhow,
};
use tracing::{
    error,
    info,
    warn,
};

use crate::chat::{
    ChannelId,
    ChatClient,
    MessageId,
};
use crate::domain::{
    ItemMeta,
    PipelineError,
    Submission,
};
use crate::ingest::ChannelDirectory;
use crate::queue::RenderingQueue;
use crate::registry::RenderedDemoRegistry;
use crate::settings::{
    Reactions,
    Settings,
};
use crate::uploader::VideoUploadError;

/// The single reaction set an origin message carries at any point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionState {
    Wip,
    Rejected,
    Done,
    Failed,
}

/// Swaps the origin message's reactions to exactly the given state's set.
/// Removals of reactions that were never applied are harmless.
pub fn apply_reaction_state(
    client: &dyn ChatClient,
    reactions: &Reactions,
    channel: ChannelId,
    message: MessageId,
    state: ReactionState,
) -> Result<()> {
    let target = match state {
        ReactionState::Wip => &reactions.wip,
        ReactionState::Rejected => &reactions.rejected,
        ReactionState::Done => &reactions.done,
        ReactionState::Failed => &reactions.failed,
    };
    for set in [
        &reactions.wip,
        &reactions.rejected,
        &reactions.done,
        &reactions.failed,
    ] {
        if std::ptr::eq(set, target) {
            continue;
        }
        for emoji in set {
            if let Err(err) = client.remove_own_reaction(channel, message, emoji) {
                warn!(emoji = %emoji, error = %format!("{err:#}"), "failed to remove reaction");
            }
        }
    }
    for emoji in target {
        client.add_reaction(channel, message, emoji)?;
    }
    Ok(())
}

pub struct Reactor {
    client: Arc<dyn ChatClient>,
    settings: Arc<Settings>,
    directory: ChannelDirectory,
    registry: Arc<RenderedDemoRegistry>,
    queue: Arc<dyn RenderingQueue>,
}

impl Reactor {
    pub fn new(
        client: Arc<dyn ChatClient>,
        settings: Arc<Settings>,
        directory: ChannelDirectory,
        registry: Arc<RenderedDemoRegistry>,
        queue: Arc<dyn RenderingQueue>,
    ) -> Self {
        Self {
            client,
            settings,
            directory,
            registry,
            queue,
        }
    }

    /// Wires this reactor into a queue's callback fan-out.
    pub fn install(self: &Arc<Self>, queue: &dyn RenderingQueue) {
        let on_done = self.clone();
        queue.add_done_callback(Arc::new(move |url, meta| on_done.on_success(url, meta)));
        let on_fail = self.clone();
        queue.add_fail_callback(Arc::new(move |err, meta| on_fail.on_failure(err, meta)));
    }

    pub fn on_success(&self, video_url: &str, meta: &ItemMeta) -> Result<()> {
        info!(video_url = %video_url, filename = %meta.filename, "render finished");
        let origin = self.resolve_origin(meta);
        let content = format!(
            "{}{video_url}{}",
            self.settings.rendering_done_message_prefix, self.settings.rendering_done_message_suffix
        );
        for channel in self.output_channels(meta) {
            self.client
                .send_message(channel, &content, origin)
                .with_context(|| format!("failed to announce {video_url}"))?;
        }
        if let Some((channel, message)) = origin {
            apply_reaction_state(
                self.client.as_ref(),
                &self.settings.reactions,
                channel,
                message,
                ReactionState::Done,
            )?;
        }
        self.registry.record(&meta.filename, video_url)?;
        if meta.has_unknown
            && let Some(operator) = self.settings.operator_user
        {
            self.client.direct_message(
                operator,
                &format!(
                    "Rendered {} with incomplete metadata: {video_url}",
                    meta.filename
                ),
            )?;
        }
        Ok(())
    }

    pub fn on_failure(&self, err: &PipelineError, meta: &ItemMeta) -> Result<()> {
        error!(error = %err, filename = %meta.filename, "pipeline failure reached the reactor");
        match err {
            PipelineError::VideoUpload(upload_err) => self.handle_upload_failure(upload_err, meta),
            _ => {
                if let Some((channel, message)) = self.resolve_origin(meta) {
                    apply_reaction_state(
                        self.client.as_ref(),
                        &self.settings.reactions,
                        channel,
                        message,
                        ReactionState::Failed,
                    )?;
                }
                Ok(())
            }
        }
    }

    /// An upload failure that left a playable artifact behind: oversize
    /// videos are re-rendered at lower quality, everything else is posted
    /// into chat directly and then treated as a success.
    fn handle_upload_failure(&self, err: &VideoUploadError, meta: &ItemMeta) -> Result<()> {
        let video_file = err.video_file();
        let origin = self.resolve_origin(meta);
        let size = match fs::metadata(video_file) {
            Ok(metadata) => metadata.len(),
            Err(io_err) => {
                warn!(
                    video = %video_file.display(),
                    error = %io_err,
                    "upload failed without a usable artifact"
                );
                if let Some((channel, message)) = origin {
                    apply_reaction_state(
                        self.client.as_ref(),
                        &self.settings.reactions,
                        channel,
                        message,
                        ReactionState::Failed,
                    )?;
                }
                return Ok(());
            }
        };

        if size > self.settings.discord_max_video_size {
            return self.resubmit_lower_quality(meta, size);
        }

        let mut recorded_url = None;
        for channel in self.output_channels(meta) {
            let jump_url = self.client.upload_file(
                channel,
                &self.settings.rendering_done_message_discord,
                video_file,
                origin,
            )?;
            recorded_url.get_or_insert(jump_url);
        }
        if let Some((channel, message)) = origin {
            apply_reaction_state(
                self.client.as_ref(),
                &self.settings.reactions,
                channel,
                message,
                ReactionState::Done,
            )?;
        }
        if let Some(url) = recorded_url {
            self.registry.record(&meta.filename, &url)?;
        }
        if meta.rerendering_round.is_none()
            && let Some(operator) = self.settings.operator_user
        {
            self.client.direct_message(
                operator,
                &format!(
                    "Upload of {} failed ({err}); the video was posted to chat directly",
                    meta.filename
                ),
            )?;
        }
        Ok(())
    }

    fn resubmit_lower_quality(&self, meta: &ItemMeta, size: u64) -> Result<()> {
        let Some(demo_url) = meta.demo_url.clone() else {
            warn!(
                filename = %meta.filename,
                "oversize video but no demo URL to re-render from"
            );
            return Ok(());
        };
        let round = meta.rerendering_round.unwrap_or(0) + 1;
        info!(
            filename = %meta.filename,
            size,
            round,
            "video exceeds the chat size limit; re-rendering at lower quality"
        );
        let mut new_meta = meta.clone();
        new_meta.rerendering_round = Some(round);
        self.queue
            .submit(Submission {
                demo_url,
                resolution: self.settings.rerendering_resolution,
                title: meta.title.clone().unwrap_or_default(),
                description: meta.description.clone().unwrap_or_default(),
                meta: new_meta,
            })
            .map_err(|err| anyhow!(err))
    }

    /// Channel ids of every output channel mapped for this item.
    fn output_channels(&self, meta: &ItemMeta) -> Vec<ChannelId> {
        self.settings
            .output_channels(meta.in_channel.as_deref())
            .into_iter()
            .filter_map(|name| match self.directory.get(&name) {
                Some(info) => Some(info.id),
                None => {
                    warn!(channel = %name, "output channel is not in the directory");
                    None
                }
            })
            .collect()
    }

    /// The origin message, re-fetched to confirm it still exists. Both the
    /// announce and the direct-upload paths resolve this the same way.
    fn resolve_origin(&self, meta: &ItemMeta) -> Option<(ChannelId, MessageId)> {
        let name = meta.in_channel.as_deref()?;
        let info = self.directory.get(name)?;
        let message_id = meta.message_id?;
        match self.client.fetch_message(info.id, message_id) {
            Ok(Some(_)) => Some((info.id, message_id)),
            Ok(None) => None,
            Err(err) => {
                warn!(
                    message_id,
                    error = %format!("{err:#}"),
                    "failed to fetch the origin message"
                );
                None
            }
        }
    }
}
