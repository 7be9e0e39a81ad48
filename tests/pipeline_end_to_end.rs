//! End-to-end flow over test doubles: a chat message carrying a demo
//! attachment is archived, submitted to the (mock) remote renderer, polled to
//! completion, announced back into the origin channel and recorded in the
//! registry — with the duplicate branch kicking in on a re-post.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{
    Path,
    PathBuf,
};
use std::sync::{
    Arc,
    Mutex,
};
use std::time::Duration;

use anyhow::Result;
use demoflow::analyzer::{
    DemoMetadata,
    MetadataAnalyzer,
};
use demoflow::chat::{
    ChannelId,
    ChannelInfo,
    ChatClient,
    ChatMessage,
    MessageAttachment,
    MessageId,
    UserId,
};
use demoflow::domain::PipelineError;
use demoflow::ingest::{
    ChannelDirectory,
    Ingestor,
};
use demoflow::queue::RenderingQueue;
use demoflow::reactor::Reactor;
use demoflow::registry::RenderedDemoRegistry;
use demoflow::remote_queue::{
    PollingRemoteQueue,
    RemoteRenderService,
};
use demoflow::settings::{
    OneOrMany,
    Reactions,
    RenderingProvider,
    Settings,
};

#[derive(Default)]
struct MockChat {
    channels: Vec<ChannelInfo>,
    history: Mutex<HashMap<ChannelId, Vec<ChatMessage>>>,
    attachment_bytes: HashMap<u64, Vec<u8>>,
    sent: Mutex<Vec<(ChannelId, String, Option<(ChannelId, MessageId)>)>>,
    reactions_added: Mutex<Vec<(MessageId, String)>>,
    dms: Mutex<Vec<(UserId, String)>>,
}

impl ChatClient for MockChat {
    fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        Ok(self.channels.clone())
    }

    fn history_page(
        &self,
        channel: ChannelId,
        after: Option<MessageId>,
    ) -> Result<Vec<ChatMessage>> {
        let after = after.unwrap_or(0);
        let mut page: Vec<ChatMessage> = self
            .history
            .lock()
            .unwrap()
            .get(&channel)
            .map(|messages| messages.iter().filter(|m| m.id > after).cloned().collect())
            .unwrap_or_default();
        page.sort_by_key(|m| m.id);
        Ok(page)
    }

    fn send_message(
        &self,
        channel: ChannelId,
        content: &str,
        reply_to: Option<(ChannelId, MessageId)>,
    ) -> Result<MessageId> {
        self.sent
            .lock()
            .unwrap()
            .push((channel, content.to_string(), reply_to));
        Ok(9000)
    }

    fn upload_file(
        &self,
        _channel: ChannelId,
        _content: &str,
        _file: &Path,
        _reply_to: Option<(ChannelId, MessageId)>,
    ) -> Result<String> {
        Ok("https://discord.com/channels/1/20/9000".to_string())
    }

    fn fetch_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<ChatMessage>> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(&channel)
            .and_then(|messages| messages.iter().find(|m| m.id == message).cloned()))
    }

    fn add_reaction(&self, _channel: ChannelId, message: MessageId, emoji: &str) -> Result<()> {
        self.reactions_added
            .lock()
            .unwrap()
            .push((message, emoji.to_string()));
        Ok(())
    }

    fn remove_own_reaction(
        &self,
        _channel: ChannelId,
        _message: MessageId,
        _emoji: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn direct_message(&self, user: UserId, content: &str) -> Result<()> {
        self.dms.lock().unwrap().push((user, content.to_string()));
        Ok(())
    }

    fn download_attachment(&self, attachment: &MessageAttachment, dest: &Path) -> Result<()> {
        let bytes = self
            .attachment_bytes
            .get(&attachment.id)
            .cloned()
            .unwrap_or_default();
        std::fs::write(dest, bytes)?;
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedService {
    submit_results: Mutex<VecDeque<Result<u64, PipelineError>>>,
    status_results: Mutex<VecDeque<Result<Option<String>, PipelineError>>>,
}

impl RemoteRenderService for ScriptedService {
    fn submit(
        &self,
        _demo_url: &str,
        _resolution: u32,
        _title: &str,
        _description: &str,
    ) -> Result<u64, PipelineError> {
        self.submit_results
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected submit call")
    }

    fn check_status(&self, _render_id: u64) -> Result<Option<String>, PipelineError> {
        self.status_results
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected check_status call")
    }
}

struct StubAnalyzer;

impl MetadataAnalyzer for StubAnalyzer {
    fn analyze(&self, _demo_file: &Path) -> Result<DemoMetadata> {
        let mut metadata = DemoMetadata::new();
        metadata.insert(
            "player".to_string(),
            BTreeMap::from([("df_name".to_string(), "foo".to_string())]),
        );
        metadata.insert(
            "client".to_string(),
            BTreeMap::from([
                ("mapname".to_string(), "cpm22".to_string()),
                ("physic".to_string(), "CPM".to_string()),
            ]),
        );
        metadata.insert(
            "record".to_string(),
            BTreeMap::from([("bestTime".to_string(), "9.876".to_string())]),
        );
        Ok(metadata)
    }
}

fn settings_for(dir: &Path) -> Settings {
    Settings {
        discord_token: "token".to_string(),
        channels: BTreeMap::from([(
            "guild--demos".to_string(),
            OneOrMany::One("guild--rendered".to_string()),
        )]),
        state_directory: dir.join("state"),
        temp_directory: dir.join("tmp"),
        attachments_directory: dir.join("attachments"),
        urls_file: dir.join("state/urls.txt"),
        rendering_output_channel: None,
        demo_rendering_provider: RenderingProvider::Igmdb,
        igmdb_token: Some("secret".to_string()),
        igmdb_polling_interval_secs: 300,
        democleaner_exe: PathBuf::from("/nonexistent"),
        local_rendering: None,
        discord_max_video_size: 8 * 1024 * 1024,
        rendering_resolution: 43,
        rerendering_resolution: 28,
        reactions: Reactions::default(),
        rendering_done_message_prefix: "Rendered video: ".to_string(),
        rendering_done_message_suffix: String::new(),
        rendering_done_message_discord: "Rendered video:".to_string(),
        operator_user: Some(99),
        history_anchor: None,
        ingest_poll_interval_secs: 60,
        lock_timeout_secs: 10,
    }
}

fn demo_message(id: MessageId) -> ChatMessage {
    ChatMessage {
        id,
        channel_id: 10,
        content: String::new(),
        attachments: vec![MessageAttachment {
            id: 500,
            filename: "run.dm_68".to_string(),
            url: "https://cdn.example/run.dm_68".to_string(),
        }],
        jump_url: format!("https://discord.com/channels/1/10/{id}"),
    }
}

#[test]
fn a_demo_flows_from_chat_to_announcement_and_back_to_the_duplicate_branch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Arc::new(settings_for(dir.path()));
    std::fs::create_dir_all(&settings.state_directory).expect("state dir");

    let mut chat = MockChat {
        channels: vec![
            ChannelInfo {
                id: 10,
                guild_id: 1,
                guild: "guild".to_string(),
                name: "demos".to_string(),
            },
            ChannelInfo {
                id: 20,
                guild_id: 1,
                guild: "guild".to_string(),
                name: "rendered".to_string(),
            },
        ],
        ..Default::default()
    };
    chat.attachment_bytes.insert(500, b"demo bytes".to_vec());
    chat.history
        .lock()
        .unwrap()
        .insert(10, vec![demo_message(42)]);
    let client = Arc::new(chat);

    let service = Arc::new(ScriptedService::default());
    service.submit_results.lock().unwrap().push_back(Ok(42863));
    let polling_queue = Arc::new(
        PollingRemoteQueue::open(
            &settings.state_directory.join("igmdb-upload-queue.json"),
            service.clone(),
            Duration::from_secs(300),
        )
        .expect("open queue"),
    );
    let queue: Arc<dyn RenderingQueue> = polling_queue.clone();

    let registry = Arc::new(
        RenderedDemoRegistry::open(&settings.state_directory.join("db.sqlite"))
            .expect("registry"),
    );
    let directory =
        ChannelDirectory::build(client.list_channels().expect("channels"), &settings)
            .expect("directory");

    let reactor = Arc::new(Reactor::new(
        client.clone(),
        settings.clone(),
        directory.clone(),
        registry.clone(),
        queue.clone(),
    ));
    reactor.install(queue.as_ref());

    let ingestor = Ingestor::new(
        client.clone(),
        settings.clone(),
        directory,
        Box::new(StubAnalyzer),
        registry.clone(),
        queue.clone(),
    )
    .expect("ingestor");

    // Ingest the demo: it gets archived and submitted.
    assert_eq!(ingestor.replay_all().expect("replay"), 1);
    assert!(
        client
            .reactions_added
            .lock()
            .unwrap()
            .iter()
            .any(|(id, emoji)| *id == 42 && emoji == "⏳")
    );

    // First poll: still rendering, nothing visible happens.
    service.status_results.lock().unwrap().push_back(Ok(None));
    polling_queue.check_for_done().expect("poll");
    assert!(client.sent.lock().unwrap().is_empty());

    // Second poll: the render finished; the reactor announces and records.
    service
        .status_results
        .lock()
        .unwrap()
        .push_back(Ok(Some("https://youtu.be/X".to_string())));
    polling_queue.check_for_done().expect("poll");

    {
        let sent = client.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 20);
        assert_eq!(sent[0].1, "Rendered video: https://youtu.be/X");
        assert_eq!(sent[0].2, Some((10, 42)));
    }
    assert!(
        client
            .reactions_added
            .lock()
            .unwrap()
            .iter()
            .any(|(id, emoji)| *id == 42 && emoji == "✅")
    );
    assert_eq!(
        registry.lookup("run.dm_68").expect("lookup").as_deref(),
        Some("https://youtu.be/X")
    );

    // A third poll has nothing left to ask the service about.
    polling_queue.check_for_done().expect("poll");

    // The same demo posted again takes the already-rendered branch: a reply
    // with the prior URL and no new submission.
    client
        .history
        .lock()
        .unwrap()
        .get_mut(&10)
        .expect("channel history")
        .push(demo_message(43));
    assert_eq!(ingestor.replay_all().expect("replay"), 1);

    let sent = client.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].1.contains("already been rendered"));
    assert!(sent[1].1.contains("https://youtu.be/X"));
    assert_eq!(sent[1].2, Some((10, 43)));
    assert!(
        client
            .reactions_added
            .lock()
            .unwrap()
            .iter()
            .any(|(id, emoji)| *id == 43 && emoji == "♻️")
    );
}
