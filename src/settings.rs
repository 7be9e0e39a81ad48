//! Daemon configuration: one JSON file, credentials overridable from the
//! environment.

use std::collections::BTreeMap;
use std::fs;
use std::io::BufReader;
use std::path::{
    Path,
    PathBuf,
};
use std::time::Duration;

use anyhow::{
    Context,
    Result,
    bail,
};
use serde::{
    Deserialize,
    Serialize,
};

/// A single channel name or a list of them; the config accepts both shapes
/// for output-channel values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(name) => vec![name.clone()],
            Self::Many(names) => names.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderingProvider {
    #[serde(rename = "igmdb")]
    Igmdb,
    #[serde(rename = "local-rendering")]
    LocalRendering,
}

/// Reaction sets applied to origin messages as items move through the
/// pipeline. A message carries exactly one current set at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Reactions {
    pub wip: Vec<String>,
    pub rejected: Vec<String>,
    pub done: Vec<String>,
    pub failed: Vec<String>,
}

impl Default for Reactions {
    fn default() -> Self {
        Self {
            wip: vec!["⏳".to_string()],
            rejected: vec!["♻️".to_string()],
            done: vec!["✅".to_string()],
            failed: vec!["❌".to_string()],
        }
    }
}

/// Everything the local render-and-upload pipeline needs to drive its two
/// external binaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRenderingSettings {
    pub odfe_dir: PathBuf,
    pub odfe_executable: PathBuf,
    pub config_dir: PathBuf,
    pub demo_dir: PathBuf,
    pub video_dir: PathBuf,
    /// Engine config prefix written before the per-render directives.
    #[serde(default)]
    pub defrag_config: String,
    pub uploader_executable: PathBuf,
    #[serde(default)]
    pub uploader_args: Vec<String>,
    /// Delay between a successful upload and the chat announcement.
    #[serde(default)]
    pub publishing_delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub discord_token: String,
    /// Input channel name (`"{guild}--{channel}"`) to its output channel(s).
    pub channels: BTreeMap<String, OneOrMany>,
    pub state_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub attachments_directory: PathBuf,
    pub urls_file: PathBuf,
    /// Output channels for items whose metadata predates per-channel routing.
    #[serde(default)]
    pub rendering_output_channel: Option<OneOrMany>,
    pub demo_rendering_provider: RenderingProvider,
    #[serde(default)]
    pub igmdb_token: Option<String>,
    #[serde(default = "default_polling_interval_secs")]
    pub igmdb_polling_interval_secs: u64,
    pub democleaner_exe: PathBuf,
    #[serde(default)]
    pub local_rendering: Option<LocalRenderingSettings>,
    /// Videos larger than this are re-rendered at lower quality instead of
    /// being posted into chat directly.
    #[serde(default = "default_max_video_size")]
    pub discord_max_video_size: u64,
    #[serde(default = "default_rendering_resolution")]
    pub rendering_resolution: u32,
    /// Lowered resolution used for re-renders of oversize videos.
    #[serde(default = "default_rerendering_resolution")]
    pub rerendering_resolution: u32,
    #[serde(default)]
    pub reactions: Reactions,
    #[serde(default = "default_done_message_prefix")]
    pub rendering_done_message_prefix: String,
    #[serde(default)]
    pub rendering_done_message_suffix: String,
    #[serde(default = "default_done_message_discord")]
    pub rendering_done_message_discord: String,
    /// Operator to DM about incomplete metadata and first-round failures.
    #[serde(default)]
    pub operator_user: Option<u64>,
    /// Replay anchor for channels without a savepoint yet.
    #[serde(default)]
    pub history_anchor: Option<u64>,
    #[serde(default = "default_ingest_poll_interval_secs")]
    pub ingest_poll_interval_secs: u64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

fn default_polling_interval_secs() -> u64 {
    300
}

fn default_max_video_size() -> u64 {
    8 * 1024 * 1024
}

fn default_rendering_resolution() -> u32 {
    43
}

fn default_rerendering_resolution() -> u32 {
    28
}

fn default_done_message_prefix() -> String {
    "Rendered video: ".to_string()
}

fn default_done_message_discord() -> String {
    "Rendered video:".to_string()
}

fn default_ingest_poll_interval_secs() -> u64 {
    60
}

fn default_lock_timeout_secs() -> u64 {
    10
}

impl Settings {
    /// Loads the config file, then lets `DISCORD_TOKEN` / `IGMDB_TOKEN`
    /// environment variables override the credentials.
    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        let mut settings: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse JSON from {}", path.display()))?;

        if let Ok(token) = std::env::var("DISCORD_TOKEN") {
            settings.discord_token = token;
        }
        if let Ok(token) = std::env::var("IGMDB_TOKEN") {
            settings.igmdb_token = Some(token);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.discord_token.is_empty() {
            bail!("no chat token configured (discordToken or DISCORD_TOKEN)");
        }
        match self.demo_rendering_provider {
            RenderingProvider::Igmdb => {
                if self.igmdb_token.as_deref().unwrap_or_default().is_empty() {
                    bail!("igmdb provider selected but no igmdbToken / IGMDB_TOKEN set");
                }
            }
            RenderingProvider::LocalRendering => {
                if self.local_rendering.is_none() {
                    bail!("local-rendering provider selected but localRendering is missing");
                }
            }
        }
        Ok(())
    }

    pub fn igmdb_polling_interval(&self) -> Duration {
        Duration::from_secs(self.igmdb_polling_interval_secs)
    }

    pub fn ingest_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ingest_poll_interval_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Output channel names for an item originating in `in_channel`; items
    /// without an origin fall back to the legacy default outputs.
    pub fn output_channels(&self, in_channel: Option<&str>) -> Vec<String> {
        if let Some(name) = in_channel
            && let Some(outputs) = self.channels.get(name)
        {
            return outputs.to_vec();
        }
        self.rendering_output_channel
            .as_ref()
            .map(OneOrMany::to_vec)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> serde_json::Value {
        serde_json::json!({
            "discordToken": "token",
            "channels": {
                "guild--demos": "guild--rendered",
                "guild--more-demos": ["guild--rendered", "guild--archive"],
            },
            "stateDirectory": "/var/lib/demoflow",
            "tempDirectory": "/tmp/demoflow",
            "attachmentsDirectory": "/var/lib/demoflow/attachments",
            "urlsFile": "/var/lib/demoflow/urls.txt",
            "demoRenderingProvider": "igmdb",
            "igmdbToken": "secret",
            "democleanerExe": "/opt/democleaner/DemoCleaner3.exe",
        })
    }

    fn load_from_value(value: serde_json::Value) -> Result<Settings> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("demoflow.json");
        fs::write(&path, value.to_string()).expect("write config");
        Settings::load(&path)
    }

    #[test]
    fn minimal_igmdb_config_loads_with_defaults() {
        let settings = load_from_value(minimal_config()).expect("load");
        assert_eq!(settings.demo_rendering_provider, RenderingProvider::Igmdb);
        assert_eq!(settings.igmdb_polling_interval(), Duration::from_secs(300));
        assert_eq!(settings.rerendering_resolution, 28);
        assert_eq!(settings.reactions.done, vec!["✅".to_string()]);
    }

    #[test]
    fn output_channels_accept_both_shapes_and_fall_back_to_legacy() {
        let mut config = minimal_config();
        config["renderingOutputChannel"] = serde_json::json!(["guild--fallback"]);
        let settings = load_from_value(config).expect("load");

        assert_eq!(
            settings.output_channels(Some("guild--demos")),
            vec!["guild--rendered"]
        );
        assert_eq!(
            settings.output_channels(Some("guild--more-demos")),
            vec!["guild--rendered", "guild--archive"]
        );
        assert_eq!(settings.output_channels(None), vec!["guild--fallback"]);
        assert_eq!(
            settings.output_channels(Some("guild--unknown")),
            vec!["guild--fallback"]
        );
    }

    #[test]
    fn igmdb_provider_requires_a_token() {
        let mut config = minimal_config();
        config["igmdbToken"] = serde_json::Value::Null;
        let settings: Settings = serde_json::from_value(config).expect("parse");
        assert!(settings.validate().is_err());
    }

    #[test]
    fn local_provider_requires_its_section() {
        let mut config = minimal_config();
        config["demoRenderingProvider"] = serde_json::json!("local-rendering");
        let settings: Settings = serde_json::from_value(config.clone()).expect("parse");
        assert!(settings.validate().is_err());

        config["localRendering"] = serde_json::json!({
            "odfeDir": "/opt/odfe",
            "odfeExecutable": "/opt/odfe/oDFe.x64",
            "configDir": "/opt/odfe/defrag",
            "demoDir": "/opt/odfe/defrag/demos",
            "videoDir": "/opt/odfe/videos",
            "uploaderExecutable": "/usr/local/bin/yt-upload",
            "uploaderArgs": ["--profile", "demoflow"],
            "publishingDelaySecs": 600,
        });
        let settings = load_from_value(config).expect("load");
        let local = settings.local_rendering.expect("local section");
        assert_eq!(local.publishing_delay_secs, 600);
        assert_eq!(local.defrag_config, "");
    }
}
