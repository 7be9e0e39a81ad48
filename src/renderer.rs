//! Local demo rendering through the ODFE engine binary.

use std::fs;
use std::path::{
    Path,
    PathBuf,
};
use std::process::Command;

use anyhow::{
    Context,
    Result,
    bail,
};
use once_cell::sync::Lazy;
use regex::Regex;

static DEMO_EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(dm_6[0-9])(?:[?#]|$)").expect("demo extension regex"));

/// Turns raw demo bytes into a local `.mp4`.
pub trait DemoRenderer: Send + Sync {
    fn render(&self, demo_url: &str, demo_bytes: &[u8]) -> Result<PathBuf>;
}

/// Drives the engine binary: the demo is parked under a unique scratch name,
/// a config file tells the engine which demo to play and which video pipe to
/// write, and the engine is spawned with `+exec` until it quits. Scratch
/// files are cleaned up afterwards; only the rendered video remains.
#[derive(Debug, Clone)]
pub struct OdfeDemoRenderer {
    odfe_dir: PathBuf,
    odfe_executable: PathBuf,
    config_dir: PathBuf,
    demo_dir: PathBuf,
    video_dir: PathBuf,
    defrag_config: String,
}

impl OdfeDemoRenderer {
    pub fn new(
        odfe_dir: impl Into<PathBuf>,
        odfe_executable: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
        demo_dir: impl Into<PathBuf>,
        video_dir: impl Into<PathBuf>,
        defrag_config: impl Into<String>,
    ) -> Self {
        Self {
            odfe_dir: odfe_dir.into(),
            odfe_executable: odfe_executable.into(),
            config_dir: config_dir.into(),
            demo_dir: demo_dir.into(),
            video_dir: video_dir.into(),
            defrag_config: defrag_config.into(),
        }
    }
}

impl DemoRenderer for OdfeDemoRenderer {
    fn render(&self, demo_url: &str, demo_bytes: &[u8]) -> Result<PathBuf> {
        let extension = demo_extension(demo_url)
            .with_context(|| format!("cannot derive a demo extension from {demo_url}"))?;
        let id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            uuid::Uuid::new_v4().simple()
        );

        let demo_path = self.demo_dir.join(format!("{id}.{extension}"));
        let config_path = self.config_dir.join(format!("{id}.cfg"));
        let result = self.render_inner(&id, &demo_path, &config_path, demo_bytes);

        // Scratch files must not accumulate across renders, success or not.
        let _ = fs::remove_file(&demo_path);
        let _ = fs::remove_file(&config_path);
        result
    }
}

impl OdfeDemoRenderer {
    fn render_inner(
        &self,
        id: &str,
        demo_path: &Path,
        config_path: &Path,
        demo_bytes: &[u8],
    ) -> Result<PathBuf> {
        fs::write(demo_path, demo_bytes)
            .with_context(|| format!("failed to write demo scratch file {}", demo_path.display()))?;

        let config = format!(
            "{}\ndemo \"{id}\"\nvideo-pipe \"{id}\"\nset nextdemo \"wait 100; quit\"\n",
            self.defrag_config
        );
        fs::write(config_path, config)
            .with_context(|| format!("failed to write render config {}", config_path.display()))?;

        let output = Command::new(&self.odfe_executable)
            .current_dir(&self.odfe_dir)
            .arg("+exec")
            .arg(format!("{id}.cfg"))
            .output()
            .with_context(|| {
                format!(
                    "failed to run demo renderer {}",
                    self.odfe_executable.display()
                )
            })?;
        if !output.status.success() {
            bail!(
                "demo renderer exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let video_path = self.video_dir.join(format!("{id}.mp4"));
        if !video_path.exists() {
            bail!(
                "demo renderer finished without producing {}",
                video_path.display()
            );
        }
        Ok(video_path)
    }
}

/// Extracts the `dm_6N` extension from a demo URL or filename, ignoring any
/// query string or fragment.
fn demo_extension(demo_url: &str) -> Option<String> {
    DEMO_EXTENSION
        .captures(demo_url)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_taken_from_the_url_path() {
        assert_eq!(demo_extension("sdf.dm_62").as_deref(), Some("dm_62"));
        assert_eq!(
            demo_extension("https://cdn.example/runs/run.dm_68?ex=abc").as_deref(),
            Some("dm_68")
        );
        assert_eq!(demo_extension("https://cdn.example/readme.txt"), None);
        assert_eq!(demo_extension("archive.dm_68.zip"), None);
    }
}
