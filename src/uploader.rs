//! Adapter around the external video-upload binary.

use std::path::{
    Path,
    PathBuf,
};
use std::process::Command;

use thiserror::Error;

/// Marker the uploader prints before echoing the hosting platform's error
/// response on stdout.
const REQUEST_ERROR_MARKER: &str = "[RequestError] Server response:";

/// Upload failure. The produced video file rides along so the completion
/// reactor can fall back to posting it into chat directly.
#[derive(Debug, Error)]
pub enum VideoUploadError {
    /// The hosting platform rejected the upload with a structured response.
    #[error("video upload rejected by the platform: {response}")]
    Rejected {
        response: serde_json::Value,
        video_file: PathBuf,
    },
    /// The uploader exited non-zero without a parseable platform response.
    #[error("video uploader exited with {code:?}: {stderr_tail}")]
    Process {
        code: Option<i32>,
        stderr_tail: String,
        video_file: PathBuf,
    },
    /// The uploader could not be spawned at all.
    #[error("failed to run video uploader: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
        video_file: PathBuf,
    },
}

impl VideoUploadError {
    /// Path of the rendered video this failure left behind.
    pub fn video_file(&self) -> &Path {
        match self {
            Self::Rejected { video_file, .. }
            | Self::Process { video_file, .. }
            | Self::Spawn { video_file, .. } => video_file,
        }
    }
}

/// Pushes a rendered video to the hosting platform, returning its public URL.
pub trait RenderedVideoUploader: Send + Sync {
    fn upload(
        &self,
        title: &str,
        description: &str,
        video_file: &Path,
    ) -> Result<String, VideoUploadError>;
}

/// Production uploader: `<exe> <static args…> --description=… --title=… --
/// <file>`. On success the last stdout line is the platform identifier.
#[derive(Debug, Clone)]
pub struct ExternalVideoUploader {
    executable: PathBuf,
    static_args: Vec<String>,
}

impl ExternalVideoUploader {
    pub fn new(executable: impl Into<PathBuf>, static_args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            static_args,
        }
    }
}

impl RenderedVideoUploader for ExternalVideoUploader {
    fn upload(
        &self,
        title: &str,
        description: &str,
        video_file: &Path,
    ) -> Result<String, VideoUploadError> {
        let output = Command::new(&self.executable)
            .args(&self.static_args)
            .arg(format!("--description={description}"))
            .arg(format!("--title={title}"))
            .arg("--")
            .arg(video_file)
            .output()
            .map_err(|source| VideoUploadError::Spawn {
                source,
                video_file: video_file.to_path_buf(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            let id = stdout
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or_default();
            if id.is_empty() {
                return Err(VideoUploadError::Process {
                    code: output.status.code(),
                    stderr_tail: "uploader produced no video identifier".to_string(),
                    video_file: video_file.to_path_buf(),
                });
            }
            return Ok(format!("https://youtu.be/{id}"));
        }

        if let Some(pos) = stdout.find(REQUEST_ERROR_MARKER) {
            let payload = stdout[pos + REQUEST_ERROR_MARKER.len()..].trim();
            if let Ok(response) = serde_json::from_str(payload) {
                return Err(VideoUploadError::Rejected {
                    response,
                    video_file: video_file.to_path_buf(),
                });
            }
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(VideoUploadError::Process {
            code: output.status.code(),
            stderr_tail: tail(&stderr, 1024),
            video_file: video_file.to_path_buf(),
        })
    }
}

fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
