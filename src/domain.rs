//! Core pipeline data types: per-item metadata, queue submissions and the
//! typed failure taxonomy shared by both queue variants.

use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use serde_json::Value;
use thiserror::Error;

use crate::uploader::VideoUploadError;

/// Context that travels with one demo through the whole pipeline so the final
/// video URL can be attributed back to the originating chat message.
///
/// On the wire this is the historical positional sequence
/// `[in_channel, message_id, title, description, rerendering_round, demo_url,
/// has_unknown, filename]`. Reads accept every legacy short form (a bare
/// channel string, a two-element list, a six-element list); writes always
/// emit the full current form.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemMeta {
    /// Stable textual name (`"{guild}--{channel}"`) of the origin channel.
    pub in_channel: Option<String>,
    /// Origin message id; absent on legacy items.
    pub message_id: Option<u64>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// None on the first attempt; incremented each time an oversize render
    /// was restarted at lower quality.
    pub rerendering_round: Option<u32>,
    pub demo_url: Option<String>,
    /// At least one metadata field was missing at analysis time.
    pub has_unknown: bool,
    /// Sanitized local basename assigned by the mover; the dedup key in the
    /// rendered-video registry.
    pub filename: String,
}

impl ItemMeta {
    /// A metadata record with nothing known about its origin. Legacy items
    /// without a filename get a fresh one so they can still key the registry.
    pub fn unknown() -> Self {
        Self {
            in_channel: None,
            message_id: None,
            title: None,
            description: None,
            rerendering_round: None,
            demo_url: None,
            has_unknown: false,
            filename: fresh_filename(),
        }
    }

    pub fn to_wire(&self) -> Value {
        Value::Array(vec![
            opt_str_value(&self.in_channel),
            self.message_id.map_or(Value::Null, |v| v.into()),
            opt_str_value(&self.title),
            opt_str_value(&self.description),
            self.rerendering_round.map_or(Value::Null, |v| v.into()),
            opt_str_value(&self.demo_url),
            Value::Bool(self.has_unknown),
            Value::String(self.filename.clone()),
        ])
    }

    pub fn from_wire(raw: &Value) -> Result<Self, String> {
        match raw {
            Value::Array(items) => {
                if items.len() < 2 {
                    return Err(format!("metadata sequence too short: {raw}"));
                }
                let in_channel = opt_string(&items[0])?;
                let message_id = opt_u64(&items[1])?;
                let rest = &items[2..];
                if rest.is_empty() {
                    return Ok(Self {
                        in_channel,
                        message_id,
                        ..Self::unknown()
                    });
                }
                if rest.len() < 4 {
                    return Err(format!("unexpected metadata sequence: {raw}"));
                }
                let title = opt_string(&rest[0])?;
                let description = opt_string(&rest[1])?;
                let rerendering_round = opt_u64(&rest[2])?.map(|v| v as u32);
                let demo_url = opt_string(&rest[3])?;
                let rest2 = &rest[4..];
                let (has_unknown, filename) = if rest2.is_empty() {
                    (false, fresh_filename())
                } else if rest2.len() >= 2 {
                    (
                        rest2[0]
                            .as_bool()
                            .ok_or_else(|| format!("expected bool, got {}", rest2[0]))?,
                        rest2[1]
                            .as_str()
                            .ok_or_else(|| format!("expected string, got {}", rest2[1]))?
                            .to_string(),
                    )
                } else {
                    return Err(format!("unexpected metadata sequence: {raw}"));
                };
                Ok(Self {
                    in_channel,
                    message_id,
                    title,
                    description,
                    rerendering_round,
                    demo_url,
                    has_unknown,
                    filename,
                })
            }
            Value::String(s) => Ok(Self {
                in_channel: Some(s.clone()),
                ..Self::unknown()
            }),
            Value::Null => Ok(Self::unknown()),
            other => Err(format!("unexpected metadata payload: {other}")),
        }
    }
}

impl Serialize for ItemMeta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ItemMeta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_wire(&value).map_err(serde::de::Error::custom)
    }
}

fn fresh_filename() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn opt_str_value(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

fn opt_string(value: &Value) -> Result<Option<String>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(format!("expected string or null, got {other}")),
    }
}

fn opt_u64(value: &Value) -> Result<Option<u64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("expected unsigned integer, got {n}")),
        other => Err(format!("expected integer or null, got {other}")),
    }
}

/// One pipeline input: a demo to render plus everything needed to title and
/// attribute the resulting video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub demo_url: String,
    pub resolution: u32,
    pub title: String,
    pub description: String,
    pub meta: ItemMeta,
}

/// Everything a pipeline stage can report to the failure fan-out.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The remote rendering provider refused admission; back-pressure into
    /// the local overflow queue.
    #[error("upload queue is full")]
    QueueFull,
    /// The remote provider reported a duplicate submission. Dropped, never
    /// retried; deduplication is delegated to the remote side.
    #[error("render job was probably already submitted: {url}")]
    AlreadySubmitted { url: String },
    /// The video uploader failed but may have left a playable artifact.
    #[error(transparent)]
    VideoUpload(#[from] VideoUploadError),
    #[error("demo analysis failed: {0}")]
    Analyzer(String),
    #[error("demo rendering failed: {0}")]
    Renderer(String),
    #[error("remote render service transport error: {0}")]
    Transport(String),
    #[error("remote render service error: {0}")]
    Remote(String),
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    pub fn other(err: anyhow::Error) -> Self {
        Self::Other(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn full_meta() -> ItemMeta {
        ItemMeta {
            in_channel: Some("guild--demos".to_string()),
            message_id: Some(42),
            title: Some("DeFRaG: foo 12.345 VQ3 cpm22".to_string()),
            description: Some("line1\nline2".to_string()),
            rerendering_round: Some(1),
            demo_url: Some("https://cdn.example/demo.dm_68".to_string()),
            has_unknown: true,
            filename: "demo.dm_68".to_string(),
        }
    }

    #[test]
    fn current_form_round_trips_exactly() {
        let meta = full_meta();
        let wire = serde_json::to_value(&meta).expect("serialize");
        assert_eq!(
            wire,
            json!([
                "guild--demos",
                42,
                "DeFRaG: foo 12.345 VQ3 cpm22",
                "line1\nline2",
                1,
                "https://cdn.example/demo.dm_68",
                true,
                "demo.dm_68"
            ])
        );
        let decoded: ItemMeta = serde_json::from_value(wire).expect("deserialize");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn legacy_bare_channel_string_is_accepted() {
        let decoded: ItemMeta = serde_json::from_value(json!("guild--demos")).expect("decode");
        assert_eq!(decoded.in_channel.as_deref(), Some("guild--demos"));
        assert_eq!(decoded.message_id, None);
        assert!(!decoded.has_unknown);
        assert!(!decoded.filename.is_empty());
    }

    #[test]
    fn legacy_two_element_form_gets_generated_filename() {
        let decoded: ItemMeta =
            serde_json::from_value(json!(["guild--demos", 7])).expect("decode");
        assert_eq!(decoded.in_channel.as_deref(), Some("guild--demos"));
        assert_eq!(decoded.message_id, Some(7));
        assert_eq!(decoded.title, None);
        assert!(!decoded.filename.is_empty());
    }

    #[test]
    fn legacy_six_element_form_defaults_the_tail() {
        let decoded: ItemMeta = serde_json::from_value(json!([
            "guild--demos",
            7,
            "title",
            "description",
            null,
            "https://cdn.example/demo.dm_68"
        ]))
        .expect("decode");
        assert_eq!(decoded.title.as_deref(), Some("title"));
        assert_eq!(decoded.rerendering_round, None);
        assert!(!decoded.has_unknown);
        assert!(!decoded.filename.is_empty());
    }

    #[test]
    fn null_payload_means_nothing_known() {
        let decoded: ItemMeta = serde_json::from_value(Value::Null).expect("decode");
        assert_eq!(decoded.in_channel, None);
        assert_eq!(decoded.message_id, None);
        assert!(!decoded.filename.is_empty());
    }

    #[test]
    fn malformed_sequences_are_rejected() {
        assert!(serde_json::from_value::<ItemMeta>(json!(["only-channel"])).is_err());
        assert!(serde_json::from_value::<ItemMeta>(json!(["c", 1, "title"])).is_err());
        assert!(serde_json::from_value::<ItemMeta>(json!(12)).is_err());
    }

    #[test]
    fn metadata_nests_inside_larger_state_structures() {
        let metas = vec![full_meta(), ItemMeta::unknown()];
        let wire = serde_json::to_string(&metas).expect("serialize vec");
        let decoded: Vec<ItemMeta> = serde_json::from_str(&wire).expect("deserialize vec");
        assert_eq!(decoded[0], metas[0]);
        assert_eq!(decoded[1].filename, metas[1].filename);
    }
}
