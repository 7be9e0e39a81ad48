//! demoflow — a chat-driven DeFRaG demo pipeline.
//!
//! The daemon watches a set of text channels, durably archives every new
//! message (URLs and attachments), and pushes each fresh demo attachment
//! through a crash-safe rendering pipeline: metadata extraction, video
//! rendering (remote service or local engine), video upload, and an
//! announcement posted back to the origin channel. Restart-safe queues and
//! per-channel savepoints make every step idempotent across crashes.

pub mod analyzer;
pub mod chat;
pub mod domain;
pub mod ingest;
pub mod local_queue;
pub mod mover;
pub mod orchestrator;
pub mod queue;
pub mod reactor;
pub mod registry;
pub mod remote_queue;
pub mod renderer;
pub mod settings;
pub mod single_instance;
pub mod store;
pub(crate) mod sync_ext;
pub mod uploader;
pub mod urls;
