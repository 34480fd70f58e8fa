//! Media pipeline and A/V sync engine
//!
//! Producers (backends) demux sources into per-kind queues of a media pipe;
//! audio and video outputs consume them, with video paced against the
//! audio clock.

pub mod audio;
pub mod backend;
pub mod config;
pub mod event;
pub mod logging;
pub mod media;
pub mod producer;
pub mod props;
pub mod sync;
pub mod video;

pub use config::Config;
pub use event::Event;
pub use media::{MediaPipe, MediaService};

/// Result type for the application
pub type Result<T> = anyhow::Result<T>;
