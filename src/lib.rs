//! Asset processing service.
//!
//! Ingests media files (video, audio, image), persists them in object
//! storage, and runs a multi-step analysis pipeline over each asset:
//! probing, cloud upload, audio extraction, thumbnails, frame sampling,
//! waveforms, video-intelligence detections, transcoding, image conversion,
//! speech transcription, and multimodal LLM analysis. Pipeline state lives
//! in the document store so clients can observe progress; terminal events
//! are published on a pub/sub topic for downstream consumers.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod keys;
pub mod models;
pub mod pipeline;
pub mod probe;
pub mod services;
pub mod storage;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{AppError, Result};
