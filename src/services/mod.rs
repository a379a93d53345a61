//! Clients for the remote services the pipeline depends on.

pub mod cloudconvert;
pub mod gemini;
pub mod pubsub;
pub mod speech;
pub mod transcoder;
pub mod video_intelligence;

use serde_json::{Map, Value};

/// 12-character fingerprint of a normalised job config, used to deduplicate
/// remote jobs. The map serialises with sorted keys, which makes the JSON
/// form canonical.
pub fn config_hash(config: &Map<String, Value>) -> String {
    let canonical = serde_json::to_string(config).unwrap_or_default();
    let digest = md5::compute(canonical.as_bytes());
    format!("{digest:x}")[..12].to_string()
}
