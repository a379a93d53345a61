//! Rotating Gemini API key provider.
//!
//! Holds the ordered key list behind one lock and advances round-robin when a
//! call reports quota exhaustion (HTTP 429 / RESOURCE_EXHAUSTED). One instance
//! per process, shared by every worker slot.

use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::error::AppError;

#[derive(Debug, Default)]
struct RotatorState {
    keys: Vec<String>,
    index: usize,
    initialized: bool,
}

/// Process-wide holder of Gemini API keys with round-robin rotation.
#[derive(Debug, Default)]
pub struct KeyRotator {
    state: Mutex<RotatorState>,
}

impl KeyRotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialise from a comma-separated key list. Blank entries are dropped,
    /// order is preserved. Safe to call multiple times.
    pub fn init(&self, raw: Option<&str>) {
        let keys: Vec<String> = raw
            .unwrap_or_default()
            .split(',')
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|k| k.to_string())
            .collect();

        let mut state = self.state.lock().expect("key rotator lock poisoned");
        state.keys = keys;
        state.index = 0;
        state.initialized = true;

        match state.keys.len() {
            0 => warn!("no Gemini API keys configured"),
            1 => debug!("using a single Gemini API key"),
            n => info!(keys = n, "using multiple Gemini API keys, rotating on 429"),
        }
    }

    /// The current key, or `None` when no keys are configured.
    pub fn current(&self) -> Option<String> {
        let state = self.state.lock().expect("key rotator lock poisoned");
        if state.keys.is_empty() {
            return None;
        }
        Some(state.keys[state.index % state.keys.len()].clone())
    }

    /// Advance to the next key. No-op with fewer than two keys.
    pub fn rotate(&self) {
        let mut state = self.state.lock().expect("key rotator lock poisoned");
        let n = state.keys.len();
        if n > 1 {
            let old = state.index;
            state.index = (state.index + 1) % n;
            info!(from = old, to = state.index, "rotated Gemini API key");
        }
    }

    /// Number of configured keys.
    pub fn count(&self) -> usize {
        self.state.lock().expect("key rotator lock poisoned").keys.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().expect("key rotator lock poisoned").initialized
    }
}

/// Whether an HTTP status code means the quota is exhausted.
pub fn is_quota_exhausted_status(status: u16) -> bool {
    status == 429
}

/// Whether an error indicates Gemini quota exhaustion. Matches the dedicated
/// variant as well as 429 / RESOURCE_EXHAUSTED / QUOTA appearing in the
/// message, case-insensitively.
pub fn is_quota_exhausted(err: &AppError) -> bool {
    if matches!(err, AppError::QuotaExhausted(_)) {
        return true;
    }
    let msg = err.to_string().to_uppercase();
    msg.contains("429") || msg.contains("RESOURCE_EXHAUSTED") || msg.contains("QUOTA")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_drops_blanks_and_preserves_order() {
        let rotator = KeyRotator::new();
        rotator.init(Some("k1, ,k2,,k3 "));
        assert_eq!(rotator.count(), 3);
        assert_eq!(rotator.current().as_deref(), Some("k1"));
        assert!(rotator.is_initialized());
    }

    #[test]
    fn current_is_none_without_keys() {
        let rotator = KeyRotator::new();
        rotator.init(None);
        assert_eq!(rotator.count(), 0);
        assert!(rotator.current().is_none());
        // Rotation on an empty list is a no-op, not a panic.
        rotator.rotate();
    }

    #[test]
    fn rotate_cycles_through_all_keys() {
        let rotator = KeyRotator::new();
        rotator.init(Some("k1,k2,k3"));

        // Stable between rotations.
        assert_eq!(rotator.current().as_deref(), Some("k1"));
        assert_eq!(rotator.current().as_deref(), Some("k1"));

        rotator.rotate();
        assert_eq!(rotator.current().as_deref(), Some("k2"));
        rotator.rotate();
        assert_eq!(rotator.current().as_deref(), Some("k3"));
        // count() rotations bring it back to the start.
        rotator.rotate();
        assert_eq!(rotator.current().as_deref(), Some("k1"));
    }

    #[test]
    fn single_key_never_rotates() {
        let rotator = KeyRotator::new();
        rotator.init(Some("only"));
        rotator.rotate();
        assert_eq!(rotator.current().as_deref(), Some("only"));
    }

    #[test]
    fn reinit_resets_index() {
        let rotator = KeyRotator::new();
        rotator.init(Some("a,b"));
        rotator.rotate();
        assert_eq!(rotator.current().as_deref(), Some("b"));
        rotator.init(Some("a,b"));
        assert_eq!(rotator.current().as_deref(), Some("a"));
    }

    #[test]
    fn quota_detection() {
        assert!(is_quota_exhausted_status(429));
        assert!(!is_quota_exhausted_status(500));

        assert!(is_quota_exhausted(&AppError::Internal(
            "Server returned 429".to_string()
        )));
        assert!(is_quota_exhausted(&AppError::Internal(
            "grpc status RESOURCE_EXHAUSTED".to_string()
        )));
        assert!(is_quota_exhausted(&AppError::Internal(
            "quota exceeded for project".to_string()
        )));
        assert!(is_quota_exhausted(&AppError::QuotaExhausted(
            "rate limited".to_string()
        )));
        assert!(!is_quota_exhausted(&AppError::Internal(
            "HTTP 500 internal error".to_string()
        )));
        assert!(!is_quota_exhausted(&AppError::Backend(
            "connection refused".to_string()
        )));
    }
}
