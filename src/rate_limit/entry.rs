//! Per-key window record and its stored form.

use serde::{Deserialize, Serialize};

/// Counting record for one rate-limit key.
///
/// `expires_at == 0` marks an entry that has not started a window yet; that is what a
/// missing (or unreadable) record decodes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    /// Hits counted in the active window.
    #[serde(rename = "cur")]
    pub current_hits: u32,
    /// Hits counted in the window before it (sliding window only).
    #[serde(rename = "prev", default)]
    pub previous_hits: u32,
    /// End of the active window, seconds since the Unix epoch.
    #[serde(rename = "exp")]
    pub expires_at: u32,
}

impl WindowEntry {
    /// True until the first request for the key opens a window.
    pub fn is_uninitialized(&self) -> bool {
        self.expires_at == 0
    }

    /// Whole seconds until the active window ends, as seen at `now`.
    pub fn reset_in(&self, now: u32) -> u32 {
        self.expires_at.saturating_sub(now)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
