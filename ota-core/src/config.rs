/// Update engine settings, stored under the `update` key of `/settings.json`
use serde::{Deserialize, Serialize};

const MIN_CHUNK_BYTES: usize = 256;
const MAX_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdateConfig {
    /// Releases manifest (`releases.json`); no URL means update checks are disabled
    pub manifest_url: Option<String>,
    pub check_interval_hours: u32,
    pub initial_check_delay_secs: u64,

    // Work done between cooperative yields
    pub download_chunk_bytes: usize,
    pub checksum_chunk_bytes: usize,

    pub reboot_delay_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            manifest_url: None,
            check_interval_hours: 24,
            initial_check_delay_secs: 60,
            download_chunk_bytes: 2048,
            checksum_chunk_bytes: 2048,
            reboot_delay_secs: 2,
        }
    }
}

impl UpdateConfig {
    /// Clamp values a hand-edited settings file could get wrong
    pub fn sanitized(mut self) -> Self {
        self.download_chunk_bytes = self.download_chunk_bytes.clamp(MIN_CHUNK_BYTES, MAX_CHUNK_BYTES);
        self.checksum_chunk_bytes = self.checksum_chunk_bytes.clamp(MIN_CHUNK_BYTES, MAX_CHUNK_BYTES);
        if self.check_interval_hours == 0 {
            log::warn!("check_interval_hours of 0 is not allowed, using 24");
            self.check_interval_hours = 24;
        }
        if let Some(url) = &self.manifest_url {
            if url.trim().is_empty() {
                self.manifest_url = None;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: UpdateConfig =
            serde_json::from_str(r#"{"manifest_url": "https://example.com/releases.json"}"#).unwrap();
        assert_eq!(config.check_interval_hours, 24);
        assert_eq!(config.download_chunk_bytes, 2048);
        assert_eq!(config.manifest_url.as_deref(), Some("https://example.com/releases.json"));
    }

    #[test]
    fn test_sanitize_clamps_chunks() {
        let config = UpdateConfig {
            download_chunk_bytes: 1,
            checksum_chunk_bytes: 1 << 20,
            check_interval_hours: 0,
            manifest_url: Some("  ".into()),
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.download_chunk_bytes, MIN_CHUNK_BYTES);
        assert_eq!(config.checksum_chunk_bytes, MAX_CHUNK_BYTES);
        assert_eq!(config.check_interval_hours, 24);
        assert!(config.manifest_url.is_none());
    }
}
