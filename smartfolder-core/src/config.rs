use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::remote::metascan::DEFAULT_BASE_URL;

/// Knobs that tune the pipeline's background loops and remote client.
///
/// All fields carry defaults so a configuration file only needs to name the
/// values it changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sleep between upload sweeps (milliseconds).
    pub upload_interval_ms: u64,
    /// Sleep between download (poll) sweeps (milliseconds).
    pub download_interval_ms: u64,
    /// Cadence of the removable device check (milliseconds).
    pub device_poll_interval_ms: u64,
    /// Endpoint of the remote file API.
    pub service_base_url: String,
    /// Per-request timeout for remote calls (seconds). `0` disables it.
    pub request_timeout_secs: u64,
    /// Capacity of the in-process event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_interval_ms: 5_000,
            download_interval_ms: 5_000,
            device_poll_interval_ms: 5_000,
            service_base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 120,
            event_channel_capacity: 1_024,
        }
    }
}

impl PipelineConfig {
    pub fn upload_interval(&self) -> Duration {
        Duration::from_millis(self.upload_interval_ms)
    }

    pub fn download_interval(&self) -> Duration {
        Duration::from_millis(self.download_interval_ms)
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_millis(self.device_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("upload_interval_ms", self.upload_interval_ms),
            ("download_interval_ms", self.download_interval_ms),
            ("device_poll_interval_ms", self.device_poll_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ScanError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.service_base_url.trim().is_empty() {
            return Err(ScanError::InvalidConfig(
                "service_base_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_five_second_sweeps() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.upload_interval(), Duration::from_secs(5));
        assert_eq!(cfg.download_interval(), Duration::from_secs(5));
        assert_eq!(cfg.request_timeout(), Some(Duration::from_secs(120)));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"upload_interval_ms": 250, "request_timeout_secs": 0}"#)
                .unwrap();
        assert_eq!(cfg.upload_interval(), Duration::from_millis(250));
        assert_eq!(cfg.download_interval_ms, 5_000);
        assert_eq!(cfg.request_timeout(), None);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let cfg = PipelineConfig {
            download_interval_ms: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ScanError::InvalidConfig(_))));
    }
}
