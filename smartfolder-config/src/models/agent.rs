use std::path::PathBuf;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use smartfolder_core::PipelineConfig;

/// Source that produced the agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => f.write_str("built-in defaults"),
            ConfigSource::EnvPath(path) => write!(f, "{} (SMARTFOLDER_CONFIG_PATH)", path.display()),
            ConfigSource::EnvInline => f.write_str("SMARTFOLDER_CONFIG_JSON"),
            ConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Everything the agent reads at startup. The agent never writes this back.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Key sent with every remote call. Empty means "not configured"; the
    /// pipeline then holds queued work until a key is supplied.
    pub api_key: String,
    /// Directories watched from startup.
    pub roots: Vec<PathBuf>,
    /// Scan removable devices as soon as they appear.
    pub auto_scan_devices: bool,
    /// Mount points checked for newly attached devices.
    pub device_roots: Vec<PathBuf>,
    /// Worker cadence and remote endpoint tuning.
    pub pipeline: PipelineConfig,
}

impl AgentConfig {
    /// Device mount points the monitor should poll; empty when device
    /// scanning is switched off.
    pub fn active_device_roots(&self) -> Vec<PathBuf> {
        if self.auto_scan_devices {
            self.device_roots.clone()
        } else {
            Vec::new()
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.pipeline
            .validate()
            .context("invalid pipeline settings")?;

        if let Some(root) = self
            .roots
            .iter()
            .chain(self.device_roots.iter())
            .find(|root| root.as_os_str().is_empty())
        {
            return Err(anyhow!("empty path in configuration: {root:?}"));
        }

        if self.auto_scan_devices && self.device_roots.is_empty() {
            tracing::warn!("auto_scan_devices is enabled but no device_roots are configured");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_are_only_polled_when_enabled() {
        let mut config = AgentConfig {
            device_roots: vec![PathBuf::from("/media/usb0")],
            ..AgentConfig::default()
        };
        assert!(config.active_device_roots().is_empty());
        config.auto_scan_devices = true;
        assert_eq!(config.active_device_roots(), vec![PathBuf::from("/media/usb0")]);
    }

    #[test]
    fn validation_flags_bad_pipeline_and_empty_paths() {
        let mut config = AgentConfig::default();
        assert!(config.validate().is_ok());

        config.roots.push(PathBuf::new());
        assert!(config.validate().is_err());

        config.roots.clear();
        config.pipeline.upload_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("upload_interval_ms"));
    }
}
