//! Resolve the agent configuration from the environment, an optional `.env`
//! file and well-known config file locations.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tracing::debug;

use crate::models::{AgentConfig, ConfigSource};

pub const CONFIG_PATH_ENV: &str = "SMARTFOLDER_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "SMARTFOLDER_CONFIG_JSON";
pub const API_KEY_ENV: &str = "SMARTFOLDER_API_KEY";

const CANDIDATES: &[&str] = &[
    "smartfolder.toml",
    "smartfolder.json",
    "config/smartfolder.toml",
    "config/smartfolder.json",
];

/// Outcome of a load: the configuration plus where each part came from.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: AgentConfig,
    pub source: ConfigSource,
    pub env_file_loaded: bool,
    pub api_key_from_env: bool,
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Configuration resolver.
///
/// Evaluation order:
/// 1) `$SMARTFOLDER_CONFIG_PATH` (TOML or JSON file),
/// 2) `$SMARTFOLDER_CONFIG_JSON` (inline JSON),
/// 3) the first existing candidate file under the base directory,
/// 4) defaults.
///
/// `$SMARTFOLDER_API_KEY` then replaces the key from whichever source won.
/// Variables are read from the process environment first and from the
/// `.env` file in the base directory second.
pub struct ConfigLoader {
    base_dir: PathBuf,
    env: EnvLookup,
    read_env_file: bool,
}

impl fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("base_dir", &self.base_dir)
            .field("read_env_file", &self.read_env_file)
            .finish()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            env: Box::new(|key| std::env::var(key).ok()),
            read_env_file: true,
        }
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Replace the process environment, mainly for tests.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    pub fn with_env_file(mut self, enabled: bool) -> Self {
        self.read_env_file = enabled;
        self
    }

    pub fn load(&self) -> anyhow::Result<ConfigLoad> {
        let env_file = if self.read_env_file {
            self.read_env_file()?
        } else {
            None
        };
        let env_file_loaded = env_file.is_some();
        let env_file = env_file.unwrap_or_default();

        let var = |key: &str| -> Option<String> {
            (self.env)(key)
                .or_else(|| env_file.get(key).cloned())
                .filter(|value| !value.trim().is_empty())
        };

        let (mut config, source) = if let Some(raw) = var(CONFIG_PATH_ENV) {
            let path = self.resolve(Path::new(raw.trim()));
            let config = AgentConfig::load_from_file(&path)?;
            (config, ConfigSource::EnvPath(path))
        } else if let Some(raw) = var(CONFIG_JSON_ENV) {
            let config = AgentConfig::parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            (config, ConfigSource::EnvInline)
        } else if let Some(path) = self.find_default_file() {
            let config = AgentConfig::load_from_file(&path)?;
            (config, ConfigSource::File(path))
        } else {
            (AgentConfig::default(), ConfigSource::Default)
        };

        let api_key_from_env = match var(API_KEY_ENV) {
            Some(key) => {
                config.api_key = key.trim().to_string();
                true
            }
            None => false,
        };

        config.validate()?;
        debug!(source = %source, env_file_loaded, api_key_from_env, "configuration loaded");

        Ok(ConfigLoad {
            config,
            source,
            env_file_loaded,
            api_key_from_env,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn read_env_file(&self) -> anyhow::Result<Option<HashMap<String, String>>> {
        let path = self.base_dir.join(".env");
        if !path.exists() {
            return Ok(None);
        }

        let mut map = HashMap::new();
        for entry in dotenvy::from_path_iter(&path)
            .with_context(|| format!("failed to open {}", path.display()))?
        {
            let (key, value) =
                entry.with_context(|| format!("invalid entry in {}", path.display()))?;
            map.insert(key, value);
        }
        Ok(Some(map))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        CANDIDATES
            .iter()
            .map(|candidate| self.base_dir.join(candidate))
            .find(|path| path.exists())
    }
}

impl AgentConfig {
    /// Load configuration using the process environment and the current
    /// directory.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        let load = ConfigLoader::new().load()?;
        Ok((load.config, load.source))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read agent config from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid agent config {}", path.display())),
            Some("toml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid agent config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        // Try TOML first, then JSON.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse agent config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid agent config json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_and_json_share_one_shape() {
        let from_toml = AgentConfig::parse_from_str(
            r#"
api_key = "abc"
roots = ["/srv/inbox"]

[pipeline]
upload_interval_ms = 1000
"#,
            "inline",
        )
        .unwrap();
        let from_json = AgentConfig::parse_from_str(
            r#"{"api_key":"abc","roots":["/srv/inbox"],"pipeline":{"upload_interval_ms":1000}}"#,
            "inline",
        )
        .unwrap();

        for config in [from_toml, from_json] {
            assert_eq!(config.api_key, "abc");
            assert_eq!(config.roots, vec![PathBuf::from("/srv/inbox")]);
            assert_eq!(config.pipeline.upload_interval_ms, 1000);
            assert_eq!(config.pipeline.download_interval_ms, 5000);
            assert!(!config.auto_scan_devices);
        }
    }

    #[test]
    fn garbage_reports_both_parsers() {
        let err = AgentConfig::parse_from_str("[[[", "broken").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("toml error"));
        assert!(message.contains("json error"));
    }
}
