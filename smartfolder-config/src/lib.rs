//! Configuration for the SmartFolder agent.
//!
//! The agent only reads its settings. [`ConfigLoader`] resolves them from
//! environment variables, an optional `.env` file and well-known file
//! locations, in TOML or JSON.

pub mod loader;
pub mod models;

pub use loader::{API_KEY_ENV, CONFIG_JSON_ENV, CONFIG_PATH_ENV, ConfigLoad, ConfigLoader};
pub use models::{AgentConfig, ConfigSource};
