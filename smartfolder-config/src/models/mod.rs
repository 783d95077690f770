pub mod agent;

pub use agent::{AgentConfig, ConfigSource};
