pub mod config;
pub mod facts;
pub mod manifest;
pub mod types;

pub use config::{AgentConfig, ConfigError};
pub use facts::HostFacts;
pub use manifest::{AppType, Manifest, ManifestError, MANIFEST_FILENAME};
pub use types::*;
