//! Settings for Tether hosts, persisted as `config.ron`.
//!
//! Every section is `#[serde(default)]`, so files written by older builds
//! keep loading and unknown fields are ignored. Command-line flags from
//! [`CliArgs`] override selected values after loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, EventsConfig, NetworkConfig, ReassemblyConfig, StateBagConfig,
    SyncConfig, SyncMode, default_config_dir,
};
pub use error::ConfigError;
