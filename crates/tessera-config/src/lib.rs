//! Configuration for the tessera session engine.
//!
//! Provides TOML-based configuration with:
//! - Registry defaults, id generation and session limits (`[session]`)
//! - Swap, backup and capacity thresholds (`[persistence]`)
//! - File or SQLite store selection (`[store]`)
//! - Config file layering (XDG user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
