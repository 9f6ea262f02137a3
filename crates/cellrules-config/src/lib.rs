//! YAML configuration loading for the cell rule engine
//!
//! This crate loads the service configuration ([`EngineConfig`]) with
//! support for two custom tags:
//!
//! - `!include path` - Include another YAML file
//! - `!env_var VAR [default]` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use cellrules_config::EngineConfig;
//!
//! let config = EngineConfig::load("/etc/cellrules/cellrules.yaml")?;
//! for (name, def) in &config.devices {
//!     println!("{}: {} cells", name, def.cells.len());
//! }
//! ```

mod engine_config;
mod error;
mod loader;

pub use engine_config::EngineConfig;
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, YamlLoader};

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
