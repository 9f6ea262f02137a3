//! Engine startup configuration
//!
//! ```yaml
//! log_filter: cellrules=debug
//! cleanup_on_stop: true
//! devices:
//!   heater: !include devices/heater.yaml
//! ```

use cellrules_core::VirtualDeviceDef;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;

/// Top-level configuration of the `cellrules` service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `tracing` filter directive used when `RUST_LOG` is not set
    #[serde(default)]
    pub log_filter: Option<String>,

    /// Undo every script's definitions when the engine stops
    #[serde(default)]
    pub cleanup_on_stop: bool,

    /// Local devices defined at startup, keyed by device name
    #[serde(default)]
    pub devices: IndexMap<String, VirtualDeviceDef>,
}

impl EngineConfig {
    /// Load the configuration file at `path`
    ///
    /// Includes are resolved relative to the file's directory.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let yaml = YamlLoader::new(config_dir).load_file(path)?;
        let config = Self::from_yaml(yaml)?;
        debug!(
            path = %path.display(),
            devices = config.devices.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse an already tag-processed YAML value
    ///
    /// An empty document yields the defaults.
    pub fn from_yaml(yaml: Value) -> ConfigResult<Self> {
        let yaml = match yaml {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(_) => yaml,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "root".to_string(),
                    reason: "configuration must be a mapping".to_string(),
                })
            }
        };

        let config: EngineConfig =
            serde_yaml::from_value(yaml).map_err(|e| ConfigError::InvalidValue {
                key: "root".to_string(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every device descriptor
    pub fn validate(&self) -> ConfigResult<()> {
        for (name, def) in &self.devices {
            if name.is_empty() || name.contains('/') {
                return Err(ConfigError::InvalidValue {
                    key: format!("devices.{}", name),
                    reason: "device name must be non-empty and must not contain '/'".to_string(),
                });
            }
            def.validate(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrules_core::{CellValue, DefinitionError};
    use std::fs;
    use tempfile::TempDir;

    fn parse(yaml: &str) -> ConfigResult<EngineConfig> {
        EngineConfig::from_yaml(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(!config.cleanup_on_stop);
        assert!(config.log_filter.is_none());
    }

    #[test]
    fn test_parse_devices() {
        let config = parse(
            r#"
log_filter: debug
cleanup_on_stop: true
devices:
  heater:
    title: Heater
    cells:
      enabled: { type: switch, value: false }
      setpoint: { type: range, value: 20, max: 40 }
      reset: { type: pushbutton }
"#,
        )
        .unwrap();

        assert_eq!(config.log_filter.as_deref(), Some("debug"));
        assert!(config.cleanup_on_stop);
        let heater = &config.devices["heater"];
        assert_eq!(heater.title.as_deref(), Some("Heater"));
        let cells: Vec<&str> = heater.cells.keys().map(String::as_str).collect();
        assert_eq!(cells, vec!["enabled", "setpoint", "reset"]);
        assert_eq!(heater.cells["setpoint"].value, Some(CellValue::Number(20.0)));
        assert_eq!(heater.cells["setpoint"].max, Some(40.0));
    }

    #[test]
    fn test_invalid_device_is_rejected() {
        let err = parse(
            r#"
devices:
  heater:
    cells:
      enabled: { type: switch }
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDevice(DefinitionError::MissingValue { .. })
        ));
    }

    #[test]
    fn test_device_name_with_slash_is_rejected() {
        let err = parse(
            r#"
devices:
  "a/b":
    cells:
      c: { type: text, value: x }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_non_mapping_root() {
        assert!(parse("- a\n- b\n").is_err());
    }

    #[test]
    fn test_load_with_include() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("devices")).unwrap();
        fs::write(
            dir.path().join("devices/lamp.yaml"),
            "title: Lamp\ncells:\n  on: { type: switch, value: true }\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("cellrules.yaml"),
            "devices:\n  lamp: !include devices/lamp.yaml\n",
        )
        .unwrap();

        let config = EngineConfig::load(dir.path().join("cellrules.yaml")).unwrap();
        assert_eq!(
            config.devices["lamp"].cells["on"].value,
            Some(CellValue::Bool(true))
        );
    }
}
