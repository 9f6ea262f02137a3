//! YAML loader with custom tag support
//!
//! Supported tags:
//! - `!include path` - Include another YAML file, relative to the including file
//! - `!env_var VAR [default]` - Environment variable substitution

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// YAML loader resolving `!include` and `!env_var`
pub struct YamlLoader {
    /// Base directory for resolving relative paths
    config_dir: PathBuf,
    /// Files currently being loaded, to detect circular includes
    include_stack: HashSet<PathBuf>,
}

impl YamlLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            include_stack: HashSet::new(),
        }
    }

    /// Load and process a YAML file
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.resolve_path(path.as_ref());
        debug!(path = %path.display(), "Loading YAML file");

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::ReadFile {
            path: path.clone(),
            source: e,
        })?;

        let key = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if !self.include_stack.insert(key.clone()) {
            return Err(ConfigError::CircularInclude { path });
        }
        let result = self.load_string(&content, &path);
        self.include_stack.remove(&key);

        result
    }

    /// Load and process YAML from a string
    ///
    /// Includes inside `content` are resolved relative to `source_path`.
    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })?;

        self.process_value(value, source_path)
    }

    fn process_value(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.process_tagged(*tagged, source_path),
            Value::Mapping(map) => {
                let mut result = serde_yaml::Mapping::new();
                for (k, v) in map {
                    let key = self.process_value(k, source_path)?;
                    let value = self.process_value(v, source_path)?;
                    result.insert(key, value);
                }
                Ok(Value::Mapping(result))
            }
            Value::Sequence(seq) => {
                let result: ConfigResult<Vec<Value>> = seq
                    .into_iter()
                    .map(|v| self.process_value(v, source_path))
                    .collect();
                Ok(Value::Sequence(result?))
            }
            _ => Ok(value),
        }
    }

    fn process_tagged(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, value = ?tagged.value, "Processing tag");

        match tag.as_str() {
            "!include" => {
                let include_path = self.value_to_path(&tagged.value, source_path)?;
                debug!(path = %include_path.display(), "Including file");
                self.load_file(&include_path)
            }
            "!env_var" => process_env_var(tagged.value),
            _ => {
                warn!(tag = %tag, "Unknown YAML tag, keeping value");
                let value = self.process_value(tagged.value, source_path)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag,
                    value,
                })))
            }
        }
    }

    /// Resolve an include path relative to the including file
    fn value_to_path(&self, value: &Value, source_path: &Path) -> ConfigResult<PathBuf> {
        let Value::String(path_str) = value else {
            return Err(ConfigError::InvalidIncludePath {
                path: format!("{:?}", value),
                reason: "path must be a string".to_string(),
            });
        };
        if path_str.trim().is_empty() {
            return Err(ConfigError::InvalidIncludePath {
                path: path_str.clone(),
                reason: "path is empty".to_string(),
            });
        }

        let path = Path::new(path_str.trim());
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let base_dir = source_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(&self.config_dir);
        Ok(base_dir.join(path))
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

/// Substitute `!env_var NAME [default]`
///
/// The variable (or the default) is read as a YAML scalar so that
/// `!env_var CLEANUP false` yields a boolean.
fn process_env_var(value: Value) -> ConfigResult<Value> {
    let Value::String(spec) = value else {
        return Err(ConfigError::InvalidValue {
            key: "!env_var".to_string(),
            reason: "environment variable name must be a string".to_string(),
        });
    };

    let spec = spec.trim();
    let (name, default) = match spec.split_once(char::is_whitespace) {
        Some((name, default)) => (name, Some(default.trim())),
        None => (spec, None),
    };

    let raw = match (std::env::var(name), default) {
        (Ok(value), _) => value,
        (Err(_), Some(default)) => {
            debug!(var = %name, "Environment variable not set, using default");
            default.to_string()
        }
        (Err(_), None) => {
            return Err(ConfigError::EnvVarNotFound {
                var: name.to_string(),
            })
        }
    };

    debug!(var = %name, "Substituted env var");
    Ok(scalar(&raw))
}

fn scalar(raw: &str) -> Value {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

/// Load a YAML file with full tag processing
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir).load_file(file)
}
