//! Outbound hooks towards the transport layer

use cellrules_core::ControlType;
use serde::Serialize;
use tracing::Level;

/// Metadata of one cell as declared to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlMeta {
    pub name: String,
    pub control_type: ControlType,
    pub value: String,
    pub max: Option<f64>,
    pub readonly: bool,
    pub order: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Notification about a reload unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "path", rename_all = "snake_case")]
pub enum ScriptUpdate {
    Changed(String),
    Removed(String),
}

/// Everything the engine tells the outside world
///
/// All methods default to no-ops so an implementation only overrides what
/// it forwards. Implementations are called from the engine's executor and
/// must not block.
pub trait Transport: Send + Sync {
    /// A local device became visible (at model start or on live definition)
    fn declare_device(&self, _device: &str, _title: &str) {}

    /// Metadata plus current value of one local cell
    fn publish_control(&self, _device: &str, _control: &ControlMeta) {}

    /// New value of a local cell; pushbuttons are not retained
    fn publish_value(&self, _device: &str, _cell: &str, _raw: &str, _retained: bool) {}

    /// A local device is gone
    fn remove_device(&self, _device: &str) {}

    /// A cell of a local device is gone
    fn remove_control(&self, _device: &str, _cell: &str) {}

    /// Ask the owner of an external cell to change it
    fn send_command(&self, _device: &str, _cell: &str, _raw: &str) {}

    /// A reload unit was (re)loaded or removed
    fn script_updated(&self, _update: &ScriptUpdate) {}

    /// User-visible rule log line
    fn log_message(&self, _level: Level, _message: &str) {}
}

/// Transport that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

impl Transport for NullTransport {}
