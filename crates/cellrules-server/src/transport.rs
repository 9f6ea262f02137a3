//! Transport writing every outbound call to the log
//!
//! Stands in for a message-bus client: nothing leaves the process.

use cellrules_cell_model::{ControlMeta, ScriptUpdate, Transport};
use tracing::{debug, info, trace, Level};

#[derive(Debug, Default)]
pub struct LoggingTransport;

impl Transport for LoggingTransport {
    fn declare_device(&self, device: &str, title: &str) {
        info!(device = %device, title = %title, "Declared device");
    }

    fn publish_control(&self, device: &str, control: &ControlMeta) {
        debug!(
            device = %device,
            cell = %control.name,
            control_type = %control.control_type,
            value = %control.value,
            max = ?control.max,
            readonly = control.readonly,
            error = ?control.error,
            "Published control"
        );
    }

    fn publish_value(&self, device: &str, cell: &str, raw: &str, retained: bool) {
        debug!(device = %device, cell = %cell, value = %raw, retained, "Published value");
    }

    fn remove_device(&self, device: &str) {
        info!(device = %device, "Removed device");
    }

    fn remove_control(&self, device: &str, cell: &str) {
        info!(device = %device, cell = %cell, "Removed control");
    }

    fn send_command(&self, device: &str, cell: &str, raw: &str) {
        info!(device = %device, cell = %cell, value = %raw, "Command to external cell");
    }

    fn script_updated(&self, update: &ScriptUpdate) {
        let update = serde_json::to_string(update).unwrap_or_default();
        info!(update = %update, "Script updated");
    }

    // the engine already wrote the line under `cellrules::rules`
    fn log_message(&self, level: Level, message: &str) {
        trace!(level = %level, message = %message, "Rule log forwarded");
    }
}
