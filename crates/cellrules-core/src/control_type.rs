//! Control types and the value coercion class they select

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coercion class of a cell, derived from its control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    /// Raw value passes through unchanged
    Text,
    /// "1" is true, anything else is false
    Boolean,
    /// Parsed as a float, 0 on parse failure
    Float,
    /// Boolean-valued, never retained, always counts as changed
    Button,
}

/// Control type of a cell (e.g., "switch", "temperature", "pushbutton")
///
/// Unknown control types are accepted and treated as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlType(String);

impl ControlType {
    pub const TEXT: &'static str = "text";
    pub const SWITCH: &'static str = "switch";
    pub const PUSHBUTTON: &'static str = "pushbutton";
    pub const RANGE: &'static str = "range";

    const BOOLEAN_TYPES: &'static [&'static str] = &["switch", "wo-switch", "alarm"];

    const FLOAT_TYPES: &'static [&'static str] = &[
        "temperature",
        "rel_humidity",
        "atmospheric_pressure",
        "rainfall",
        "wind_speed",
        "power",
        "power_consumption",
        "voltage",
        "water_flow",
        "consumption",
        "pressure",
        "range",
    ];

    /// Create a new control type
    pub fn new(control_type: impl Into<String>) -> Self {
        Self(control_type.into())
    }

    /// The default control type of a cell that has not been typed yet
    pub fn text() -> Self {
        Self::new(Self::TEXT)
    }

    /// Get the control type as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Coercion class selected by this control type
    pub fn kind(&self) -> CellKind {
        let s = self.0.as_str();
        if s == Self::PUSHBUTTON {
            CellKind::Button
        } else if Self::BOOLEAN_TYPES.contains(&s) {
            CellKind::Boolean
        } else if Self::FLOAT_TYPES.contains(&s) {
            CellKind::Float
        } else {
            CellKind::Text
        }
    }

    /// Whether values of this type are published as retained messages
    pub fn is_retained(&self) -> bool {
        self.kind() != CellKind::Button
    }

    /// Whether this type uses the numeric max property
    pub fn has_max(&self) -> bool {
        self.0 == Self::RANGE
    }
}

impl Default for ControlType {
    fn default() -> Self {
        Self::text()
    }
}

impl From<&str> for ControlType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ControlType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
