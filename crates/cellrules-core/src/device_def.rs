//! Descriptors for local ("virtual") devices

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CellValue, ControlType};

/// Max used for range cells that do not declare one
pub const DEFAULT_CELL_MAX: f64 = 255.0;

/// Error type for malformed device descriptors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionError {
    #[error("device {0} doesn't have any cells")]
    NoCells(String),

    #[error("{device}/{cell}: no control type")]
    NoControlType { device: String, cell: String },

    #[error("{device}/{cell}: control value required for control type {control_type}")]
    MissingValue {
        device: String,
        cell: String,
        control_type: String,
    },

    #[error("{device}/{cell}: invalid max value {max}")]
    InvalidMax { device: String, cell: String, max: f64 },
}

/// Definition of one cell of a local device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellDef {
    #[serde(rename = "type")]
    pub control_type: ControlType,

    /// Initial value, required for every type except pushbutton
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<CellValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
}

impl CellDef {
    pub fn new(control_type: impl Into<ControlType>, value: impl Into<CellValue>) -> Self {
        Self {
            control_type: control_type.into(),
            value: Some(value.into()),
            max: None,
            readonly: None,
            order: None,
        }
    }

    /// A pushbutton cell; buttons carry no initial value
    pub fn button() -> Self {
        Self {
            control_type: ControlType::new(ControlType::PUSHBUTTON),
            value: None,
            max: None,
            readonly: None,
            order: None,
        }
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = Some(readonly);
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }

    /// Effective readonly flag
    ///
    /// Switches, pushbuttons, ranges and rgb cells are writable unless stated
    /// otherwise; every other type is readonly by default.
    pub fn is_readonly(&self) -> bool {
        self.readonly.unwrap_or_else(|| {
            !matches!(
                self.control_type.as_str(),
                "switch" | "pushbutton" | "range" | "rgb"
            )
        })
    }

    /// Check the definition of cell `cell` of `device`
    pub fn validate(&self, device: &str, cell: &str) -> Result<(), DefinitionError> {
        if self.control_type.as_str().is_empty() {
            return Err(DefinitionError::NoControlType {
                device: device.to_string(),
                cell: cell.to_string(),
            });
        }
        if self.value.is_none() && self.control_type.as_str() != ControlType::PUSHBUTTON {
            return Err(DefinitionError::MissingValue {
                device: device.to_string(),
                cell: cell.to_string(),
                control_type: self.control_type.to_string(),
            });
        }
        if let Some(max) = self.max {
            if !max.is_finite() || max < 0.0 {
                return Err(DefinitionError::InvalidMax {
                    device: device.to_string(),
                    cell: cell.to_string(),
                    max,
                });
            }
        }
        Ok(())
    }

    /// Effective max, only meaningful for range cells
    pub fn effective_max(&self) -> Option<f64> {
        if self.control_type.has_max() {
            Some(self.max.unwrap_or(DEFAULT_CELL_MAX))
        } else {
            self.max
        }
    }
}

/// Definition of a local device: a title plus its cells
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualDeviceDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default)]
    pub cells: IndexMap<String, CellDef>,
}

impl VirtualDeviceDef {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            cells: IndexMap::new(),
        }
    }

    /// Add a cell definition (builder style)
    pub fn cell(mut self, name: impl Into<String>, def: CellDef) -> Self {
        self.cells.insert(name.into(), def);
        self
    }

    /// Check the descriptor for the given device name
    pub fn validate(&self, device: &str) -> Result<(), DefinitionError> {
        if self.cells.is_empty() {
            return Err(DefinitionError::NoCells(device.to_string()));
        }

        for (name, def) in &self.cells {
            def.validate(device, name)?;
        }

        Ok(())
    }
}
