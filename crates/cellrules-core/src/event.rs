//! Change notifications posted by the cell model

use serde::{Deserialize, Serialize};

use crate::CellSpec;

/// A change of one cell, or of a device as a whole
///
/// An empty `cell` denotes a device-level change such as a new title or a
/// (re)definition of the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub device: String,
    pub cell: String,
}

impl ChangeEvent {
    /// Change of a single cell
    pub fn cell(device: impl Into<String>, cell: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            cell: cell.into(),
        }
    }

    /// Change of the device itself
    pub fn device(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            cell: String::new(),
        }
    }

    pub fn is_device_level(&self) -> bool {
        self.cell.is_empty()
    }

    /// Address of the changed cell, `None` for device-level changes
    pub fn cell_spec(&self) -> Option<CellSpec> {
        if self.is_device_level() {
            return None;
        }
        CellSpec::new(self.device.clone(), self.cell.clone()).ok()
    }
}
