//! Cell address type representing a device/cell pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid cell addresses
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CellSpecError {
    #[error("cell spec must have the form 'device/cell': '{0}'")]
    InvalidFormat(String),

    #[error("device name cannot be empty")]
    EmptyDevice,

    #[error("cell name cannot be empty")]
    EmptyCell,
}

/// Address of a single cell (e.g., "heater/enabled")
///
/// The device part never contains a '/'; everything after the first
/// separator belongs to the cell name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellSpec {
    device: String,
    cell: String,
}

impl CellSpec {
    /// Create a new CellSpec from its device and cell parts
    pub fn new(device: impl Into<String>, cell: impl Into<String>) -> Result<Self, CellSpecError> {
        let device = device.into();
        let cell = cell.into();

        if device.is_empty() {
            return Err(CellSpecError::EmptyDevice);
        }
        if cell.is_empty() {
            return Err(CellSpecError::EmptyCell);
        }

        Ok(Self { device, cell })
    }

    /// Get the device part
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Get the cell part
    pub fn cell(&self) -> &str {
        &self.cell
    }
}

impl FromStr for CellSpec {
    type Err = CellSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((device, cell)) => Self::new(device, cell),
            None => Err(CellSpecError::InvalidFormat(s.to_string())),
        }
    }
}

impl TryFrom<String> for CellSpec {
    type Error = CellSpecError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<&str> for CellSpec {
    type Error = CellSpecError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CellSpec> for String {
    fn from(spec: CellSpec) -> String {
        spec.to_string()
    }
}

impl fmt::Display for CellSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.cell)
    }
}
