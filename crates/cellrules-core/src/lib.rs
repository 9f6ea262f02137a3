//! Core types for the cell rule engine
//!
//! This crate provides the fundamental types shared by every layer of the
//! engine: cell addresses ([`CellSpec`]), control types ([`ControlType`]),
//! typed cell values ([`CellValue`]), change notifications ([`ChangeEvent`])
//! and the descriptors used to declare local ("virtual") devices.

mod cell_spec;
mod control_type;
mod device_def;
mod event;
mod value;

pub use cell_spec::{CellSpec, CellSpecError};
pub use control_type::{CellKind, ControlType};
pub use device_def::{CellDef, DefinitionError, VirtualDeviceDef, DEFAULT_CELL_MAX};
pub use event::ChangeEvent;
pub use value::CellValue;

/// Raw value a pushbutton publishes when pressed
pub const BUTTON_PRESSED: &str = "1";

/// Raw value a pushbutton keeps between presses
pub const BUTTON_RELEASED: &str = "0";
