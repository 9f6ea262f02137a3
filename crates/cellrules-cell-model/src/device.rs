//! Devices and their cells

use cellrules_core::{CellDef, CellKind, CellValue, ControlType};
use indexmap::IndexMap;

use crate::{ControlMeta, ModelError, ModelResult};

/// Where a device comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOrigin {
    /// Defined by rule scripts and fully owned by the engine
    Local,
    /// Discovered from inbound updates; writes become commands
    External,
}

/// A single typed state value
#[derive(Debug, Clone)]
pub struct Cell {
    name: String,
    control_type: ControlType,
    raw: String,
    max: Option<f64>,
    readonly: bool,
    order: Option<u32>,
    error: Option<String>,
    pub(crate) got_type: bool,
    pub(crate) got_value: bool,
}

impl Cell {
    /// A cell created on first reference: untyped text, empty value
    pub(crate) fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            control_type: ControlType::text(),
            raw: String::new(),
            max: None,
            readonly: false,
            order: None,
            error: None,
            got_type: false,
            got_value: false,
        }
    }

    /// A fully declared local cell
    pub(crate) fn from_def(name: &str, def: &CellDef) -> Self {
        let raw = if def.control_type.kind() == CellKind::Button {
            cellrules_core::BUTTON_RELEASED.to_string()
        } else {
            def.value.as_ref().map(CellValue::to_raw).unwrap_or_default()
        };
        Self {
            name: name.to_string(),
            control_type: def.control_type.clone(),
            raw,
            max: def.effective_max(),
            readonly: def.is_readonly(),
            order: def.order,
            error: None,
            got_type: true,
            got_value: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control_type(&self) -> &ControlType {
        &self.control_type
    }

    pub fn kind(&self) -> CellKind {
        self.control_type.kind()
    }

    pub fn raw_value(&self) -> &str {
        &self.raw
    }

    /// Typed value derived from the raw value and the control type
    pub fn value(&self) -> CellValue {
        CellValue::from_raw(&self.raw, self.kind())
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn order(&self) -> Option<u32> {
        self.order
    }

    /// Error text shown next to the cell, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_button(&self) -> bool {
        self.kind() == CellKind::Button
    }

    /// Both the control type and a value have been observed
    ///
    /// Buttons need no value to be complete.
    pub fn is_complete(&self) -> bool {
        self.got_type && (self.got_value || self.is_button())
    }

    /// A pushbutton that was never pressed
    pub fn is_fresh_button(&self) -> bool {
        self.is_button() && !self.got_value
    }

    pub(crate) fn set_raw(&mut self, raw: String) {
        self.raw = raw;
    }

    pub(crate) fn set_control_type(&mut self, control_type: ControlType) {
        self.control_type = control_type;
    }

    pub(crate) fn set_max(&mut self, max: f64) {
        self.max = Some(max);
    }

    /// Apply a metadata change; `cell` names the cell in errors
    pub(crate) fn apply_meta(&mut self, cell: &str, update: MetaUpdate) -> ModelResult<()> {
        match update {
            MetaUpdate::ControlType(control_type) => {
                if control_type.as_str().is_empty() {
                    return Err(ModelError::InvalidMeta {
                        cell: cell.to_string(),
                        field: "type",
                        reason: "empty control type".to_string(),
                    });
                }
                self.control_type = control_type;
            }
            MetaUpdate::Max(max) => {
                if !max.is_finite() || max < 0.0 {
                    return Err(ModelError::InvalidMeta {
                        cell: cell.to_string(),
                        field: "max",
                        reason: format!("{} is not a non-negative number", max),
                    });
                }
                self.max = Some(max);
            }
            MetaUpdate::Readonly(readonly) => self.readonly = readonly,
            MetaUpdate::Order(order) => self.order = Some(order),
            MetaUpdate::Error(error) => self.error = Some(error).filter(|e| !e.is_empty()),
        }
        Ok(())
    }

    pub(crate) fn meta(&self) -> ControlMeta {
        ControlMeta {
            name: self.name.clone(),
            control_type: self.control_type.clone(),
            value: self.raw.clone(),
            max: self.max.filter(|m| *m > 0.0),
            readonly: self.readonly,
            order: self.order,
            error: self.error.clone(),
        }
    }
}

/// Change to one metadata field of a local cell
#[derive(Debug, Clone, PartialEq)]
pub enum MetaUpdate {
    ControlType(ControlType),
    Max(f64),
    Readonly(bool),
    Order(u32),
    /// Error text; an empty string clears it
    Error(String),
}

/// A named collection of cells
#[derive(Debug, Clone)]
pub struct Device {
    pub(crate) name: String,
    title: String,
    origin: DeviceOrigin,
    pub(crate) cells: IndexMap<String, Cell>,
    /// Bumped whenever a cell is removed and positions shift
    pub(crate) layout: u64,
}

impl Device {
    pub(crate) fn new(name: &str, title: &str, origin: DeviceOrigin) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            origin,
            cells: IndexMap::new(),
            layout: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub(crate) fn set_title(&mut self, title: String) {
        self.title = title;
    }

    pub fn origin(&self) -> DeviceOrigin {
        self.origin
    }

    pub fn is_local(&self) -> bool {
        self.origin == DeviceOrigin::Local
    }

    /// An external device nothing was ever reported for
    ///
    /// Such devices only exist because rule logic referenced them.
    pub fn is_placeholder(&self) -> bool {
        !self.is_local() && self.cells.values().all(|c| !c.got_type && !c.got_value)
    }

    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells.get(name)
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    /// Cell names sorted for deterministic publishing
    pub fn sorted_cell_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cells.keys().cloned().collect();
        names.sort();
        names
    }
}
