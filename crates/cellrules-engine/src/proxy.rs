//! Device and cell proxies
//!
//! Proxies are long-lived handles captured by rule closures. They cache the
//! model key they resolved to together with the runtime revision, and
//! resolve again after a refresh or once the cached key stops pointing at a
//! live device or cell.

use cellrules_cell_model::{Cell, CellKey, DeviceKey, MetaUpdate};
use cellrules_core::{CellSpec, CellValue, ControlType};

use crate::error::EngineResult;
use crate::runtime::RuleRuntime;

/// Lazily re-resolved handle
pub trait Resolve {
    type Target;

    /// Current target, and whether it differs from the cached one
    fn resolve(&mut self, rt: &mut RuleRuntime) -> (Self::Target, bool);
}

/// Handle of a device by name
#[derive(Debug, Clone)]
pub struct DeviceProxy {
    name: String,
    cached: Option<(DeviceKey, u64)>,
}

impl DeviceProxy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cached: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Proxy of a cell of this device
    pub fn cell(&self, cell: &str) -> Option<CellProxy> {
        CellSpec::new(self.name.as_str(), cell).ok().map(CellProxy::new)
    }

    pub fn set_title(&mut self, rt: &mut RuleRuntime, title: &str) {
        let (key, _) = self.resolve(rt);
        rt.model_mut().set_title(key, title);
    }

    pub fn is_local(&mut self, rt: &mut RuleRuntime) -> bool {
        let (key, _) = self.resolve(rt);
        rt.model().device(key).is_some_and(|d| d.is_local())
    }
}

impl Resolve for DeviceProxy {
    type Target = DeviceKey;

    fn resolve(&mut self, rt: &mut RuleRuntime) -> (DeviceKey, bool) {
        if let Some((key, rev)) = self.cached {
            if rev == rt.revision() && rt.model().device(key).is_some() {
                return (key, false);
            }
        }
        let key = rt.model_mut().ensure_device(&self.name);
        let changed = self.cached.map(|(old, _)| old) != Some(key);
        self.cached = Some((key, rt.revision()));
        (key, changed)
    }
}

/// Handle of a cell by address
///
/// Reads made through the proxy inside a condition count as dependencies of
/// the rule.
#[derive(Debug, Clone)]
pub struct CellProxy {
    spec: CellSpec,
    cached: Option<(CellKey, u64)>,
}

impl CellProxy {
    pub fn new(spec: CellSpec) -> Self {
        Self { spec, cached: None }
    }

    pub fn spec(&self) -> &CellSpec {
        &self.spec
    }

    fn with_cell<T>(&mut self, rt: &mut RuleRuntime, f: impl FnOnce(Option<&Cell>) -> T) -> T {
        let (key, _) = self.resolve(rt);
        rt.note_cell(&self.spec);
        f(rt.model().cell(key))
    }

    pub fn value(&mut self, rt: &mut RuleRuntime) -> CellValue {
        self.with_cell(rt, |cell| {
            cell.map(Cell::value)
                .unwrap_or_else(|| CellValue::Text(String::new()))
        })
    }

    pub fn raw_value(&mut self, rt: &mut RuleRuntime) -> String {
        self.with_cell(rt, |cell| {
            cell.map(|c| c.raw_value().to_string()).unwrap_or_default()
        })
    }

    pub fn is_complete(&mut self, rt: &mut RuleRuntime) -> bool {
        self.with_cell(rt, |cell| cell.is_some_and(Cell::is_complete))
    }

    pub fn set_value(&mut self, rt: &mut RuleRuntime, value: impl Into<CellValue>) -> bool {
        let (key, _) = self.resolve(rt);
        rt.note_cell(&self.spec);
        rt.model_mut().set_value(key, &value.into())
    }

    pub fn set_control_type(
        &mut self,
        rt: &mut RuleRuntime,
        control_type: impl Into<ControlType>,
    ) -> EngineResult<()> {
        rt.update_cell_meta(&self.spec, MetaUpdate::ControlType(control_type.into()))
    }

    pub fn set_max(&mut self, rt: &mut RuleRuntime, max: f64) -> EngineResult<()> {
        rt.update_cell_meta(&self.spec, MetaUpdate::Max(max))
    }

    pub fn set_readonly(&mut self, rt: &mut RuleRuntime, readonly: bool) -> EngineResult<()> {
        rt.update_cell_meta(&self.spec, MetaUpdate::Readonly(readonly))
    }

    pub fn set_order(&mut self, rt: &mut RuleRuntime, order: u32) -> EngineResult<()> {
        rt.update_cell_meta(&self.spec, MetaUpdate::Order(order))
    }

    /// Set the cell's error text; an empty string clears it
    pub fn set_error(&mut self, rt: &mut RuleRuntime, error: &str) -> EngineResult<()> {
        rt.update_cell_meta(&self.spec, MetaUpdate::Error(error.to_string()))
    }
}

impl Resolve for CellProxy {
    type Target = CellKey;

    fn resolve(&mut self, rt: &mut RuleRuntime) -> (CellKey, bool) {
        if let Some((key, rev)) = self.cached {
            if rev == rt.revision() && rt.model().cell(key).is_some() {
                return (key, false);
            }
        }
        let key = rt.model_mut().ensure_cell(&self.spec);
        let changed = self.cached.map(|(old, _)| old) != Some(key);
        self.cached = Some((key, rt.revision()));
        (key, changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use cellrules_cell_model::{CellModel, NullTransport};
    use cellrules_core::{CellDef, VirtualDeviceDef};
    use cellrules_event_bus::ChangeBus;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn runtime() -> RuleRuntime {
        let (jobs, _) = mpsc::unbounded_channel();
        let model = CellModel::new(Arc::new(ChangeBus::new()), Arc::new(NullTransport));
        RuleRuntime::new(model, jobs, &EngineOptions::default())
    }

    fn lamp() -> VirtualDeviceDef {
        VirtualDeviceDef::new("Lamp").cell("on", CellDef::new("switch", true))
    }

    #[test]
    fn test_cached_until_refresh() {
        let mut rt = runtime();
        let mut proxy = DeviceProxy::new("lamp");
        let (first, changed) = proxy.resolve(&mut rt);
        assert!(changed);
        assert_eq!(proxy.resolve(&mut rt), (first, false));

        rt.refresh();
        assert_eq!(proxy.resolve(&mut rt), (first, false));
    }

    #[test]
    fn test_resolves_redefined_device() {
        let mut rt = runtime();
        rt.define_virtual_device("lamp", &lamp()).unwrap();
        let mut proxy = DeviceProxy::new("lamp").cell("on").unwrap();
        assert_eq!(proxy.value(&mut rt), CellValue::Bool(true));

        rt.define_virtual_device("lamp", &lamp()).unwrap();
        rt.refresh();
        let (_, changed) = proxy.resolve(&mut rt);
        assert!(changed);
        assert!(proxy.is_complete(&mut rt));
    }

    #[test]
    fn test_proxy_reresolves_after_cell_removal() {
        let mut rt = runtime();
        let def = lamp().cell("level", CellDef::new("range", 5.0));
        rt.define_virtual_device("lamp", &def).unwrap();
        let mut level = CellProxy::new("lamp/level".parse().unwrap());
        assert_eq!(level.value(&mut rt), CellValue::Number(5.0));

        rt.remove_cell("lamp", "on").unwrap();
        let (_, changed) = level.resolve(&mut rt);
        assert!(changed);
        assert_eq!(level.value(&mut rt), CellValue::Number(5.0));
    }

    #[test]
    fn test_metadata_setters() {
        let mut rt = runtime();
        rt.define_virtual_device("lamp", &lamp()).unwrap();
        let mut on = CellProxy::new("lamp/on".parse().unwrap());
        on.set_readonly(&mut rt, true).unwrap();
        on.set_order(&mut rt, 2).unwrap();
        on.set_error(&mut rt, "r").unwrap();
        on.set_control_type(&mut rt, "alarm").unwrap();

        let cell = rt.model().cell_by_spec(on.spec()).unwrap();
        assert!(cell.is_readonly());
        assert_eq!(cell.order(), Some(2));
        assert_eq!(cell.error(), Some("r"));
        assert_eq!(cell.control_type().as_str(), "alarm");
        assert!(on.set_max(&mut rt, -1.0).is_err());

        let mut external = CellProxy::new("relay/on".parse().unwrap());
        external.raw_value(&mut rt);
        assert!(external.set_readonly(&mut rt, true).is_err());
    }

    #[test]
    fn test_set_value_through_proxy() {
        let mut rt = runtime();
        rt.define_virtual_device("lamp", &lamp()).unwrap();
        let mut proxy = CellProxy::new("lamp/on".parse().unwrap());
        assert!(proxy.set_value(&mut rt, false));
        assert!(!proxy.set_value(&mut rt, false));
        assert_eq!(proxy.raw_value(&mut rt), "0");
    }
}
