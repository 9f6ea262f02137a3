//! Device and cell model for the cell rule engine
//!
//! This crate provides the CellModel, which holds every known device and
//! its cells. Devices live in an append-only arena addressed by
//! [`DeviceKey`]; a removed or redefined device never gets its old key back,
//! so keys held across a reload resolve to nothing instead of the wrong
//! device. Removing a cell likewise invalidates the cell keys of its device.
//! Every mutation posts a [`ChangeEvent`] onto the shared bus.
//!
//! The model is owned by the engine's executor and is not synchronized.

mod device;
mod error;
mod transport;

pub use device::{Cell, Device, DeviceOrigin, MetaUpdate};
pub use error::{ModelError, ModelResult};
pub use transport::{ControlMeta, NullTransport, ScriptUpdate, Transport};

use cellrules_core::{
    CellDef, CellSpec, CellValue, ChangeEvent, ControlType, VirtualDeviceDef, BUTTON_PRESSED,
};
use cellrules_event_bus::SharedChangeBus;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Handle of a device slot in the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey(usize);

/// Handle of a cell: its device slot plus its position in the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellKey {
    device: DeviceKey,
    index: usize,
    layout: u64,
}

impl CellKey {
    pub fn device(&self) -> DeviceKey {
        self.device
    }
}

/// Live model of all devices and cells
pub struct CellModel {
    devices: Vec<Option<Device>>,
    by_name: HashMap<String, DeviceKey>,
    bus: SharedChangeBus,
    transport: Arc<dyn Transport>,
    ready: bool,
}

impl CellModel {
    /// Create an empty model posting changes onto `bus`
    pub fn new(bus: SharedChangeBus, transport: Arc<dyn Transport>) -> Self {
        Self {
            devices: Vec::new(),
            by_name: HashMap::new(),
            bus,
            transport,
            ready: false,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn bus(&self) -> &SharedChangeBus {
        &self.bus
    }

    /// Whether local devices have been published
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Look up a device by name
    pub fn device_key(&self, name: &str) -> Option<DeviceKey> {
        self.by_name.get(name).copied()
    }

    pub fn device(&self, key: DeviceKey) -> Option<&Device> {
        self.devices.get(key.0).and_then(Option::as_ref)
    }

    fn device_mut(&mut self, key: DeviceKey) -> Option<&mut Device> {
        self.devices.get_mut(key.0).and_then(Option::as_mut)
    }

    pub fn device_by_name(&self, name: &str) -> Option<&Device> {
        self.device_key(name).and_then(|key| self.device(key))
    }

    /// Names of all devices, sorted
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up a cell without creating it
    pub fn cell_key(&self, spec: &CellSpec) -> Option<CellKey> {
        let device = self.device_key(spec.device())?;
        self.cell_key_in(device, spec.cell())
    }

    /// Look up a cell by name within a known device
    pub fn cell_key_in(&self, device: DeviceKey, cell: &str) -> Option<CellKey> {
        let dev = self.device(device)?;
        let index = dev.cells.get_index_of(cell)?;
        Some(CellKey {
            device,
            index,
            layout: dev.layout,
        })
    }

    fn device_for_cell(&self, key: CellKey) -> Option<&Device> {
        self.device(key.device).filter(|dev| dev.layout == key.layout)
    }

    pub fn cell(&self, key: CellKey) -> Option<&Cell> {
        self.device_for_cell(key)?.cells.get_index(key.index).map(|(_, c)| c)
    }

    fn cell_mut(&mut self, key: CellKey) -> Option<(&str, &mut Cell, DeviceOrigin)> {
        let device = self
            .devices
            .get_mut(key.device.0)?
            .as_mut()
            .filter(|dev| dev.layout == key.layout)?;
        let origin = device.origin();
        let name = device.name.as_str();
        let (_, cell) = device.cells.get_index_mut(key.index)?;
        Some((name, cell, origin))
    }

    pub fn cell_by_spec(&self, spec: &CellSpec) -> Option<&Cell> {
        self.cell_key(spec).and_then(|key| self.cell(key))
    }

    /// Address of the cell behind `key`
    pub fn cell_spec(&self, key: CellKey) -> Option<CellSpec> {
        let device = self.device_for_cell(key)?;
        let (name, _) = device.cells.get_index(key.index)?;
        CellSpec::new(device.name(), name.as_str()).ok()
    }

    /// Return the named device, creating an external one if it is unknown
    pub fn ensure_device(&mut self, name: &str) -> DeviceKey {
        if let Some(key) = self.device_key(name) {
            return key;
        }
        debug!(device = %name, "Adding external device");
        self.insert_device(Device::new(name, name, DeviceOrigin::External))
    }

    fn insert_device(&mut self, device: Device) -> DeviceKey {
        let key = DeviceKey(self.devices.len());
        self.by_name.insert(device.name().to_string(), key);
        self.devices.push(Some(device));
        key
    }

    /// Return the cell, creating it as untyped text with an empty value
    pub fn ensure_cell_in(&mut self, device: DeviceKey, name: &str) -> Option<CellKey> {
        let dev = self.device_mut(device)?;
        let index = match dev.cells.get_index_of(name) {
            Some(index) => index,
            None => {
                trace!(device = %dev.name(), cell = %name, "Adding cell");
                dev.cells
                    .insert_full(name.to_string(), Cell::placeholder(name))
                    .0
            }
        };
        Some(CellKey {
            device,
            index,
            layout: dev.layout,
        })
    }

    /// Return the cell at `spec`, creating the device and cell as needed
    pub fn ensure_cell(&mut self, spec: &CellSpec) -> CellKey {
        let device = self.ensure_device(spec.device());
        self.ensure_cell_in(device, spec.cell())
            .unwrap_or_else(|| unreachable!("device {} has no slot", spec.device()))
    }

    fn notify(&self, event: ChangeEvent) {
        self.bus.fire(event);
    }

    /// Set a cell from rule logic
    ///
    /// Local cells change immediately and notify only when the encoded value
    /// differs. External cells are left alone and a command is sent instead;
    /// the value changes when the device echoes it back. Pushbuttons always
    /// count as pressed. Returns whether anything was sent or notified.
    #[instrument(skip(self, value))]
    pub fn set_value(&mut self, key: CellKey, value: &CellValue) -> bool {
        let ready = self.ready;
        let transport = self.transport.clone();
        let Some((device, cell, origin)) = self.cell_mut(key) else {
            return false;
        };
        let device = device.to_string();
        cell.got_value = true;

        if cell.is_button() {
            let name = cell.name().to_string();
            match origin {
                DeviceOrigin::Local => {
                    if ready {
                        transport.publish_value(&device, &name, BUTTON_PRESSED, false);
                    }
                    self.notify(ChangeEvent::cell(device, name));
                }
                DeviceOrigin::External => transport.send_command(&device, &name, BUTTON_PRESSED),
            }
            return true;
        }

        let raw = value.to_raw();
        if cell.raw_value() == raw {
            trace!(device = %device, cell = %cell.name(), "Value unchanged");
            return false;
        }

        let name = cell.name().to_string();
        match origin {
            DeviceOrigin::Local => {
                let retained = cell.control_type().is_retained();
                cell.set_raw(raw.clone());
                debug!(device = %device, cell = %name, value = %raw, "Setting local cell");
                if ready {
                    transport.publish_value(&device, &name, &raw, retained);
                }
                self.notify(ChangeEvent::cell(device, name));
            }
            DeviceOrigin::External => {
                debug!(device = %device, cell = %name, value = %raw, "Sending command");
                transport.send_command(&device, &name, &raw);
            }
        }
        true
    }

    /// Store a value that arrived from the transport; always notifies
    pub fn accept_value(&mut self, spec: &CellSpec, raw: &str) {
        let key = self.ensure_cell(spec);
        if let Some((_, cell, _)) = self.cell_mut(key) {
            trace!(cell = %spec, value = %raw, "Accepting value");
            cell.set_raw(raw.to_string());
            cell.got_value = true;
        }
        self.notify(ChangeEvent::cell(spec.device(), spec.cell()));
    }

    /// Store a control type that arrived from the transport; always notifies
    pub fn accept_control_type(&mut self, spec: &CellSpec, control_type: ControlType) {
        let key = self.ensure_cell(spec);
        if let Some((_, cell, _)) = self.cell_mut(key) {
            trace!(cell = %spec, control_type = %control_type, "Accepting control type");
            cell.set_control_type(control_type);
            cell.got_type = true;
        }
        self.notify(ChangeEvent::cell(spec.device(), spec.cell()));
    }

    /// Store a numeric max that arrived from the transport; always notifies
    pub fn accept_control_max(&mut self, spec: &CellSpec, max: f64) {
        let key = self.ensure_cell(spec);
        if let Some((_, cell, _)) = self.cell_mut(key) {
            cell.set_max(max);
        }
        self.notify(ChangeEvent::cell(spec.device(), spec.cell()));
    }

    /// Change a device title and post a device-level notification
    pub fn set_title(&mut self, device: DeviceKey, title: impl Into<String>) {
        let Some(dev) = self.device_mut(device) else {
            return;
        };
        dev.set_title(title.into());
        let name = dev.name().to_string();
        self.notify(ChangeEvent::device(name));
    }

    /// Define (or redefine) a local device
    ///
    /// A redefinition gets a fresh key; keys of the previous definition stop
    /// resolving. An external device that only exists because it was
    /// referenced is taken over; one that has reported data is a conflict.
    /// Once the model is ready the device is declared right away.
    #[instrument(skip(self, def))]
    pub fn define_local_device(&mut self, name: &str, def: &VirtualDeviceDef) -> ModelResult<DeviceKey> {
        def.validate(name)?;

        if let Some(existing) = self.device_by_name(name) {
            if !existing.is_local() && !existing.is_placeholder() {
                return Err(ModelError::DeviceConflict(name.to_string()));
            }
            debug!(device = %name, local = existing.is_local(), "Redefining device as local");
            self.drop_slot(name);
        }

        let title = def.title.clone().unwrap_or_else(|| name.to_string());
        let mut device = Device::new(name, &title, DeviceOrigin::Local);
        for (cell_name, cell_def) in &def.cells {
            device
                .cells
                .insert(cell_name.clone(), Cell::from_def(cell_name, cell_def));
        }
        let key = self.insert_device(device);

        if self.ready {
            debug!(device = %name, "Publishing device defined while the model is active");
            self.query_params(key);
        }
        self.notify(ChangeEvent::device(name));
        Ok(key)
    }

    /// The named device, provided it is local
    fn local_device_mut(&mut self, name: &str) -> ModelResult<(DeviceKey, &mut Device)> {
        let key = self
            .device_key(name)
            .ok_or_else(|| ModelError::DeviceNotFound(name.to_string()))?;
        let device = self
            .device_mut(key)
            .ok_or_else(|| ModelError::DeviceNotFound(name.to_string()))?;
        if !device.is_local() {
            return Err(ModelError::NotLocal(name.to_string()));
        }
        Ok((key, device))
    }

    /// Add a cell to a local device, or replace the definition of an
    /// existing one in place
    ///
    /// Once the model is ready the cell is published right away.
    #[instrument(skip(self, def))]
    pub fn add_local_cell(&mut self, device: &str, name: &str, def: &CellDef) -> ModelResult<CellKey> {
        let spec = CellSpec::new(device, name)
            .ok()
            .filter(|_| !name.contains('/'))
            .ok_or_else(|| ModelError::InvalidCellName(format!("{}/{}", device, name)))?;
        def.validate(device, name)?;

        let ready = self.ready;
        let (key, dev) = self.local_device_mut(device)?;
        let cell = Cell::from_def(name, def);
        let meta = cell.meta();
        let (index, replaced) = dev.cells.insert_full(name.to_string(), cell);
        let layout = dev.layout;
        debug!(cell = %spec, replaced = replaced.is_some(), "Added local cell");

        if ready {
            self.transport.publish_control(device, &meta);
        }
        self.notify(ChangeEvent::cell(device, name));
        Ok(CellKey {
            device: key,
            index,
            layout,
        })
    }

    /// Remove a cell from a local device
    ///
    /// Cell keys of the device handed out before stop resolving.
    #[instrument(skip(self))]
    pub fn remove_local_cell(&mut self, device: &str, name: &str) -> ModelResult<()> {
        let ready = self.ready;
        let (_, dev) = self.local_device_mut(device)?;
        if dev.cells.shift_remove(name).is_none() {
            return Err(ModelError::CellNotFound(format!("{}/{}", device, name)));
        }
        dev.layout += 1;
        debug!(device = %device, cell = %name, "Removed local cell");

        if ready {
            self.transport.remove_control(device, name);
        }
        self.notify(ChangeEvent::cell(device, name));
        Ok(())
    }

    /// Change one metadata field of a local cell and republish it
    #[instrument(skip(self))]
    pub fn update_meta(&mut self, spec: &CellSpec, update: MetaUpdate) -> ModelResult<()> {
        let ready = self.ready;
        let key = self
            .cell_key(spec)
            .ok_or_else(|| ModelError::CellNotFound(spec.to_string()))?;
        let (device, cell, origin) = self
            .cell_mut(key)
            .ok_or_else(|| ModelError::CellNotFound(spec.to_string()))?;
        if origin != DeviceOrigin::Local {
            return Err(ModelError::NotLocal(device.to_string()));
        }
        cell.apply_meta(&spec.to_string(), update)?;
        let meta = cell.meta();
        trace!(cell = %spec, "Updated cell metadata");

        if ready {
            self.transport.publish_control(spec.device(), &meta);
        }
        self.notify(ChangeEvent::cell(spec.device(), spec.cell()));
        Ok(())
    }

    fn drop_slot(&mut self, name: &str) -> Option<Device> {
        let key = self.by_name.remove(name)?;
        self.devices.get_mut(key.0).and_then(Option::take)
    }

    /// Remove a local device; external devices and unknown names are ignored
    pub fn remove_local_device(&mut self, name: &str) -> bool {
        match self.device_by_name(name) {
            Some(device) if device.is_local() => {}
            _ => return false,
        }
        self.drop_slot(name);
        debug!(device = %name, "Removed local device");
        self.transport.remove_device(name);
        true
    }

    /// Publish a local device and all its cells in name order
    ///
    /// External devices are not published.
    pub fn query_params(&self, key: DeviceKey) {
        let Some(device) = self.device(key) else {
            return;
        };
        if !device.is_local() {
            return;
        }
        self.transport.declare_device(device.name(), device.title());
        for name in device.sorted_cell_names() {
            if let Some(cell) = device.cell(&name) {
                self.transport.publish_control(device.name(), &cell.meta());
            }
        }
    }

    /// Mark the model ready and publish every local device, sorted by name
    pub fn start(&mut self) {
        if self.ready {
            return;
        }
        self.ready = true;
        for name in self.device_names() {
            if let Some(key) = self.device_key(&name) {
                self.query_params(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrules_core::CellDef;
    use cellrules_event_bus::ChangeBus;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl Transport for Recorder {
        fn declare_device(&self, device: &str, title: &str) {
            self.calls.lock().unwrap().push(format!("declare {} {}", device, title));
        }
        fn publish_control(&self, device: &str, control: &ControlMeta) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("control {}/{} {}", device, control.name, control.value));
        }
        fn publish_value(&self, device: &str, cell: &str, raw: &str, retained: bool) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("value {}/{} {} {}", device, cell, raw, retained));
        }
        fn remove_device(&self, device: &str) {
            self.calls.lock().unwrap().push(format!("remove {}", device));
        }
        fn remove_control(&self, device: &str, cell: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("remove {}/{}", device, cell));
        }
        fn send_command(&self, device: &str, cell: &str, raw: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("command {}/{} {}", device, cell, raw));
        }
    }

    fn model() -> (CellModel, Arc<Recorder>, UnboundedReceiver<ChangeEvent>) {
        let bus = Arc::new(ChangeBus::new());
        let (_, rx) = bus.subscribe();
        let recorder = Arc::new(Recorder::default());
        (CellModel::new(bus, recorder.clone()), recorder, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ChangeEvent>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn spec(s: &str) -> CellSpec {
        s.parse().unwrap()
    }

    fn heater() -> VirtualDeviceDef {
        VirtualDeviceDef::new("Heater")
            .cell("temp", CellDef::new("temperature", 20.0))
            .cell("enabled", CellDef::new("switch", false))
            .cell("reset", CellDef::button())
    }

    #[test]
    fn test_ensure_device_is_idempotent() {
        let (mut model, _, _) = model();
        let a = model.ensure_device("dev");
        let b = model.ensure_device("dev");
        assert_eq!(a, b);
        assert_eq!(model.device(a).unwrap().origin(), DeviceOrigin::External);
    }

    #[test]
    fn test_ensure_cell_defaults() {
        let (mut model, _, _) = model();
        let key = model.ensure_cell(&spec("dev/x"));
        let cell = model.cell(key).unwrap();
        assert_eq!(cell.control_type().as_str(), "text");
        assert_eq!(cell.raw_value(), "");
        assert!(!cell.is_complete());
        assert_eq!(model.ensure_cell(&spec("dev/x")), key);
    }

    #[test]
    fn test_set_value_is_idempotent() {
        let (mut model, _, mut rx) = model();
        let key = model.define_local_device("heater", &heater()).unwrap();
        drain(&mut rx);

        let cell = model.cell_key_in(key, "temp").unwrap();
        assert!(model.set_value(cell, &CellValue::from(42.0)));
        assert!(!model.set_value(cell, &CellValue::from(42.0)));
        assert_eq!(drain(&mut rx), vec![ChangeEvent::cell("heater", "temp")]);
        assert_eq!(model.cell(cell).unwrap().raw_value(), "42");
    }

    #[test]
    fn test_set_value_publishes_once_ready() {
        let (mut model, recorder, _) = model();
        let key = model.define_local_device("heater", &heater()).unwrap();
        let cell = model.cell_key_in(key, "enabled").unwrap();

        model.set_value(cell, &CellValue::Bool(true));
        assert!(recorder.take().is_empty());

        model.start();
        recorder.take();
        model.set_value(cell, &CellValue::Bool(false));
        assert_eq!(recorder.take(), vec!["value heater/enabled 0 true"]);
    }

    #[test]
    fn test_button_press() {
        let (mut model, recorder, mut rx) = model();
        let key = model.define_local_device("heater", &heater()).unwrap();
        model.start();
        recorder.take();
        drain(&mut rx);

        let button = model.cell_key_in(key, "reset").unwrap();
        assert!(model.set_value(button, &CellValue::Bool(true)));
        assert!(model.set_value(button, &CellValue::Bool(true)));
        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(
            recorder.take(),
            vec!["value heater/reset 1 false", "value heater/reset 1 false"]
        );
        assert_eq!(model.cell(button).unwrap().raw_value(), "0");
    }

    #[test]
    fn test_external_set_value_sends_command() {
        let (mut model, recorder, mut rx) = model();
        let key = model.ensure_cell(&spec("relay/on"));
        model.accept_control_type(&spec("relay/on"), "switch".into());
        model.accept_value(&spec("relay/on"), "0");
        drain(&mut rx);

        assert!(model.set_value(key, &CellValue::Bool(true)));
        assert_eq!(recorder.take(), vec!["command relay/on 1"]);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(model.cell(key).unwrap().raw_value(), "0");

        assert!(!model.set_value(key, &CellValue::Bool(false)));
    }

    #[test]
    fn test_accept_value_always_notifies() {
        let (mut model, _, mut rx) = model();
        model.accept_value(&spec("dev/x"), "5");
        model.accept_value(&spec("dev/x"), "5");
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn test_completeness() {
        let (mut model, _, _) = model();
        model.accept_value(&spec("dev/t"), "5");
        let cell = model.cell_by_spec(&spec("dev/t")).unwrap();
        assert!(!cell.is_complete());

        model.accept_control_type(&spec("dev/t"), "temperature".into());
        let cell = model.cell_by_spec(&spec("dev/t")).unwrap();
        assert!(cell.is_complete());
        assert_eq!(cell.value(), CellValue::Number(5.0));
    }

    #[test]
    fn test_fresh_button() {
        let (mut model, _, _) = model();
        model.accept_control_type(&spec("dev/b"), "pushbutton".into());
        let cell = model.cell_by_spec(&spec("dev/b")).unwrap();
        assert!(cell.is_complete());
        assert!(cell.is_fresh_button());

        model.accept_value(&spec("dev/b"), "1");
        assert!(!model.cell_by_spec(&spec("dev/b")).unwrap().is_fresh_button());
    }

    #[test]
    fn test_start_publishes_sorted() {
        let (mut model, recorder, _) = model();
        model.define_local_device("heater", &heater()).unwrap();
        model.start();
        assert_eq!(
            recorder.take(),
            vec![
                "declare heater Heater",
                "control heater/enabled 0",
                "control heater/reset 0",
                "control heater/temp 20",
            ]
        );
    }

    #[test]
    fn test_local_over_external_conflicts() {
        let (mut model, _, _) = model();
        model.accept_value(&spec("heater/temp"), "21");
        assert_eq!(
            model.define_local_device("heater", &heater()),
            Err(ModelError::DeviceConflict("heater".into()))
        );
        assert!(!model.device_by_name("heater").unwrap().is_local());
    }

    #[test]
    fn test_local_takes_over_placeholder() {
        let (mut model, _, _) = model();
        model.ensure_cell(&spec("heater/temp"));
        assert!(model.device_by_name("heater").unwrap().is_placeholder());

        model.define_local_device("heater", &heater()).unwrap();
        assert!(model.device_by_name("heater").unwrap().is_local());
    }

    #[test]
    fn test_redefinition_invalidates_old_keys() {
        let (mut model, _, _) = model();
        let old = model.define_local_device("heater", &heater()).unwrap();
        let old_cell = model.cell_key_in(old, "temp").unwrap();
        let new = model.define_local_device("heater", &heater()).unwrap();
        assert_ne!(old, new);
        assert!(model.cell(old_cell).is_none());
        assert!(model.cell_key_in(new, "temp").is_some());
    }

    #[test]
    fn test_remove_local_device() {
        let (mut model, recorder, _) = model();
        model.define_local_device("heater", &heater()).unwrap();
        model.ensure_device("relay");

        assert!(model.remove_local_device("heater"));
        assert!(!model.remove_local_device("relay"));
        assert!(!model.remove_local_device("nope"));
        assert!(model.device_by_name("heater").is_none());
        assert_eq!(recorder.take(), vec!["remove heater"]);
    }

    #[test]
    fn test_add_local_cell() {
        let (mut model, recorder, mut rx) = model();
        model.define_local_device("heater", &heater()).unwrap();
        model.start();
        recorder.take();
        drain(&mut rx);

        let key = model
            .add_local_cell("heater", "mode", &CellDef::new("text", "auto"))
            .unwrap();
        assert_eq!(model.cell(key).unwrap().raw_value(), "auto");
        assert_eq!(recorder.take(), vec!["control heater/mode auto"]);
        assert_eq!(drain(&mut rx), vec![ChangeEvent::cell("heater", "mode")]);

        let replaced = model
            .add_local_cell("heater", "mode", &CellDef::new("text", "manual"))
            .unwrap();
        assert_eq!(replaced, key);
        assert_eq!(model.cell(key).unwrap().raw_value(), "manual");
    }

    #[test]
    fn test_add_cell_rejects_unknown_and_external_devices() {
        let (mut model, _, _) = model();
        model.ensure_device("relay");
        let def = CellDef::new("switch", false);
        assert_eq!(
            model.add_local_cell("nope", "x", &def),
            Err(ModelError::DeviceNotFound("nope".into()))
        );
        assert_eq!(
            model.add_local_cell("relay", "x", &def),
            Err(ModelError::NotLocal("relay".into()))
        );

        model.define_local_device("heater", &heater()).unwrap();
        assert!(matches!(
            model.add_local_cell("heater", "x", &CellDef::button().with_max(-2.0)),
            Err(ModelError::Definition(_))
        ));
        assert!(matches!(
            model.add_local_cell("heater", "", &def),
            Err(ModelError::InvalidCellName(_))
        ));
    }

    #[test]
    fn test_remove_local_cell_invalidates_keys() {
        let (mut model, recorder, mut rx) = model();
        let dev = model.define_local_device("heater", &heater()).unwrap();
        model.start();
        recorder.take();
        drain(&mut rx);

        let reset = model.cell_key_in(dev, "reset").unwrap();
        model.remove_local_cell("heater", "enabled").unwrap();
        assert!(model.cell(reset).is_none());
        assert!(model.cell_spec(reset).is_none());
        assert!(model.cell_by_spec(&spec("heater/enabled")).is_none());
        assert!(model.cell_by_spec(&spec("heater/reset")).is_some());
        assert_eq!(model.device_key("heater"), Some(dev));
        assert_eq!(recorder.take(), vec!["remove heater/enabled"]);
        assert_eq!(drain(&mut rx), vec![ChangeEvent::cell("heater", "enabled")]);

        assert_eq!(
            model.remove_local_cell("heater", "enabled"),
            Err(ModelError::CellNotFound("heater/enabled".into()))
        );
    }

    #[test]
    fn test_update_meta_republishes() {
        let (mut model, recorder, mut rx) = model();
        model.define_local_device("heater", &heater()).unwrap();
        model.start();
        recorder.take();
        drain(&mut rx);

        model
            .update_meta(&spec("heater/temp"), MetaUpdate::Readonly(false))
            .unwrap();
        assert!(!model.cell_by_spec(&spec("heater/temp")).unwrap().is_readonly());
        assert_eq!(recorder.take(), vec!["control heater/temp 20"]);
        assert_eq!(drain(&mut rx), vec![ChangeEvent::cell("heater", "temp")]);

        model
            .update_meta(&spec("heater/temp"), MetaUpdate::ControlType("range".into()))
            .unwrap();
        assert_eq!(
            model.cell_by_spec(&spec("heater/temp")).unwrap().control_type().as_str(),
            "range"
        );
    }

    #[test]
    fn test_update_meta_rejects_external_cells() {
        let (mut model, recorder, _) = model();
        model.accept_value(&spec("relay/on"), "1");
        assert_eq!(
            model.update_meta(&spec("relay/on"), MetaUpdate::Order(1)),
            Err(ModelError::NotLocal("relay".into()))
        );
        assert!(matches!(
            model.update_meta(&spec("relay/off"), MetaUpdate::Order(1)),
            Err(ModelError::CellNotFound(_))
        ));
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_set_title_posts_device_event() {
        let (mut model, _, mut rx) = model();
        let key = model.ensure_device("relay");
        model.set_title(key, "Relay");
        assert_eq!(drain(&mut rx), vec![ChangeEvent::device("relay")]);
        assert_eq!(model.device(key).unwrap().title(), "Relay");
    }

    #[test]
    fn test_invalid_definition_is_not_installed() {
        let (mut model, _, _) = model();
        let result = model.define_local_device("empty", &VirtualDeviceDef::new("Empty"));
        assert!(matches!(result, Err(ModelError::Definition(_))));
        assert!(model.device_by_name("empty").is_none());
    }
}
