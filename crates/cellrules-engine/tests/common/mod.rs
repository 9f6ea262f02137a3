//! Common test utilities for the rule engine
//!
//! Provides a started engine wired to a transport that records everything
//! the engine publishes.

#![allow(dead_code)]

use cellrules_cell_model::{ControlMeta, ScriptUpdate, Transport};
use cellrules_core::{CellSpec, CellValue, ControlType};
use cellrules_engine::{ActionArgs, ActionError, EngineOptions, RuleEngine, RuleRuntime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One outbound call made by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Declare { device: String },
    Control { device: String, cell: String },
    Publish { device: String, cell: String, raw: String, retained: bool },
    Remove { device: String },
    RemoveControl { device: String, cell: String },
    Command { device: String, cell: String, raw: String },
    Script(ScriptUpdate),
    Log(String),
}

/// Transport capturing outbound calls for assertions
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<Outbound>>,
}

impl RecordingTransport {
    fn record(&self, call: Outbound) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Outbound> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn published(&self, device: &str, cell: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Outbound::Publish { device: d, cell: c, raw, .. } if d == device && c == cell => Some(raw),
                _ => None,
            })
            .collect()
    }

    pub fn script_updates(&self) -> Vec<ScriptUpdate> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Outbound::Script(update) => Some(update),
                _ => None,
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn declare_device(&self, device: &str, _title: &str) {
        self.record(Outbound::Declare {
            device: device.to_string(),
        });
    }

    fn publish_control(&self, device: &str, control: &ControlMeta) {
        self.record(Outbound::Control {
            device: device.to_string(),
            cell: control.name.clone(),
        });
    }

    fn publish_value(&self, device: &str, cell: &str, raw: &str, retained: bool) {
        self.record(Outbound::Publish {
            device: device.to_string(),
            cell: cell.to_string(),
            raw: raw.to_string(),
            retained,
        });
    }

    fn remove_device(&self, device: &str) {
        self.record(Outbound::Remove {
            device: device.to_string(),
        });
    }

    fn remove_control(&self, device: &str, cell: &str) {
        self.record(Outbound::RemoveControl {
            device: device.to_string(),
            cell: cell.to_string(),
        });
    }

    fn send_command(&self, device: &str, cell: &str, raw: &str) {
        self.record(Outbound::Command {
            device: device.to_string(),
            cell: cell.to_string(),
            raw: raw.to_string(),
        });
    }

    fn script_updated(&self, update: &ScriptUpdate) {
        self.record(Outbound::Script(update.clone()));
    }

    fn log_message(&self, _level: tracing::Level, message: &str) {
        self.record(Outbound::Log(message.to_string()));
    }
}

/// A started engine with a recording transport
pub struct TestEngine {
    pub engine: RuleEngine,
    pub transport: Arc<RecordingTransport>,
}

impl TestEngine {
    /// Started, not yet ready
    pub fn started() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let engine = RuleEngine::new(transport.clone(), options);
        engine.start();
        Self { engine, transport }
    }

    /// Started and ready
    pub async fn ready() -> Self {
        let test = Self::started();
        test.engine.mark_ready().await.unwrap();
        test
    }

    /// Wait until every change posted so far has been handled
    pub async fn settle(&self) {
        self.engine.call_sync(|_| ()).await.unwrap();
    }

    /// Deliver an external cell's type and value, as the transport would
    pub async fn external(&self, cell: &str, control_type: &str, raw: &str) {
        self.engine
            .accept_control_type(spec(cell), ControlType::from(control_type))
            .await
            .unwrap();
        self.engine.accept_value(spec(cell), raw).await.unwrap();
        self.settle().await;
    }

    pub async fn value(&self, cell: &str) -> CellValue {
        self.engine.value(spec(cell)).await.unwrap()
    }

    pub async fn stop(&self) {
        self.engine.stop().await;
    }
}

pub fn spec(s: &str) -> CellSpec {
    s.parse().expect("Invalid cell spec")
}

/// Counter shared with a rule action
#[derive(Clone, Default)]
pub struct Hits {
    count: Arc<AtomicUsize>,
    args: Arc<Mutex<Vec<ActionArgs>>>,
}

impl Hits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn args(&self) -> Vec<ActionArgs> {
        self.args.lock().unwrap().clone()
    }

    /// Action recording each invocation
    pub fn action(
        &self,
    ) -> impl FnMut(&mut RuleRuntime, &ActionArgs) -> Result<Option<CellValue>, ActionError> + Send + 'static
    {
        let hits = self.clone();
        move |_, args| {
            hits.count.fetch_add(1, Ordering::SeqCst);
            hits.args.lock().unwrap().push(args.clone());
            Ok(None)
        }
    }

    /// Bump the counter from any callback
    pub fn hit(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}
