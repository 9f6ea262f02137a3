//! Rule engine handle
//!
//! [`RuleEngine`] is the cloneable, thread-safe front of the engine. All
//! state lives in a [`RuleRuntime`] owned by a single executor task; every
//! operation is marshalled onto that task with [`RuleEngine::call_sync`].
//!
//! The engine moves through `Created → Started → Stopped`. While created,
//! operations run inline on the caller, with the runtime taken out of the
//! engine for the duration of the call. Once started, the executor drains
//! change events and queued jobs one at a time. Change events that arrive
//! before the ready signal are discarded.

use cellrules_cell_model::{CellModel, Transport};
use cellrules_core::{CellSpec, CellValue, ChangeEvent, ControlType, VirtualDeviceDef};
use cellrules_event_bus::{ChangeBus, SharedChangeBus, SubscriberId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::condition::RuleDef;
use crate::error::{EngineError, EngineResult};
use crate::rule::RuleId;
use crate::runtime::{Job, JobSender, RuleRuntime};

/// Engine startup options
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Run the cleanups of every scope when the engine stops
    pub cleanup_on_stop: bool,
}

enum EngineState {
    Created {
        // taken while an inline call runs
        runtime: Option<Box<RuleRuntime>>,
        jobs: mpsc::UnboundedReceiver<Job>,
    },
    Started {
        jobs: JobSender,
        consumer: JoinHandle<()>,
    },
    Stopped,
}

struct Inner {
    state: Mutex<EngineState>,
    bus: SharedChangeBus,
    shutdown_tx: broadcast::Sender<()>,
}

/// Cloneable handle to the rule engine
#[derive(Clone)]
pub struct RuleEngine {
    inner: Arc<Inner>,
}

impl RuleEngine {
    /// Create an engine publishing through `transport`
    pub fn new(transport: Arc<dyn Transport>, options: EngineOptions) -> Self {
        let bus: SharedChangeBus = Arc::new(ChangeBus::new());
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let model = CellModel::new(bus.clone(), transport);
        let runtime = RuleRuntime::new(model, jobs_tx, &options);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(EngineState::Created {
                    runtime: Some(Box::new(runtime)),
                    jobs: jobs_rx,
                }),
                bus,
                shutdown_tx,
            }),
        }
    }

    /// The bus every model change is posted on
    pub fn bus(&self) -> SharedChangeBus {
        self.inner.bus.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the executor task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut state = self.lock_state();
        let (runtime, jobs_rx, jobs_tx) = match std::mem::replace(&mut *state, EngineState::Stopped) {
            EngineState::Created {
                runtime: Some(runtime),
                jobs,
            } => {
                let sender = runtime.job_sender();
                (runtime, jobs, sender)
            }
            busy @ EngineState::Created { runtime: None, .. } => {
                *state = busy;
                warn!("Cannot start the rule engine from inside an inline call");
                return;
            }
            other => {
                *state = other;
                warn!("Rule engine already started");
                return;
            }
        };

        info!("Starting rule engine");
        let (subscriber, events) = self.inner.bus.subscribe();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        let consumer = tokio::spawn(run_executor(
            runtime,
            jobs_rx,
            events,
            shutdown_rx,
            self.inner.bus.clone(),
            subscriber,
        ));
        *state = EngineState::Started {
            jobs: jobs_tx,
            consumer,
        };
    }

    /// Stop the executor and wait for it to finish
    ///
    /// Live timers and cron schedules are stopped. Later operations fail with
    /// [`EngineError::NotRunning`].
    pub async fn stop(&self) {
        let consumer = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, EngineState::Stopped) {
                EngineState::Started { consumer, .. } => consumer,
                EngineState::Created { runtime, .. } => {
                    // a taken runtime is stopped when it is handed back
                    if let Some(mut runtime) = runtime {
                        runtime.handle_stop();
                    }
                    return;
                }
                EngineState::Stopped => return,
            }
        };

        info!("Stopping rule engine");
        let _ = self.inner.shutdown_tx.send(());
        if let Err(e) = consumer.await {
            error!(error = %e, "Rule engine executor failed");
        }
    }

    /// Whether the executor task is running
    pub fn is_active(&self) -> bool {
        matches!(&*self.lock_state(), EngineState::Started { consumer, .. } if !consumer.is_finished())
    }

    /// Run `f` on the executor and return its result
    ///
    /// Must not be awaited from inside a rule callback; callbacks already
    /// hold the runtime. Before start, a call made while another inline call
    /// runs fails with [`EngineError::Busy`].
    pub async fn call_sync<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RuleRuntime) -> T + Send + 'static,
    {
        let route = {
            let mut state = self.lock_state();
            match &mut *state {
                EngineState::Created { runtime, .. } => {
                    Route::Inline(runtime.take().ok_or(EngineError::Busy)?)
                }
                EngineState::Started { jobs, .. } => Route::Queue(jobs.clone()),
                EngineState::Stopped => return Err(EngineError::NotRunning),
            }
        };
        let jobs = match route {
            Route::Inline(runtime) => {
                let mut inline = InlineRuntime {
                    engine: self,
                    runtime: Some(runtime),
                };
                return inline.runtime.as_deref_mut().map(f).ok_or(EngineError::Busy);
            }
            Route::Queue(jobs) => jobs,
        };

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |rt: &mut RuleRuntime| {
            let _ = tx.send(f(rt));
        });
        jobs.send(job).map_err(|_| EngineError::ExecutorGone)?;
        rx.await.map_err(|_| EngineError::ExecutorGone)
    }

    /// Signal that the initial external state has been delivered
    ///
    /// Local devices are published, pending timers and cron schedules start,
    /// and every rule is checked once.
    pub async fn mark_ready(&self) -> EngineResult<()> {
        self.call_sync(RuleRuntime::on_ready).await
    }

    pub async fn is_ready(&self) -> EngineResult<bool> {
        self.call_sync(|rt| rt.is_ready()).await
    }

    #[instrument(skip(self, def))]
    pub async fn define_rule(&self, name: &str, def: RuleDef) -> EngineResult<RuleId> {
        let name = name.to_string();
        self.call_sync(move |rt| rt.define_rule(&name, def)).await?
    }

    pub async fn define_virtual_device(&self, name: &str, def: VirtualDeviceDef) -> EngineResult<()> {
        let name = name.to_string();
        self.call_sync(move |rt| rt.define_virtual_device(&name, &def)).await?
    }

    pub async fn load_script<F>(&self, id: &str, script: F) -> EngineResult<()>
    where
        F: FnOnce(&mut RuleRuntime) -> EngineResult<()> + Send + 'static,
    {
        let id = id.to_string();
        self.call_sync(move |rt| rt.load_script(&id, script)).await?
    }

    /// Clean, reload, refresh and announce a script in one executor turn
    pub async fn live_load_script<F>(&self, id: &str, script: F) -> EngineResult<()>
    where
        F: FnOnce(&mut RuleRuntime) -> EngineResult<()> + Send + 'static,
    {
        let id = id.to_string();
        self.call_sync(move |rt| rt.live_load_script(&id, script)).await?
    }

    pub async fn live_remove_script(&self, id: &str) -> EngineResult<()> {
        let id = id.to_string();
        self.call_sync(move |rt| rt.live_remove_script(&id)).await
    }

    pub async fn refresh(&self) -> EngineResult<()> {
        self.call_sync(RuleRuntime::refresh).await
    }

    pub async fn run_rules(&self, cell: Option<CellSpec>, timer: Option<String>) -> EngineResult<()> {
        self.call_sync(move |rt| rt.run_rules(cell.as_ref(), timer.as_deref()))
            .await
    }

    pub async fn enable_rule(&self, name: &str) -> EngineResult<()> {
        let name = name.to_string();
        self.call_sync(move |rt| rt.enable_rule(&name)).await?
    }

    pub async fn disable_rule(&self, name: &str) -> EngineResult<()> {
        let name = name.to_string();
        self.call_sync(move |rt| rt.disable_rule(&name)).await?
    }

    /// Run a rule's action regardless of its condition
    pub async fn run_rule(&self, name: &str) -> EngineResult<Option<CellValue>> {
        let name = name.to_string();
        self.call_sync(move |rt| rt.run_rule(&name)).await?
    }

    pub async fn trigger_cron(&self, spec: &str) -> EngineResult<()> {
        let spec = spec.to_string();
        self.call_sync(move |rt| rt.trigger_cron(&spec)).await
    }

    pub async fn value(&self, spec: CellSpec) -> EngineResult<CellValue> {
        self.call_sync(move |rt| rt.value(&spec)).await
    }

    pub async fn set_value(&self, spec: CellSpec, value: CellValue) -> EngineResult<bool> {
        self.call_sync(move |rt| rt.set_value(&spec, value)).await
    }

    /// Inbound value from the transport
    pub async fn accept_value(&self, spec: CellSpec, raw: impl Into<String>) -> EngineResult<()> {
        let raw = raw.into();
        self.call_sync(move |rt| rt.accept_value(&spec, &raw)).await
    }

    /// Inbound control type from the transport
    pub async fn accept_control_type(
        &self,
        spec: CellSpec,
        control_type: impl Into<ControlType>,
    ) -> EngineResult<()> {
        let control_type = control_type.into();
        self.call_sync(move |rt| rt.accept_control_type(&spec, control_type))
            .await
    }

    /// Inbound range max from the transport
    pub async fn accept_control_max(&self, spec: CellSpec, max: f64) -> EngineResult<()> {
        self.call_sync(move |rt| rt.accept_control_max(&spec, max)).await
    }
}

enum Route {
    Inline(Box<RuleRuntime>),
    Queue(JobSender),
}

/// Runtime lent out to an inline call; handed back on drop, also when the
/// call unwinds
struct InlineRuntime<'a> {
    engine: &'a RuleEngine,
    runtime: Option<Box<RuleRuntime>>,
}

impl Drop for InlineRuntime<'_> {
    fn drop(&mut self) {
        let Some(mut runtime) = self.runtime.take() else {
            return;
        };
        let mut state = self.engine.lock_state();
        match &mut *state {
            EngineState::Created { runtime: slot, .. } => *slot = Some(runtime),
            _ => {
                drop(state);
                debug!("Engine stopped during an inline call");
                runtime.handle_stop();
            }
        }
    }
}

async fn run_executor(
    mut runtime: Box<RuleRuntime>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    mut shutdown: broadcast::Receiver<()>,
    bus: SharedChangeBus,
    subscriber: SubscriberId,
) {
    debug!("Rule engine executor running");
    loop {
        tokio::select! {
            // changes posted by a job are handled before the next job
            biased;

            _ = shutdown.recv() => {
                info!("Received shutdown signal");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) if runtime.is_ready() => runtime.handle_change(&event),
                    Some(event) => {
                        trace!(device = %event.device, cell = %event.cell, "Discarding change before ready");
                    }
                    None => {
                        info!("Change bus closed, stopping rule engine");
                        break;
                    }
                }
            }
            Some(job) = jobs.recv() => job(&mut *runtime),
        }
    }

    runtime.handle_stop();
    bus.unsubscribe(subscriber);
    info!("Rule engine stopped");
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrules_cell_model::NullTransport;

    fn engine() -> RuleEngine {
        RuleEngine::new(Arc::new(NullTransport), EngineOptions::default())
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let engine = engine();
        assert!(!engine.is_active());

        engine.start();
        assert!(engine.is_active());
        engine.start();

        engine.stop().await;
        assert!(!engine.is_active());
        assert!(matches!(engine.refresh().await, Err(EngineError::NotRunning)));
    }

    #[tokio::test]
    async fn test_calls_run_inline_before_start() {
        let engine = engine();
        let spec: CellSpec = "dev/cell".parse().unwrap();
        engine.accept_value(spec.clone(), "12").await.unwrap();
        let raw = engine
            .call_sync(move |rt| rt.model().cell_by_spec(&spec).map(|c| c.raw_value().to_string()))
            .await
            .unwrap();
        assert_eq!(raw.as_deref(), Some("12"));
    }

    #[test]
    fn test_stop_before_start() {
        let engine = engine();
        tokio_test::block_on(engine.stop());
        assert!(!engine.is_active());
        assert!(matches!(
            tokio_test::block_on(engine.is_ready()),
            Err(EngineError::NotRunning)
        ));
    }

    #[test]
    fn test_inline_call_can_use_engine_handle() {
        let engine = engine();
        let handle = engine.clone();
        let (active, nested) = tokio_test::block_on(engine.call_sync(move |_| {
            let active = handle.is_active();
            let mut nested = tokio_test::task::spawn(handle.call_sync(|rt| rt.revision()));
            (active, tokio_test::assert_ready!(nested.poll()))
        }))
        .unwrap();
        assert!(!active);
        assert!(matches!(nested, Err(EngineError::Busy)));

        let rev = tokio_test::block_on(engine.call_sync(|rt| rt.revision()));
        assert_eq!(rev.unwrap(), 0);
    }

    #[test]
    fn test_stop_during_inline_call() {
        let engine = engine();
        let handle = engine.clone();
        tokio_test::block_on(engine.call_sync(move |_| {
            let mut stop = tokio_test::task::spawn(handle.stop());
            tokio_test::assert_ready!(stop.poll());
        }))
        .unwrap();
        assert!(matches!(
            tokio_test::block_on(engine.is_ready()),
            Err(EngineError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_call_sync_after_start() {
        let engine = engine();
        engine.start();
        engine.mark_ready().await.unwrap();
        assert!(engine.is_ready().await.unwrap());
        let rev = engine.call_sync(|rt| rt.revision()).await.unwrap();
        engine.refresh().await.unwrap();
        assert_eq!(engine.call_sync(|rt| rt.revision()).await.unwrap(), rev + 1);
        engine.stop().await;
    }
}
