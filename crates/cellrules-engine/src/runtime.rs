//! Executor-owned rule runtime
//!
//! [`RuleRuntime`] owns the cell model together with all rule and timer
//! state. It is only ever touched from the engine's executor task; user
//! callbacks receive it as `&mut RuleRuntime`.

use cellrules_cell_model::{Cell, CellModel, MetaUpdate, ScriptUpdate};
use cellrules_core::{CellDef, CellSpec, CellValue, ChangeEvent, ControlType, VirtualDeviceDef};
use indexmap::IndexMap;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn, Level};

use crate::cleanup::{run_all_cleanups, run_cleanups, CleanupFn, CleanupOwner, ScopedCleanup};
use crate::condition::{ActionArgs, RuleDef};
use crate::cron::CronTable;
use crate::deps::DepTracker;
use crate::engine::EngineOptions;
use crate::error::{ActionError, EngineError, EngineResult};
use crate::proxy::{CellProxy, DeviceProxy};
use crate::rule::{Rule, RuleId};
use crate::timer::{TimerEntry, TimerFn, TimerId, TimerShared, TimerTable};

/// Unit of work run on the executor
pub(crate) type Job = Box<dyn FnOnce(&mut RuleRuntime) + Send>;

pub(crate) type JobSender = mpsc::UnboundedSender<Job>;

/// State of the rule engine as seen from the executor
pub struct RuleRuntime {
    model: CellModel,
    cleanup: ScopedCleanup<RuleRuntime>,
    rules: IndexMap<String, Rule>,
    next_rule_id: u64,
    deps: DepTracker,
    timers: TimerTable,
    cron: CronTable,
    rev: u64,
    current_timer: Option<String>,
    ready: bool,
    cleanup_on_stop: bool,
    jobs: JobSender,
}

impl CleanupOwner for RuleRuntime {
    fn cleanup_mut(&mut self) -> &mut ScopedCleanup<Self> {
        &mut self.cleanup
    }
}

impl RuleRuntime {
    pub(crate) fn new(model: CellModel, jobs: JobSender, options: &EngineOptions) -> Self {
        Self {
            model,
            cleanup: ScopedCleanup::new(),
            rules: IndexMap::new(),
            next_rule_id: 1,
            deps: DepTracker::new(),
            timers: TimerTable::new(),
            cron: CronTable::new(),
            rev: 0,
            current_timer: None,
            ready: false,
            cleanup_on_stop: options.cleanup_on_stop,
            jobs,
        }
    }

    pub(crate) fn job_sender(&self) -> JobSender {
        self.jobs.clone()
    }

    pub fn model(&self) -> &CellModel {
        &self.model
    }

    pub(crate) fn model_mut(&mut self) -> &mut CellModel {
        &mut self.model
    }

    /// Revision counter, bumped by every refresh
    pub fn revision(&self) -> u64 {
        self.rev
    }

    /// Whether the ready signal has been received
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    // ---- rules ----

    /// Define or redefine a rule
    ///
    /// A redefinition destroys the previous rule and takes over its position
    /// in the evaluation order. The rule is removed again when the current
    /// cleanup scope is cleaned.
    #[instrument(skip(self, def))]
    pub fn define_rule(&mut self, name: &str, def: RuleDef) -> EngineResult<RuleId> {
        if name.is_empty() {
            return Err(EngineError::invalid_rule(name, "empty rule name"));
        }
        let (cond, action) = def.into_parts(name)?;

        let id = RuleId(self.next_rule_id);
        self.next_rule_id += 1;
        let scope = self.cleanup.current_scope().map(str::to_string);
        let kind = cond.kind();
        let rule = Rule::new(id, name, cond, action, scope);
        let cron = rule.cron_spec().map(str::to_string);
        let known_cells = rule.known_cells();

        if let Some(old) = self.rules.get_mut(name) {
            debug!(rule = %name, old_id = %old.id, "Redefining rule");
            self.deps.forget(old.id);
            old.destroy();
        }
        self.rules.insert(name.to_string(), rule);
        self.deps.seed(id, &known_cells);

        if let Some(spec) = cron {
            if self.ready {
                self.cron.add(&spec, name, &self.jobs);
            }
        }

        let owned = name.to_string();
        self.add_cleanup(Box::new(move |rt: &mut RuleRuntime| {
            rt.remove_rule(&owned, id);
        }));

        debug!(rule = %name, rule_id = %id, condition = kind, "Defined rule");
        Ok(id)
    }

    fn remove_rule(&mut self, name: &str, id: RuleId) -> bool {
        match self.rules.get_mut(name) {
            Some(rule) if rule.id == id => {
                rule.destroy();
                self.deps.forget(id);
                self.rules.shift_remove(name);
                debug!(rule = %name, rule_id = %id, "Removed rule");
                true
            }
            _ => false,
        }
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Rule names in evaluation order
    pub fn rule_names(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    pub fn is_rule_enabled(&self, name: &str) -> Option<bool> {
        self.rules.get(name).map(|rule| rule.enabled)
    }

    pub fn enable_rule(&mut self, name: &str) -> EngineResult<()> {
        let rule = self
            .rules
            .get_mut(name)
            .ok_or_else(|| EngineError::RuleNotFound(name.to_string()))?;
        rule.enabled = true;
        rule.should_check = true;
        debug!(rule = %name, "Enabled rule");
        Ok(())
    }

    pub fn disable_rule(&mut self, name: &str) -> EngineResult<()> {
        let rule = self
            .rules
            .get_mut(name)
            .ok_or_else(|| EngineError::RuleNotFound(name.to_string()))?;
        rule.enabled = false;
        debug!(rule = %name, "Disabled rule");
        Ok(())
    }

    /// Invoke a rule's action with an empty argument bag, ignoring its
    /// condition
    #[instrument(skip(self))]
    pub fn run_rule(&mut self, name: &str) -> EngineResult<Option<CellValue>> {
        let (id, scope) = self
            .rules
            .get(name)
            .map(|rule| (rule.id, rule.scope.clone()))
            .ok_or_else(|| EngineError::RuleNotFound(name.to_string()))?;
        match self.invoke_action(name, id, scope.as_deref(), &ActionArgs::default()) {
            Some(Ok(value)) => Ok(value),
            Some(Err(source)) => Err(EngineError::Action {
                rule: name.to_string(),
                source,
            }),
            None => Ok(None),
        }
    }

    /// Evaluate rules after a cell change, a timer firing, or neither
    ///
    /// A pass caused by a cell or a timer only checks flagged rules: those
    /// depending on it plus dependency-less ones. A pass with neither checks
    /// every rule.
    pub fn run_rules(&mut self, cell: Option<&CellSpec>, timer: Option<&str>) {
        trace!(cell = ?cell.map(CellSpec::to_string), timer = ?timer, "Running rules");
        let scoped = cell.is_some() || timer.is_some();
        let mut marked: HashSet<RuleId> = HashSet::new();

        if let Some(spec) = cell {
            if let Some(c) = self.model.cell_by_spec(spec) {
                if c.is_fresh_button() {
                    trace!(cell = %spec, "Ignoring fresh button");
                    return;
                }
                if c.is_complete() {
                    marked.extend(self.deps.rules_for_cell(spec));
                }
            }
            marked.extend(self.deps.rules_without_deps());
        }
        if let Some(name) = timer {
            marked.extend(self.deps.rules_for_timer(name));
            marked.extend(self.deps.rules_without_deps());
        }
        for rule in self.rules.values_mut() {
            if marked.contains(&rule.id) {
                rule.should_check = true;
            }
        }

        let prev_timer = std::mem::replace(&mut self.current_timer, timer.map(str::to_string));
        let names: Vec<String> = self.rules.keys().cloned().collect();
        for name in &names {
            self.check_rule(name, cell, scoped);
        }
        self.current_timer = prev_timer;
    }

    fn check_rule(&mut self, name: &str, cell: Option<&CellSpec>, scoped: bool) {
        let (id, scope, mut cond) = {
            let Some(rule) = self.rules.get_mut(name) else {
                return;
            };
            if !rule.enabled || rule.is_cron() || (scoped && !rule.should_check) {
                return;
            }
            // absent while this rule is already being checked further up
            let Some(cond) = rule.cond.take() else {
                return;
            };
            (rule.id, rule.scope.clone(), cond)
        };

        self.deps.start_tracking();
        let outcome = self.in_scope(scope.as_deref(), |rt| {
            guarded("condition", name, || cond.check(rt, cell))
        });

        let Some(rule) = self.rules.get_mut(name).filter(|rule| rule.id == id) else {
            // redefined or removed while its condition ran
            self.deps.stop_tracking();
            return;
        };
        rule.cond = Some(cond);
        rule.should_check = false;
        let known_cells = rule.known_cells();
        self.deps.store(id, name, &known_cells);

        let Some((true, value)) = outcome else {
            return;
        };
        let args = match (value, cell) {
            (Some(value), _) => ActionArgs::with_value(value),
            (None, Some(spec)) => self
                .model
                .cell_by_spec(spec)
                .map(|c| ActionArgs::for_cell(spec, c.value()))
                .unwrap_or_default(),
            (None, None) => ActionArgs::default(),
        };
        self.invoke_action(name, id, scope.as_deref(), &args);
    }

    /// Run the action of rule `id`, logging failures
    ///
    /// Returns `None` when no result is available, e.g. when the action
    /// panicked.
    fn invoke_action(
        &mut self,
        name: &str,
        id: RuleId,
        scope: Option<&str>,
        args: &ActionArgs,
    ) -> Option<Result<Option<CellValue>, ActionError>> {
        let mut action = self
            .rules
            .get_mut(name)
            .filter(|rule| rule.id == id)?
            .action
            .take()?;

        debug!(rule = %name, args = %args.to_json(), "Running rule action");
        let result = self.in_scope(scope, |rt| guarded("action", name, || action(rt, args)));

        if let Some(rule) = self.rules.get_mut(name).filter(|rule| rule.id == id) {
            rule.action = Some(action);
        }
        if let Some(Err(e)) = &result {
            error!(rule = %name, error = %e, "Rule action failed");
        }
        result
    }

    fn in_scope<T>(&mut self, scope: Option<&str>, f: impl FnOnce(&mut Self) -> T) -> T {
        match scope {
            Some(scope) => {
                self.cleanup.push_scope(scope);
                let result = f(self);
                self.cleanup.pop_scope(scope);
                result
            }
            None => f(self),
        }
    }

    /// Rebuild dependency maps and cron schedules after the rule set changed
    #[instrument(skip(self))]
    pub fn refresh(&mut self) {
        self.rev += 1;
        debug!(revision = self.rev, "Refreshing rules");

        self.deps.clear();
        let seeds: Vec<(RuleId, Vec<CellSpec>)> = self
            .rules
            .values()
            .map(|rule| (rule.id, rule.known_cells()))
            .collect();
        for (id, cells) in seeds {
            self.deps.seed(id, &cells);
        }

        if self.ready {
            self.setup_cron();
            self.run_rules(None, None);
        }
    }

    fn setup_cron(&mut self) {
        self.cron.stop();
        let entries: Vec<(String, String)> = self
            .rules
            .values()
            .filter_map(|rule| rule.cron_spec().map(|spec| (spec.to_string(), rule.name.clone())))
            .collect();
        for (spec, rule) in entries {
            self.cron.add(&spec, &rule, &self.jobs);
        }
    }

    /// Specs currently scheduled in the cron table
    pub fn cron_specs(&self) -> Vec<String> {
        self.cron.specs()
    }

    pub(crate) fn fire_cron(&mut self, generation: u64, spec: &str) {
        for name in self.cron.rules_for(generation, spec) {
            let Some(rule) = self.rules.get(&name) else {
                continue;
            };
            if !rule.enabled || rule.cron_spec() != Some(spec) {
                continue;
            }
            let (id, scope) = (rule.id, rule.scope.clone());
            debug!(rule = %name, spec = %spec, "Cron rule fired");
            self.invoke_action(&name, id, scope.as_deref(), &ActionArgs::default());
        }
    }

    /// Fire the rules scheduled under `spec` as if the schedule had elapsed
    pub fn trigger_cron(&mut self, spec: &str) {
        self.fire_cron(self.cron.generation(), spec);
    }

    // ---- lifecycle ----

    pub(crate) fn on_ready(&mut self) {
        if self.ready {
            return;
        }
        info!("Rule engine ready");
        self.ready = true;
        self.model.start();

        for id in self.timers.unarmed() {
            if let Some(entry) = self.timers.get_mut(id) {
                entry.arm(id, &self.jobs);
            }
        }
        self.setup_cron();
        self.run_rules(None, None);
    }

    pub(crate) fn handle_change(&mut self, event: &ChangeEvent) {
        match event.cell_spec() {
            Some(spec) => self.run_rules(Some(&spec), None),
            None => {
                debug!(device = %event.device, "Device changed, running all rules");
                self.run_rules(None, None);
            }
        }
    }

    pub(crate) fn handle_stop(&mut self) {
        if self.cleanup_on_stop {
            info!("Running all cleanups on stop");
            run_all_cleanups(self);
        }
        let stopped = self.timers.remove_all();
        if !stopped.is_empty() {
            debug!(count = stopped.len(), "Stopped timers");
        }
        self.cron.stop();
    }

    // ---- timers ----

    /// Start a timer
    ///
    /// A non-empty `name` makes a named timer: any timer of the same name is
    /// stopped first, and firing runs the rules that checked the name. An
    /// empty name makes an anonymous timer that invokes `callback`. Timers
    /// started before the ready signal begin counting once it arrives.
    pub fn start_timer(
        &mut self,
        name: &str,
        callback: Option<TimerFn>,
        interval: Duration,
        periodic: bool,
    ) -> TimerId {
        let name = if name.is_empty() {
            None
        } else {
            self.stop_timer_by_name(name);
            Some(name.to_string())
        };
        let callback = match (&name, callback) {
            (Some(name), Some(_)) => {
                warn!(timer = %name, "Ignoring callback of a named timer");
                None
            }
            (_, callback) => callback,
        };
        let scope = self.cleanup.current_scope().map(str::to_string);
        let entry = TimerEntry::new(name.clone(), callback, interval, periodic, scope);
        let shared = entry.shared.clone();
        let id = self.timers.allocate(entry);
        debug!(timer = ?name, timer_id = %id, ?interval, periodic, "Starting timer");

        if self.ready {
            if let Some(entry) = self.timers.get_mut(id) {
                entry.arm(id, &self.jobs);
            }
        }

        self.add_cleanup(Box::new(move |rt: &mut RuleRuntime| {
            if rt.timers.current_mut(id, &shared).is_some() {
                rt.timers.remove(id);
            }
        }));
        id
    }

    /// Stop a timer by id; unknown ids are logged and ignored
    pub fn stop_timer(&mut self, id: TimerId) {
        if id.get() == 0 {
            error!("Timer id cannot be zero");
            return;
        }
        match self.timers.remove(id) {
            Some(_) => debug!(timer_id = %id, "Stopped timer"),
            None => warn!(timer_id = %id, "Trying to stop unknown timer"),
        }
    }

    pub fn stop_timer_by_name(&mut self, name: &str) {
        if let Some(id) = self.timers.find_by_name(name) {
            self.timers.remove(id);
            debug!(timer = %name, timer_id = %id, "Stopped timer");
        }
    }

    /// Whether the current pass was caused by the timer `name`
    ///
    /// Inside a condition this makes the rule depend on the timer.
    pub fn check_timer(&mut self, name: &str) -> bool {
        self.deps.note_timer(name);
        self.current_timer.as_deref() == Some(name)
    }

    /// Number of timers that are started and not stopped
    pub fn timer_count(&self) -> usize {
        self.timers.live_count()
    }

    pub(crate) fn fire_timer(&mut self, id: TimerId, shared: &Arc<TimerShared>) {
        let Some(entry) = self.timers.current_mut(id, shared) else {
            warn!(timer_id = %id, "Firing unknown timer");
            return;
        };
        if !shared.is_active() {
            debug!(timer_id = %id, "Ignoring fire of a stopped timer");
            return;
        }
        let periodic = entry.periodic;
        let scope = entry.scope.clone();
        trace!(timer = ?entry.name, timer_id = %id, "Timer fired");

        match entry.name.clone() {
            Some(name) => self.run_rules(None, Some(&name)),
            None => {
                if let Some(mut callback) = entry.callback.take() {
                    let label = id.to_string();
                    self.in_scope(scope.as_deref(), |rt| {
                        guarded("timer", &label, || callback(rt))
                    });
                    if let Some(entry) = self.timers.current_mut(id, shared) {
                        entry.callback = Some(callback);
                    }
                }
            }
        }

        if !periodic && self.timers.current_mut(id, shared).is_some() {
            self.timers.remove(id);
        }
    }

    // ---- cells ----

    /// Typed value of a cell, creating the cell if needed
    pub fn value(&mut self, spec: &CellSpec) -> CellValue {
        let key = self.model.ensure_cell(spec);
        self.deps.note_cell(spec);
        self.model
            .cell(key)
            .map(Cell::value)
            .unwrap_or_else(|| CellValue::Text(String::new()))
    }

    pub fn raw_value(&mut self, spec: &CellSpec) -> String {
        let key = self.model.ensure_cell(spec);
        self.deps.note_cell(spec);
        self.model
            .cell(key)
            .map(|c| c.raw_value().to_string())
            .unwrap_or_default()
    }

    pub fn is_complete(&mut self, spec: &CellSpec) -> bool {
        let key = self.model.ensure_cell(spec);
        self.deps.note_cell(spec);
        self.model.cell(key).is_some_and(Cell::is_complete)
    }

    /// Set a cell's value; returns whether anything was published or sent
    pub fn set_value(&mut self, spec: &CellSpec, value: impl Into<CellValue>) -> bool {
        let key = self.model.ensure_cell(spec);
        self.deps.note_cell(spec);
        self.model.set_value(key, &value.into())
    }

    pub(crate) fn note_cell(&mut self, spec: &CellSpec) {
        self.deps.note_cell(spec);
    }

    pub fn device_proxy(&self, name: &str) -> DeviceProxy {
        DeviceProxy::new(name)
    }

    pub fn cell_proxy(&self, spec: CellSpec) -> CellProxy {
        CellProxy::new(spec)
    }

    pub fn set_device_title(&mut self, device: &str, title: &str) {
        let key = self.model.ensure_device(device);
        self.model.set_title(key, title);
    }

    /// Inbound value from the transport
    pub fn accept_value(&mut self, spec: &CellSpec, raw: &str) {
        self.model.accept_value(spec, raw);
    }

    /// Inbound control type from the transport
    pub fn accept_control_type(&mut self, spec: &CellSpec, control_type: ControlType) {
        self.model.accept_control_type(spec, control_type);
    }

    /// Inbound range max from the transport
    pub fn accept_control_max(&mut self, spec: &CellSpec, max: f64) {
        self.model.accept_control_max(spec, max);
    }

    // ---- devices and scripts ----

    /// Define a local device, removed again when the current cleanup scope
    /// is cleaned
    #[instrument(skip(self, def))]
    pub fn define_virtual_device(&mut self, name: &str, def: &VirtualDeviceDef) -> EngineResult<()> {
        let key = self.model.define_local_device(name, def)?;
        let owned = name.to_string();
        self.add_cleanup(Box::new(move |rt: &mut RuleRuntime| {
            if rt.model.device_key(&owned) == Some(key) {
                rt.model.remove_local_device(&owned);
            }
        }));
        Ok(())
    }

    /// Add a cell to a local device at runtime
    ///
    /// The cell is removed again when the current cleanup scope is cleaned,
    /// unless its device is already gone.
    #[instrument(skip(self, def))]
    pub fn add_cell(&mut self, device: &str, name: &str, def: &CellDef) -> EngineResult<()> {
        self.model.add_local_cell(device, name, def)?;
        let dev_key = self.model.device_key(device);
        let (device, name) = (device.to_string(), name.to_string());
        self.add_cleanup(Box::new(move |rt: &mut RuleRuntime| {
            if rt.model.device_key(&device) != dev_key {
                return;
            }
            if let Err(e) = rt.model.remove_local_cell(&device, &name) {
                debug!(device = %device, cell = %name, error = %e, "Added cell already gone");
            }
        }));
        Ok(())
    }

    /// Remove a cell of a local device
    pub fn remove_cell(&mut self, device: &str, name: &str) -> EngineResult<()> {
        self.model.remove_local_cell(device, name)?;
        Ok(())
    }

    /// Change one metadata field of a local cell
    pub fn update_cell_meta(&mut self, spec: &CellSpec, update: MetaUpdate) -> EngineResult<()> {
        self.model.update_meta(spec, update)?;
        Ok(())
    }

    /// Register a teardown for the current cleanup scope
    pub fn add_cleanup(&mut self, cleanup: CleanupFn<RuleRuntime>) {
        self.cleanup.add_cleanup(cleanup);
    }

    /// Clean `id` and run `script` with `id` as the cleanup scope
    #[instrument(skip(self, script))]
    pub fn load_script<F>(&mut self, id: &str, script: F) -> EngineResult<()>
    where
        F: FnOnce(&mut RuleRuntime) -> EngineResult<()>,
    {
        if id.is_empty() {
            return Err(EngineError::script(id, "empty script id"));
        }
        run_cleanups(self, id);
        self.cleanup.push_scope(id);
        let result = guarded("script", id, || script(self))
            .unwrap_or_else(|| Err(EngineError::script(id, "script panicked")));
        self.cleanup.pop_scope(id);
        if let Err(e) = &result {
            error!(script = %id, error = %e, "Failed to load script");
        }
        result
    }

    /// Reload a script while the engine is running
    ///
    /// The engine is refreshed and the transport notified even when the
    /// script fails.
    pub fn live_load_script<F>(&mut self, id: &str, script: F) -> EngineResult<()>
    where
        F: FnOnce(&mut RuleRuntime) -> EngineResult<()>,
    {
        let result = self.load_script(id, script);
        self.refresh();
        self.model
            .transport()
            .script_updated(&ScriptUpdate::Changed(id.to_string()));
        info!(script = %id, "Script loaded");
        result
    }

    /// Undo everything a script defined
    #[instrument(skip(self))]
    pub fn live_remove_script(&mut self, id: &str) {
        run_cleanups(self, id);
        self.refresh();
        self.model
            .transport()
            .script_updated(&ScriptUpdate::Removed(id.to_string()));
        info!(script = %id, "Script removed");
    }

    /// Rule log output, also forwarded to the transport
    pub fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => error!(target: "cellrules::rules", "{}", message),
            Level::WARN => warn!(target: "cellrules::rules", "{}", message),
            Level::INFO => info!(target: "cellrules::rules", "{}", message),
            Level::DEBUG => debug!(target: "cellrules::rules", "{}", message),
            _ => trace!(target: "cellrules::rules", "{}", message),
        }
        self.model.transport().log_message(level, message);
    }
}

/// Run a user callback, turning a panic into a logged failure
fn guarded<T>(kind: &str, name: &str, f: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            error!(kind, name = %name, panic = %panic_message(&*payload), "Callback panicked");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
