//! Cell Rule Engine
//!
//! This crate evaluates rules against the cell model. A rule ties a
//! condition to an action; the engine learns which cells and timers each
//! condition reads and re-checks a rule only when one of them changes.
//!
//! # Architecture
//!
//! ```text
//! transport ──► CellModel ──► ChangeBus ──► executor ──► RuleRuntime::run_rules
//!                                              ▲
//!                 timers, cron, call_sync ─────┘
//! ```
//!
//! - **Conditions**: level (`when`), edge (`as_soon_as`), value change
//!   (`when_changed`) or cron
//! - **Scoped cleanup**: everything a script defines is undone when the
//!   script is reloaded or removed
//! - **Executor**: one task owns all state; every operation is a job on it
//!
//! # Key Types
//!
//! - [`RuleEngine`] - Thread-safe handle to the executor
//! - [`RuleRuntime`] - Executor-owned state handed to rule callbacks
//! - [`RuleDef`] - Rule definition supplied by a script
//! - [`DeviceProxy`] / [`CellProxy`] - Handles that survive reloads

pub mod cleanup;
pub mod condition;
mod cron;
mod deps;
pub mod engine;
pub mod error;
pub mod proxy;
mod rule;
pub mod runtime;
pub mod timer;

pub use cleanup::{run_all_cleanups, run_cleanups, CleanupFn, CleanupOwner, ScopedCleanup};
pub use condition::{ActionArgs, ActionFn, ChangeSource, ConditionFn, RuleCondition, RuleDef, ValueFn};
pub use engine::{EngineOptions, RuleEngine};
pub use error::{ActionError, EngineError, EngineResult};
pub use proxy::{CellProxy, DeviceProxy, Resolve};
pub use rule::RuleId;
pub use runtime::RuleRuntime;
pub use timer::{TimerFn, TimerId};
