//! Rule conditions
//!
//! A rule definition names exactly one trigger source: a level-triggered
//! `when` thunk, an edge-triggered `as_soon_as` thunk, a list of
//! `when_changed` sources, or a cron spec. [`RuleDef::into_parts`] validates
//! the combination and turns it into a [`RuleCondition`].

use cellrules_core::{CellSpec, CellValue};
use serde::Serialize;

use crate::error::{ActionError, EngineError, EngineResult};
use crate::runtime::RuleRuntime;

/// Boolean condition thunk
pub type ConditionFn = Box<dyn FnMut(&mut RuleRuntime) -> bool + Send>;

/// Value-producing thunk watched by `when_changed`
pub type ValueFn = Box<dyn FnMut(&mut RuleRuntime) -> Option<CellValue> + Send>;

/// Rule action; the returned value is handed back to direct callers
pub type ActionFn =
    Box<dyn FnMut(&mut RuleRuntime, &ActionArgs) -> Result<Option<CellValue>, ActionError> + Send>;

/// Structured arguments passed to an action
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell: Option<String>,
    #[serde(rename = "newValue", skip_serializing_if = "Option::is_none")]
    pub new_value: Option<CellValue>,
}

impl ActionArgs {
    /// Arguments for a firing caused by a change of `spec`
    pub fn for_cell(spec: &CellSpec, value: CellValue) -> Self {
        Self {
            device: Some(spec.device().to_string()),
            cell: Some(spec.cell().to_string()),
            new_value: Some(value),
        }
    }

    /// Arguments carrying only a value computed by the condition
    pub fn with_value(value: CellValue) -> Self {
        Self {
            new_value: Some(value),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.device.is_none() && self.cell.is_none() && self.new_value.is_none()
    }

    /// Argument map as JSON, e.g. `{"device": "d", "cell": "c", "newValue": 1}`
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// One entry of a `when_changed` list
pub enum ChangeSource {
    /// A "device/cell" address
    Cell(String),
    /// A thunk whose return value is compared between passes
    Func(ValueFn),
}

/// Condition strategy of a rule
pub enum RuleCondition {
    /// Fires whenever the thunk returns true
    Level(ConditionFn),
    /// Fires on a false to true transition of the thunk
    Edge { cond: ConditionFn, prev: bool },
    /// Fires when the bound cell is complete and its value changed
    CellChanged { spec: CellSpec, old: Option<CellValue> },
    /// Fires when the thunk's value changed
    FuncChanged { thunk: ValueFn, old: Option<CellValue> },
    /// Fires when any of the inner conditions fires
    Any(Vec<RuleCondition>),
    /// Never polled; fired by the cron table
    Cron(String),
    /// Left behind by a redefined or removed rule
    Destroyed,
}

impl RuleCondition {
    /// Decide whether the rule fires
    ///
    /// `cell` is the cell whose change caused this pass, if any. The second
    /// element of the result is a value that replaces the cell-derived
    /// arguments of the action.
    ///
    /// # Panics
    ///
    /// Panics when invoked on a destroyed condition.
    pub fn check(&mut self, rt: &mut RuleRuntime, cell: Option<&CellSpec>) -> (bool, Option<CellValue>) {
        match self {
            RuleCondition::Level(cond) => (cond(rt), None),
            RuleCondition::Edge { cond, prev } => {
                let current = cond(rt);
                let fire = current && current != *prev;
                *prev = current;
                (fire, None)
            }
            RuleCondition::CellChanged { spec, old } => {
                if cell != Some(&*spec) {
                    return (false, None);
                }
                let Some(c) = rt.model().cell_by_spec(spec) else {
                    return (false, None);
                };
                if !c.is_complete() {
                    tracing::debug!(cell = %spec, "Skipping rule due to incomplete cell");
                    return (false, None);
                }
                let value = c.value();
                if old.as_ref() == Some(&value) && !c.is_button() {
                    return (false, None);
                }
                *old = Some(value);
                (true, None)
            }
            RuleCondition::FuncChanged { thunk, old } => {
                let value = thunk(rt);
                if *old == value {
                    return (false, None);
                }
                *old = value.clone();
                (true, value)
            }
            RuleCondition::Any(conds) => {
                for cond in conds.iter_mut() {
                    let (fire, value) = cond.check(rt, cell);
                    if fire {
                        return (true, value);
                    }
                }
                (false, None)
            }
            RuleCondition::Cron(_) => (false, None),
            RuleCondition::Destroyed => panic!("invoking a destroyed rule"),
        }
    }

    /// Cells the condition is bound to regardless of what it reads
    pub fn known_cells(&self) -> Vec<CellSpec> {
        match self {
            RuleCondition::CellChanged { spec, .. } => vec![spec.clone()],
            RuleCondition::Any(conds) => conds.iter().flat_map(RuleCondition::known_cells).collect(),
            _ => Vec::new(),
        }
    }

    pub fn cron_spec(&self) -> Option<&str> {
        match self {
            RuleCondition::Cron(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, RuleCondition::Destroyed)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RuleCondition::Level(_) => "when",
            RuleCondition::Edge { .. } => "asSoonAs",
            RuleCondition::CellChanged { .. } => "whenChanged(cell)",
            RuleCondition::FuncChanged { .. } => "whenChanged(func)",
            RuleCondition::Any(_) => "whenChanged(any)",
            RuleCondition::Cron(_) => "cron",
            RuleCondition::Destroyed => "destroyed",
        }
    }
}

/// A rule definition as supplied by a script
#[derive(Default)]
pub struct RuleDef {
    pub when: Option<ConditionFn>,
    pub as_soon_as: Option<ConditionFn>,
    pub when_changed: Vec<ChangeSource>,
    pub cron: Option<String>,
    pub then: Option<ActionFn>,
}

impl RuleDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, cond: impl FnMut(&mut RuleRuntime) -> bool + Send + 'static) -> Self {
        self.when = Some(Box::new(cond));
        self
    }

    pub fn as_soon_as(mut self, cond: impl FnMut(&mut RuleRuntime) -> bool + Send + 'static) -> Self {
        self.as_soon_as = Some(Box::new(cond));
        self
    }

    pub fn when_changed(mut self, spec: impl Into<String>) -> Self {
        self.when_changed.push(ChangeSource::Cell(spec.into()));
        self
    }

    pub fn when_changed_fn(
        mut self,
        thunk: impl FnMut(&mut RuleRuntime) -> Option<CellValue> + Send + 'static,
    ) -> Self {
        self.when_changed.push(ChangeSource::Func(Box::new(thunk)));
        self
    }

    pub fn cron(mut self, spec: impl Into<String>) -> Self {
        self.cron = Some(spec.into());
        self
    }

    pub fn then(
        mut self,
        action: impl FnMut(&mut RuleRuntime, &ActionArgs) -> Result<Option<CellValue>, ActionError>
            + Send
            + 'static,
    ) -> Self {
        self.then = Some(Box::new(action));
        self
    }

    /// Validate the definition and split it into condition and action
    pub fn into_parts(self, name: &str) -> EngineResult<(RuleCondition, ActionFn)> {
        let has_when = self.when.is_some();
        let has_as_soon_as = self.as_soon_as.is_some();
        let has_when_changed = !self.when_changed.is_empty();
        let has_cron = self.cron.is_some();

        let Some(action) = self.then else {
            return Err(EngineError::invalid_rule(name, "no then"));
        };

        let cond = if let Some(cond) = self.when {
            if has_as_soon_as || has_when_changed || has_cron {
                return Err(EngineError::invalid_rule(
                    name,
                    "cannot combine 'when' with 'asSoonAs', 'whenChanged' or 'cron'",
                ));
            }
            RuleCondition::Level(cond)
        } else if let Some(cond) = self.as_soon_as {
            if has_when_changed || has_cron {
                return Err(EngineError::invalid_rule(
                    name,
                    "cannot combine 'asSoonAs' with 'whenChanged' or 'cron'",
                ));
            }
            RuleCondition::Edge { cond, prev: false }
        } else if has_when_changed {
            if has_cron {
                return Err(EngineError::invalid_rule(
                    name,
                    "cannot combine 'whenChanged' with cron spec",
                ));
            }
            let mut conds = self
                .when_changed
                .into_iter()
                .map(|source| single_change_condition(name, source))
                .collect::<EngineResult<Vec<_>>>()?;
            if conds.len() == 1 {
                conds.remove(0)
            } else {
                RuleCondition::Any(conds)
            }
        } else if let Some(spec) = self.cron {
            RuleCondition::Cron(spec)
        } else {
            return Err(EngineError::invalid_rule(
                name,
                "must provide one of 'when', 'asSoonAs', 'whenChanged' or 'cron'",
            ));
        };

        Ok((cond, action))
    }
}

fn single_change_condition(name: &str, source: ChangeSource) -> EngineResult<RuleCondition> {
    match source {
        ChangeSource::Cell(spec) => {
            let parsed: CellSpec = spec.parse().map_err(|_| {
                EngineError::invalid_rule(name, format!("invalid whenChanged spec: '{}'", spec))
            })?;
            Ok(RuleCondition::CellChanged {
                spec: parsed,
                old: None,
            })
        }
        ChangeSource::Func(thunk) => Ok(RuleCondition::FuncChanged { thunk, old: None }),
    }
}
