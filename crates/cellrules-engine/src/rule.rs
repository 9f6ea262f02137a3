//! Rules: a named condition tied to an action

use std::fmt;

use crate::condition::{ActionFn, RuleCondition};

/// Identity of one rule definition
///
/// A redefinition under the same name gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub(crate) u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A defined rule
///
/// The condition and action are taken out while they run, so a rule whose
/// parts are absent is currently executing further up the stack.
pub(crate) struct Rule {
    pub id: RuleId,
    pub name: String,
    pub cond: Option<RuleCondition>,
    pub action: Option<ActionFn>,
    pub should_check: bool,
    pub enabled: bool,
    /// Cleanup scope active when the rule was defined
    pub scope: Option<String>,
    cron: Option<String>,
}

impl Rule {
    pub fn new(
        id: RuleId,
        name: &str,
        cond: RuleCondition,
        action: ActionFn,
        scope: Option<String>,
    ) -> Self {
        let cron = cond.cron_spec().map(str::to_string);
        Self {
            id,
            name: name.to_string(),
            cond: Some(cond),
            action: Some(action),
            // a new rule is checked on the next pass of any kind
            should_check: true,
            enabled: true,
            scope,
            cron,
        }
    }

    /// Cron spec of a cron-triggered rule
    pub fn cron_spec(&self) -> Option<&str> {
        self.cron.as_deref()
    }

    pub fn is_cron(&self) -> bool {
        self.cron.is_some()
    }

    pub fn known_cells(&self) -> Vec<cellrules_core::CellSpec> {
        self.cond
            .as_ref()
            .map(RuleCondition::known_cells)
            .unwrap_or_default()
    }

    /// Replace the condition with one that panics if invoked and release
    /// the action
    pub fn destroy(&mut self) {
        self.cond = Some(RuleCondition::Destroyed);
        self.action = None;
        self.should_check = false;
        self.enabled = false;
    }
}
