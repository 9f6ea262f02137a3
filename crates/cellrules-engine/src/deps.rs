//! Dependency tracker
//!
//! Records which cells and named timers a rule's condition touched while it
//! was evaluated, and keeps the maps used to pick candidate rules when a
//! cell changes or a timer fires.

use cellrules_core::CellSpec;
use indexmap::IndexSet;
use std::collections::{HashMap, HashSet};
use tracing::{trace, warn};

use crate::rule::RuleId;

#[derive(Default)]
struct Noted {
    cells: IndexSet<CellSpec>,
    timers: IndexSet<String>,
}

#[derive(Default)]
struct RuleDeps {
    cells: Vec<CellSpec>,
    timers: Vec<String>,
}

/// Outcome of committing the noted dependencies of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredDeps {
    /// At least one cell or timer is associated with the rule
    Tracked,
    /// Nothing was noted and the rule was already checked on every pass
    Untracked,
    /// Nothing was noted; the rule is checked on every pass from now on
    BecameUntracked,
}

#[derive(Default)]
pub(crate) struct DepTracker {
    noted: Option<Noted>,
    cell_rules: HashMap<CellSpec, Vec<RuleId>>,
    timer_rules: HashMap<String, Vec<RuleId>>,
    by_rule: HashMap<RuleId, RuleDeps>,
    without_deps: HashSet<RuleId>,
}

impl DepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the noted sets and turn tracking on
    pub fn start_tracking(&mut self) {
        self.noted = Some(Noted::default());
    }

    /// Drop whatever was noted and turn tracking off
    pub fn stop_tracking(&mut self) {
        self.noted = None;
    }

    #[cfg(test)]
    pub fn is_tracking(&self) -> bool {
        self.noted.is_some()
    }

    pub fn note_cell(&mut self, spec: &CellSpec) {
        if let Some(noted) = self.noted.as_mut() {
            if !noted.cells.contains(spec) {
                noted.cells.insert(spec.clone());
            }
        }
    }

    pub fn note_timer(&mut self, name: &str) {
        if let Some(noted) = self.noted.as_mut() {
            if !noted.timers.contains(name) {
                noted.timers.insert(name.to_string());
            }
        }
    }

    /// Commit what was noted since [`start_tracking`](Self::start_tracking)
    ///
    /// Replaces the previous association of `rule`. `known_cells` are cells
    /// the condition is bound to regardless of what it read. Tracking is off
    /// afterwards.
    pub fn store(&mut self, rule: RuleId, rule_name: &str, known_cells: &[CellSpec]) -> StoredDeps {
        let noted = self.noted.take().unwrap_or_default();
        let was_untracked = self.without_deps.contains(&rule);
        self.forget(rule);

        let mut deps = RuleDeps::default();
        for spec in known_cells.iter().chain(noted.cells.iter()) {
            if !deps.cells.contains(spec) {
                deps.cells.push(spec.clone());
            }
        }
        deps.timers.extend(noted.timers);

        if deps.cells.is_empty() && deps.timers.is_empty() {
            self.without_deps.insert(rule);
            if was_untracked {
                return StoredDeps::Untracked;
            }
            warn!(rule = %rule_name, "Rule doesn't use any cells inside condition functions");
            return StoredDeps::BecameUntracked;
        }

        for spec in &deps.cells {
            trace!(rule = %rule_name, cell = %spec, "Adding cell dependency");
            self.cell_rules.entry(spec.clone()).or_default().push(rule);
        }
        for timer in &deps.timers {
            trace!(rule = %rule_name, timer = %timer, "Adding timer dependency");
            self.timer_rules.entry(timer.clone()).or_default().push(rule);
        }
        self.by_rule.insert(rule, deps);
        StoredDeps::Tracked
    }

    /// Seed a rule with the cells it is bound to, without touching the
    /// dependency-less set
    pub fn seed(&mut self, rule: RuleId, known_cells: &[CellSpec]) {
        if known_cells.is_empty() {
            return;
        }
        let deps = self.by_rule.entry(rule).or_default();
        for spec in known_cells {
            if !deps.cells.contains(spec) {
                deps.cells.push(spec.clone());
                self.cell_rules.entry(spec.clone()).or_default().push(rule);
            }
        }
    }

    /// Drop every association of `rule`
    pub fn forget(&mut self, rule: RuleId) {
        self.without_deps.remove(&rule);
        let Some(deps) = self.by_rule.remove(&rule) else {
            return;
        };
        for spec in deps.cells {
            if let Some(list) = self.cell_rules.get_mut(&spec) {
                list.retain(|id| *id != rule);
                if list.is_empty() {
                    self.cell_rules.remove(&spec);
                }
            }
        }
        for timer in deps.timers {
            if let Some(list) = self.timer_rules.get_mut(&timer) {
                list.retain(|id| *id != rule);
                if list.is_empty() {
                    self.timer_rules.remove(&timer);
                }
            }
        }
    }

    /// Drop all associations
    pub fn clear(&mut self) {
        self.cell_rules.clear();
        self.timer_rules.clear();
        self.by_rule.clear();
        self.without_deps.clear();
    }

    pub fn rules_for_cell(&self, spec: &CellSpec) -> &[RuleId] {
        self.cell_rules.get(spec).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rules_for_timer(&self, name: &str) -> &[RuleId] {
        self.timer_rules.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rules_without_deps(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.without_deps.iter().copied()
    }

    #[cfg(test)]
    pub fn is_without_deps(&self, rule: RuleId) -> bool {
        self.without_deps.contains(&rule)
    }
}
