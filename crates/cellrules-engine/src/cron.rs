//! Cron table
//!
//! Maps cron specs to the rules scheduled by them. The whole table is torn
//! down and rebuilt from the current rule set on every refresh; each rebuild
//! bumps a generation number so that fire jobs queued by a previous table
//! are recognized and dropped.

use chrono::Utc;
use cron::Schedule;
use indexmap::IndexMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::runtime::{JobSender, RuleRuntime};

#[derive(Default)]
pub(crate) struct CronTable {
    generation: u64,
    entries: IndexMap<String, Vec<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CronTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stop all schedules and forget every entry
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.entries.clear();
        self.generation += 1;
    }

    /// Schedule `rule` under `spec`, starting a task for a new spec
    ///
    /// An unparsable spec is logged and not scheduled.
    pub fn add(&mut self, spec: &str, rule: &str, jobs: &JobSender) {
        if let Some(rules) = self.entries.get_mut(spec) {
            if !rules.iter().any(|r| r == rule) {
                rules.push(rule.to_string());
            }
            return;
        }

        let schedule = match Schedule::from_str(spec) {
            Ok(schedule) => schedule,
            Err(e) => {
                error!(rule = %rule, spec = %spec, error = %e, "Invalid cron spec");
                return;
            }
        };

        debug!(rule = %rule, spec = %spec, "Adding cron entry");
        self.entries.insert(spec.to_string(), vec![rule.to_string()]);
        self.tasks.push(spawn_cron_task(
            self.generation,
            spec.to_string(),
            schedule,
            jobs.clone(),
        ));
    }

    /// Rules scheduled under `spec` by the table of `generation`
    pub fn rules_for(&self, generation: u64, spec: &str) -> Vec<String> {
        if generation != self.generation {
            trace!(spec = %spec, "Ignoring cron fire from a previous table");
            return Vec::new();
        }
        self.entries.get(spec).cloned().unwrap_or_default()
    }

    pub fn specs(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

impl Drop for CronTable {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn spawn_cron_task(generation: u64, spec: String, schedule: Schedule, jobs: JobSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut upcoming = schedule.upcoming(Utc);
        while let Some(next) = upcoming.next() {
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            let fired = spec.clone();
            let job = Box::new(move |rt: &mut RuleRuntime| rt.fire_cron(generation, &fired));
            if jobs.send(job).is_err() {
                break;
            }
        }
    })
}
