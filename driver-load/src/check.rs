use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::client::HttpResponse;

pub const STATUS_200: &str = "is status 200";

type Predicate = Arc<dyn Fn(&HttpResponse) -> bool + Send + Sync>;

#[derive(Clone)]
struct Check {
    name: Arc<str>,
    predicate: Predicate,
}

/// Named assertions evaluated, in registration order, against every response.
#[derive(Clone, Default)]
pub struct CheckSet {
    checks: Vec<Check>,
}

impl CheckSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_ok() -> Self {
        Self::new().with(STATUS_200, |r| r.status == 200)
    }

    /// Registers `predicate` under `name`, replacing any check already using that name.
    pub fn with<F>(mut self, name: impl Into<Arc<str>>, predicate: F) -> Self
    where
        F: Fn(&HttpResponse) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        self.checks.retain(|c| c.name != name);
        self.checks.push(Check {
            name,
            predicate: Arc::new(predicate),
        });
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.checks.iter().map(|c| &*c.name)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

impl fmt::Debug for CheckSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub name: Arc<str>,
    pub passed: bool,
}

#[derive(Default)]
struct Tally {
    passes: AtomicU64,
    fails: AtomicU64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

impl CheckSummary {
    pub fn total(&self) -> u64 {
        self.passes + self.fails
    }
}

/// Pass/fail counters per check name, shared by every virtual user.
#[derive(Default)]
pub struct CheckRecorder {
    tallies: DashMap<Arc<str>, Tally>,
}

impl CheckRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates every check in `checks` against `response`. A failing check is counted, never raised.
    pub fn record(&self, response: &HttpResponse, checks: &CheckSet) -> Vec<CheckResult> {
        checks
            .checks
            .iter()
            .map(|check| {
                let passed = (check.predicate)(response);
                self.count(&check.name, passed);
                CheckResult {
                    name: check.name.clone(),
                    passed,
                }
            })
            .collect()
    }

    fn count(&self, name: &Arc<str>, passed: bool) {
        // Fast path avoids taking the shard write lock once the name is known.
        if let Some(tally) = self.tallies.get(name) {
            tally.bump(passed);
            return;
        }
        self.tallies.entry(name.clone()).or_default().bump(passed);
    }

    pub fn summary(&self, name: &str) -> Option<CheckSummary> {
        self.tallies.get(name).map(|t| t.summary(name))
    }

    /// Snapshot of every counter, sorted by check name.
    pub fn summaries(&self) -> Vec<CheckSummary> {
        let mut out: Vec<_> = self
            .tallies
            .iter()
            .map(|entry| entry.value().summary(entry.key()))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn total_recorded(&self) -> u64 {
        self.tallies
            .iter()
            .map(|entry| entry.value().summary(entry.key()).total())
            .sum()
    }
}

impl Tally {
    fn bump(&self, passed: bool) {
        let counter = if passed { &self.passes } else { &self.fails };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self, name: &str) -> CheckSummary {
        CheckSummary {
            name: name.to_owned(),
            passes: self.passes.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
        }
    }
}
