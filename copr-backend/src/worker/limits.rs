//! Concurrency limits checked before a popped task is dispatched.
//!
//! Each limit keeps statistics about the tasks *currently processed* by
//! workers, not about queued tasks. A task that would cross a limit is simply
//! dropped from the queue; the dispatcher re-adds it on the next frontend pull.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Statistics over running workers, consulted at dispatch time.
pub trait WorkerLimit<T>: Send + Sync {
    /// Account `task`, processed by `worker_id`.
    fn worker_added(&mut self, worker_id: &str, task: &T);

    /// Forget `worker_id`; no-op for unknown workers.
    fn worker_removed(&mut self, worker_id: &str);

    /// Whether `task` can start without crossing the limit.
    fn check(&self, task: &T) -> bool;

    fn clear(&mut self);

    /// Human-readable description for logs.
    fn info(&self) -> String;
}

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type Hasher<T> = Box<dyn Fn(&T) -> Option<String> + Send + Sync>;

/// Caps the number of running tasks matching a predicate.
pub struct PredicateWorkerLimit<T> {
    name: String,
    limit: usize,
    predicate: Predicate<T>,
    refs: BTreeSet<String>,
}

impl<T> PredicateWorkerLimit<T> {
    pub fn new(
        name: impl Into<String>,
        limit: usize,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            limit,
            predicate: Box::new(predicate),
            refs: BTreeSet::new(),
        }
    }
}

impl<T> WorkerLimit<T> for PredicateWorkerLimit<T> {
    fn worker_added(&mut self, worker_id: &str, task: &T) {
        if (self.predicate)(task) {
            self.refs.insert(worker_id.to_string());
        }
    }

    fn worker_removed(&mut self, worker_id: &str) {
        self.refs.remove(worker_id);
    }

    fn check(&self, task: &T) -> bool {
        !(self.predicate)(task) || self.refs.len() < self.limit
    }

    fn clear(&mut self) {
        self.refs.clear();
    }

    fn info(&self) -> String {
        if self.refs.is_empty() {
            return format!("'{}'", self.name);
        }
        let matching: Vec<&str> = self.refs.iter().map(String::as_str).collect();
        format!("'{}', matching: {}", self.name, matching.join(", "))
    }
}

/// Groups tasks by a key and caps the number of running tasks per group.
///
/// Tasks the hasher maps to `None` are never limited.
pub struct HashWorkerLimit<T> {
    name: String,
    limit: usize,
    hasher: Hasher<T>,
    refs: HashMap<String, String>,
    groups: BTreeMap<String, usize>,
}

impl<T> HashWorkerLimit<T> {
    pub fn new(
        name: impl Into<String>,
        limit: usize,
        hasher: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            limit,
            hasher: Box::new(hasher),
            refs: HashMap::new(),
            groups: BTreeMap::new(),
        }
    }

    pub fn count(&self, group: &str) -> usize {
        self.groups.get(group).copied().unwrap_or(0)
    }
}

impl<T> WorkerLimit<T> for HashWorkerLimit<T> {
    fn worker_added(&mut self, worker_id: &str, task: &T) {
        if self.refs.contains_key(worker_id) {
            return;
        }
        let Some(group) = (self.hasher)(task) else {
            return;
        };
        *self.groups.entry(group.clone()).or_default() += 1;
        self.refs.insert(worker_id.to_string(), group);
    }

    fn worker_removed(&mut self, worker_id: &str) {
        let Some(group) = self.refs.remove(worker_id) else {
            return;
        };
        if let Some(count) = self.groups.get_mut(&group) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.groups.remove(&group);
            }
        }
    }

    fn check(&self, task: &T) -> bool {
        match (self.hasher)(task) {
            Some(group) => self.count(&group) < self.limit,
            None => true,
        }
    }

    fn clear(&mut self) {
        self.refs.clear();
        self.groups.clear();
    }

    fn info(&self) -> String {
        let counter: Vec<String> = self
            .groups
            .iter()
            .map(|(group, count)| format!("{}={}", group, count))
            .collect();
        format!("'{}', counter: {}", self.name, counter.join(", "))
    }
}
