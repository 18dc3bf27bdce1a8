//! Shared state store adapter.
//!
//! The manager, the background workers it spawns and the repository batcher
//! coordinate through a hash-of-hashes key/value store. Only single-key
//! updates are atomic, except for [`SharedStore::run_script`] which evaluates
//! a closure over every record matching a pattern inside one atomic section.
//!
//! Two adapters are provided:
//! - [`SqliteStore`]: a SQLite database file shared between processes.
//! - [`MemoryStore`]: an in-process store with fault injection, for tests.

mod memory;
mod record;
mod sqlite;

pub use memory::MemoryStore;
pub use record::{WorkerRecord, fields, format_timestamp};
pub use sqlite::SqliteStore;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::{Error, Result};

/// The field map of one stored hash.
pub type Record = BTreeMap<String, String>;

/// A message published on a control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    /// Monotonically increasing id, used as the subscriber cursor.
    pub id: i64,
    pub channel: String,
    pub payload: String,
}

/// Closure type evaluated by [`SharedStore::run_script`].
pub type Script<'a> = dyn FnMut(&mut ScriptView) -> Result<()> + Send + 'a;

/// Typed access to the external hash-of-hashes store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Enumerate keys matching a glob pattern, sorted.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Set several fields of one key atomically.
    async fn hset_many(&self, key: &str, fields: &[(&str, &str)]) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// All fields of `key`; empty when the key does not exist.
    async fn hgetall(&self, key: &str) -> Result<Record>;

    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    /// Remove `key`; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(!self.hgetall(key).await?.is_empty())
    }

    /// Run `script` atomically over the records matching `pattern`.
    ///
    /// Changes made through the [`ScriptView`] are committed only when the
    /// script returns `Ok`. The script may be re-run on contention, so it must
    /// reset any state it captures before writing to it.
    async fn run_script(&self, pattern: &str, script: &mut Script<'_>) -> Result<()>;

    /// Publish a message on a channel; returns the message id.
    async fn publish(&self, channel: &str, payload: &str) -> Result<i64>;

    /// Messages on `channel` with an id greater than `after_id`, oldest first.
    async fn poll_messages(
        &self,
        channel: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoreMessage>>;

    /// Id of the newest message on `channel`, 0 if there is none.
    async fn last_message_id(&self, channel: &str) -> Result<i64>;
}

/// Compile a key glob, rejecting malformed patterns.
pub(crate) fn compile_pattern(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern)
        .map_err(|e| Error::validation(format!("invalid key pattern '{}': {}", pattern, e)))
}

/// Escape glob metacharacters so `literal` matches only itself.
pub fn escape_glob(literal: &str) -> String {
    glob::Pattern::escape(literal)
}

/// Snapshot of the records a script operates on.
///
/// Writes are restricted to keys matching the script pattern, since only those
/// were loaded and will be written back.
#[derive(Debug)]
pub struct ScriptView {
    pattern: glob::Pattern,
    records: BTreeMap<String, Record>,
    dirty: BTreeSet<String>,
}

impl ScriptView {
    pub(crate) fn new(pattern: glob::Pattern, records: BTreeMap<String, Record>) -> Self {
        Self {
            pattern,
            records,
            dirty: BTreeSet::new(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn hget(&self, key: &str, field: &str) -> Option<&str> {
        self.records
            .get(key)
            .and_then(|r| r.get(field))
            .map(String::as_str)
    }

    pub fn hset(&mut self, key: &str, field: &str, value: impl Into<String>) -> Result<()> {
        self.check_key(key)?;
        self.records
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
        self.dirty.insert(key.to_string());
        Ok(())
    }

    pub fn hdel(&mut self, key: &str, field: &str) -> Result<()> {
        self.check_key(key)?;
        if let Some(record) = self.records.get_mut(key)
            && record.remove(field).is_some()
        {
            if record.is_empty() {
                self.records.remove(key);
            }
            self.dirty.insert(key.to_string());
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.check_key(key)?;
        if self.records.remove(key).is_some() {
            self.dirty.insert(key.to_string());
        }
        Ok(())
    }

    fn check_key(&self, key: &str) -> Result<()> {
        if self.pattern.matches(key) {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "script key '{}' is outside of pattern '{}'",
                key,
                self.pattern.as_str()
            )))
        }
    }

    /// Changed keys with their new content (`None` = deleted).
    pub(crate) fn into_changes(mut self) -> Vec<(String, Option<Record>)> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .map(|key| {
                let record = self.records.remove(&key);
                (key, record)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ScriptView {
        let mut records = BTreeMap::new();
        records.insert(
            "createrepo_batched::/d::1".to_string(),
            Record::from([("task".to_string(), "{}".to_string())]),
        );
        ScriptView::new(compile_pattern("createrepo_batched::/d::*").unwrap(), records)
    }

    #[test]
    fn test_script_view_tracks_changes() {
        let mut view = view();
        view.hset("createrepo_batched::/d::2", "task", "{}").unwrap();
        view.delete("createrepo_batched::/d::1").unwrap();

        let changes = view.into_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].0, "createrepo_batched::/d::1");
        assert!(changes[0].1.is_none());
        assert!(changes[1].1.is_some());
    }

    #[test]
    fn test_script_view_rejects_foreign_keys() {
        let mut view = view();
        let err = view.hset("rpm_build_worker:1", "delete", "1").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_hdel_last_field_removes_key() {
        let mut view = view();
        view.hdel("createrepo_batched::/d::1", "task").unwrap();
        assert!(!view.contains("createrepo_batched::/d::1"));
        assert_eq!(view.into_changes().len(), 1);
    }

    #[test]
    fn test_escape_glob() {
        let pattern = compile_pattern(&format!("{}::*", escape_glob("/results/a[1]"))).unwrap();
        assert!(pattern.matches("/results/a[1]::77"));
        assert!(!pattern.matches("/results/a1::77"));
    }
}
