//! In-process store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Record, Script, ScriptView, SharedStore, StoreMessage, compile_pattern};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct MemoryInner {
    hashes: BTreeMap<String, Record>,
    messages: Vec<StoreMessage>,
    next_message_id: i64,
}

/// A [`SharedStore`] kept in memory, shared by cloning an `Arc`.
///
/// [`MemoryStore::set_available`] simulates an unreachable store: every
/// operation then fails with [`Error::StoreUnavailable`].
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored keys, regardless of availability.
    pub fn len(&self) -> usize {
        self.inner.lock().hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::store("memory store marked unavailable"))
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let pattern = compile_pattern(pattern)?;
        let inner = self.inner.lock();
        Ok(inner
            .hashes
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hset_many(key, &[(field, value)]).await
    }

    async fn hset_many(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        self.ensure_available()?;
        let mut inner = self.inner.lock();
        let record = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            record.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).and_then(|r| r.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<Record> {
        self.ensure_available()?;
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.ensure_available()?;
        let mut inner = self.inner.lock();
        let now_empty = match inner.hashes.get_mut(key) {
            Some(record) => {
                record.remove(field);
                record.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.hashes.remove(key);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.inner.lock().hashes.remove(key).is_some())
    }

    async fn run_script(&self, pattern: &str, script: &mut Script<'_>) -> Result<()> {
        self.ensure_available()?;
        let compiled = compile_pattern(pattern)?;

        // One guard for load, evaluation and write-back.
        let mut inner = self.inner.lock();
        let loaded: BTreeMap<String, Record> = inner
            .hashes
            .iter()
            .filter(|(k, _)| compiled.matches(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut view = ScriptView::new(compiled, loaded);
        script(&mut view)?;

        for (key, record) in view.into_changes() {
            match record {
                Some(record) => {
                    inner.hashes.insert(key, record);
                }
                None => {
                    inner.hashes.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<i64> {
        self.ensure_available()?;
        let mut inner = self.inner.lock();
        inner.next_message_id += 1;
        let id = inner.next_message_id;
        inner.messages.push(StoreMessage {
            id,
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(id)
    }

    async fn poll_messages(
        &self,
        channel: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoreMessage>> {
        self.ensure_available()?;
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.channel == channel && m.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn last_message_id(&self, channel: &str) -> Result<i64> {
        self.ensure_available()?;
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .iter()
            .rev()
            .find(|m| m.channel == channel)
            .map(|m| m.id)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_operations() {
        let store = MemoryStore::new();
        store.hset("worker:1", "allocated", "10").await.unwrap();
        store
            .hset_many("worker:1", &[("started", "1"), ("PID", "77")])
            .await
            .unwrap();

        let all = store.hgetall("worker:1").await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(
            store.hget("worker:1", "PID").await.unwrap().as_deref(),
            Some("77")
        );
        assert!(store.exists("worker:1").await.unwrap());

        store.hdel("worker:1", "PID").await.unwrap();
        assert_eq!(store.hget("worker:1", "PID").await.unwrap(), None);

        assert!(store.delete("worker:1").await.unwrap());
        assert!(!store.delete("worker:1").await.unwrap());
        assert!(store.hgetall("worker:1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_glob() {
        let store = MemoryStore::new();
        store.hset("rpm_build_worker:1", "a", "1").await.unwrap();
        store.hset("rpm_build_worker:2", "a", "1").await.unwrap();
        store.hset("action_worker:1", "a", "1").await.unwrap();

        let keys = store.keys("rpm_build_worker:*").await.unwrap();
        assert_eq!(keys, vec!["rpm_build_worker:1", "rpm_build_worker:2"]);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.keys("*").await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        store.set_available(true);
        assert!(store.keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_script_rolls_back_on_error() {
        let store = MemoryStore::new();
        store.hset("batch::1", "task", "{}").await.unwrap();

        let result = store
            .run_script("batch::*", &mut |view: &mut ScriptView| {
                view.delete("batch::1")?;
                Err(Error::Other("abort".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert!(store.exists("batch::1").await.unwrap());
    }

    #[tokio::test]
    async fn test_messages_cursor() {
        let store = MemoryStore::new();
        let first = store.publish("control", "a").await.unwrap();
        store.publish("other", "x").await.unwrap();
        store.publish("control", "b").await.unwrap();

        let msgs = store.poll_messages("control", 0, 10).await.unwrap();
        assert_eq!(msgs.len(), 2);
        let msgs = store.poll_messages("control", first, 10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, "b");
        assert_eq!(store.last_message_id("control").await.unwrap(), 3);
    }
}
