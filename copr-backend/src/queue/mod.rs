//! Mutable priority queue of pending tasks.
//!
//! A binary min-heap ordered by `(priority, sequence)` plus a map from task
//! identity to the sequence of its live entry. Re-adding or removing a task
//! turns its old entry into a tombstone, which `pop` discards lazily.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::task::QueueTask;
use crate::{Error, Result};

#[derive(Debug)]
enum Slot<T> {
    Task(Box<T>),
    Removed,
}

/// Priority queue with add-or-update and lazy removal.
#[derive(Debug)]
pub struct JobQueue<T> {
    heap: BinaryHeap<Reverse<(i64, u64)>>,
    slots: HashMap<u64, Slot<T>>,
    live: HashMap<String, u64>,
    counter: u64,
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
            live: HashMap::new(),
            counter: 0,
        }
    }
}

impl<T: QueueTask> JobQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `task`, replacing any live entry with the same identity.
    pub fn add(&mut self, task: T, priority: i64) {
        let id = task.id();
        if let Some(old) = self.live.remove(&id) {
            self.slots.insert(old, Slot::Removed);
        }
        let seq = self.counter;
        self.counter += 1;
        self.slots.insert(seq, Slot::Task(Box::new(task)));
        self.live.insert(id, seq);
        self.heap.push(Reverse((priority, seq)));
    }

    /// Mark the live entry of `task` as removed.
    pub fn remove(&mut self, task: &T) -> Result<()> {
        self.remove_id(&task.id())
    }

    pub fn remove_id(&mut self, task_id: &str) -> Result<()> {
        let seq = self
            .live
            .remove(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        self.slots.insert(seq, Slot::Removed);
        Ok(())
    }

    /// Take the task with the smallest `(priority, sequence)`.
    pub fn pop(&mut self) -> Result<T> {
        while let Some(Reverse((_, seq))) = self.heap.pop() {
            if let Some(Slot::Task(task)) = self.slots.remove(&seq) {
                self.live.remove(&task.id());
                return Ok(*task);
            }
        }
        Err(Error::QueueEmpty)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
        self.live.clear();
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.live.contains_key(task_id)
    }

    /// The queued task with this identity, if any.
    pub fn get(&self, task_id: &str) -> Option<&T> {
        let seq = self.live.get(task_id)?;
        match self.slots.get(seq) {
            Some(Slot::Task(task)) => Some(task),
            _ => None,
        }
    }

    /// Number of live (non-tombstone) entries.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq)]
    struct Named(String);

    impl QueueTask for Named {
        fn id(&self) -> String {
            self.0.clone()
        }
    }

    fn named(id: &str) -> Named {
        Named(id.to_string())
    }

    fn drain(queue: &mut JobQueue<Named>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(task) = queue.pop() {
            out.push(task.0);
        }
        out
    }

    #[test]
    fn test_pop_empty() {
        let mut queue: JobQueue<Named> = JobQueue::new();
        assert!(matches!(queue.pop(), Err(Error::QueueEmpty)));
    }

    #[test]
    fn test_update_in_place() {
        let mut queue = JobQueue::new();
        queue.add(named("A"), 10);
        queue.add(named("B"), 5);
        queue.add(named("A"), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(drain(&mut queue), vec!["A", "B"]);
    }

    #[test]
    fn test_fifo_on_equal_priority() {
        let mut queue = JobQueue::new();
        for id in ["c", "a", "b"] {
            queue.add(named(id), 0);
        }
        assert_eq!(drain(&mut queue), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_remove() {
        let mut queue = JobQueue::new();
        queue.add(named("A"), 0);
        queue.add(named("B"), 1);
        queue.remove(&named("A")).unwrap();
        assert!(!queue.contains("A"));
        assert!(matches!(queue.remove_id("A"), Err(Error::TaskNotFound(_))));
        assert_eq!(drain(&mut queue), vec!["B"]);
    }

    #[test]
    fn test_clear() {
        let mut queue = JobQueue::new();
        queue.add(named("A"), 0);
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.pop().is_err());
        queue.add(named("B"), 0);
        assert_eq!(queue.get("B"), Some(&named("B")));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, i8),
        Remove(u8),
        Pop,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u8..8, any::<i8>()).prop_map(|(id, prio)| Op::Add(id, prio)),
            1 => (0u8..8).prop_map(Op::Remove),
            1 => Just(Op::Pop),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Distinct priorities pop in ascending order.
        #[test]
        fn prop_pops_in_priority_order(prios in proptest::collection::btree_set(any::<i32>(), 1..50)) {
            let mut queue = JobQueue::new();
            let prios: Vec<i64> = prios.into_iter().map(i64::from).rev().collect();
            for (i, prio) in prios.iter().enumerate() {
                queue.add(named(&i.to_string()), *prio);
            }
            let mut popped = Vec::new();
            while let Ok(task) = queue.pop() {
                let idx: usize = task.0.parse().unwrap();
                popped.push(prios[idx]);
            }
            let mut sorted = prios.clone();
            sorted.sort();
            prop_assert_eq!(popped, sorted);
        }

        /// The queue agrees with a model map after any interleaving of operations,
        /// and `pop` never yields a removed task.
        #[test]
        fn prop_matches_model(ops in proptest::collection::vec(op_strategy(), 0..100)) {
            let mut queue = JobQueue::new();
            // id -> (priority, sequence)
            let mut model: BTreeMap<String, (i64, u64)> = BTreeMap::new();
            let mut seq = 0u64;

            for op in ops {
                match op {
                    Op::Add(id, prio) => {
                        queue.add(named(&id.to_string()), i64::from(prio));
                        model.insert(id.to_string(), (i64::from(prio), seq));
                        seq += 1;
                    }
                    Op::Remove(id) => {
                        let expected = model.remove(&id.to_string()).is_some();
                        prop_assert_eq!(queue.remove_id(&id.to_string()).is_ok(), expected);
                    }
                    Op::Pop => {
                        let expected = model
                            .iter()
                            .min_by_key(|(_, key)| **key)
                            .map(|(id, _)| id.clone());
                        match (queue.pop(), expected) {
                            (Ok(task), Some(id)) => {
                                prop_assert_eq!(&task.0, &id);
                                model.remove(&id);
                            }
                            (Err(Error::QueueEmpty), None) => {}
                            (got, want) => prop_assert!(false, "pop {:?} vs model {:?}", got, want),
                        }
                    }
                }
                prop_assert_eq!(queue.len(), model.len());
            }
        }

        /// A re-added task pops exactly once, at its latest priority.
        #[test]
        fn prop_readd_pops_once(p1 in any::<i16>(), p2 in any::<i16>(), other in any::<i16>()) {
            let mut queue = JobQueue::new();
            queue.add(named("t"), i64::from(p1));
            queue.add(named("o"), i64::from(other));
            queue.add(named("t"), i64::from(p2));
            let order = drain(&mut queue);
            prop_assert_eq!(order.iter().filter(|id| *id == "t").count(), 1);
            // "o" was inserted before the second add of "t", so it wins ties.
            let t_first = i64::from(p2) < i64::from(other);
            prop_assert_eq!(order[0] == "t", t_first);
        }
    }
}
