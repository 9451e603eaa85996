use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, PartialOrd, PartialEq, Eq, Clone)]
struct TimerKey {
    task_id: u64,
    execute_at: Instant,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.execute_at.cmp(&other.execute_at)
    }
}

/// A BTreeMap-backed timer wheel keyed by expiry instant, shared by
/// every transaction so a single background task can poll all of them
/// instead of spawning a sleep per timer.
pub struct Timer<T> {
    tasks: RwLock<BTreeMap<TimerKey, T>>,
    id_to_tasks: RwLock<HashMap<u64, Instant>>,
    last_task_id: AtomicU64,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            id_to_tasks: RwLock::new(HashMap::new()),
            last_task_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, execute_at: Instant, value: T) -> u64 {
        let task_id = self.last_task_id.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .write()
            .unwrap()
            .insert(TimerKey { task_id, execute_at }, value);
        self.id_to_tasks.write().unwrap().insert(task_id, execute_at);
        task_id
    }

    pub fn cancel(&self, task_id: u64) -> Option<T> {
        let position = { self.id_to_tasks.write().unwrap().remove(&task_id) };
        position.and_then(|execute_at| self.tasks.write().unwrap().remove(&TimerKey { task_id, execute_at }))
    }

    /// Removes and returns every task whose expiry is `<= now`.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut result = Vec::new();
        let keys_to_remove = {
            let mut tasks = self.tasks.write().unwrap();
            let keys_to_remove = tasks
                .range(..=TimerKey { task_id: u64::MAX, execute_at: now })
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();

            if keys_to_remove.is_empty() {
                return result;
            }
            result.reserve(keys_to_remove.len());
            for key in keys_to_remove.iter() {
                if let Some(value) = tasks.remove(key) {
                    result.push(value);
                }
            }
            keys_to_remove
        };
        {
            let mut id_to_tasks = self.id_to_tasks.write().unwrap();
            for key in keys_to_remove {
                id_to_tasks.remove(&key.task_id);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_removes_pending_task() {
        let timer: Timer<&str> = Timer::new();
        let now = Instant::now();
        let task_id = timer.timeout_at(now, "task1");
        assert_eq!(timer.cancel(task_id), Some("task1"));
        assert_eq!(timer.cancel(task_id), None);
    }

    #[test]
    fn poll_only_returns_expired_tasks() {
        let timer: Timer<&str> = Timer::new();
        let now = Instant::now();
        timer.timeout_at(now, "task2");
        assert_eq!(timer.poll(now + Duration::from_secs(1)).len(), 1);

        timer.timeout_at(now + Duration::from_millis(1001), "task3");
        assert_eq!(timer.poll(now + Duration::from_secs(1)).len(), 0);
        assert_eq!(timer.len(), 1);
    }
}
