use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

struct Timer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Per-key quiescence timers. Each `trigger` restarts the key's window; only
/// the latest trigger's action runs once the window elapses undisturbed.
pub struct Debouncer<K> {
    window: Duration,
    timers: Arc<Mutex<HashMap<K, Timer>>>,
    generation: AtomicU64,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn trigger<F, Fut>(&self, key: K, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut timers = lock(&self.timers);
        if let Some(previous) = timers.insert(
            key.clone(),
            Timer {
                generation,
                handle: None,
            },
        ) && let Some(handle) = previous.handle
        {
            handle.abort();
        }

        let shared = Arc::clone(&self.timers);
        let window = self.window;
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let current = {
                let mut timers = lock(&shared);
                let current = timers
                    .get(&task_key)
                    .is_some_and(|timer| timer.generation == generation);
                if current {
                    timers.remove(&task_key);
                }
                current
            };
            if current {
                action().await;
            }
        });
        if let Some(timer) = timers.get_mut(&key) {
            timer.handle = Some(handle);
        }
    }

    /// Keys whose window has not elapsed yet.
    pub fn pending(&self) -> usize {
        lock(&self.timers).len()
    }

    pub fn cancel_all(&self) {
        for (_, timer) in lock(&self.timers).drain() {
            if let Some(handle) = timer.handle {
                handle.abort();
            }
        }
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        let mut timers = self
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, timer) in timers.drain() {
            if let Some(handle) = timer.handle {
                handle.abort();
            }
        }
    }
}

fn lock<K>(timers: &Mutex<HashMap<K, Timer>>) -> MutexGuard<'_, HashMap<K, Timer>> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
