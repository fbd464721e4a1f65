use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry {
    data: Arc<Vec<u8>>,
    inserted: Instant,
}

/// Decoded file contents keyed by stored name, bounded by age and total size.
pub struct ReadCache {
    ttl: Duration,
    max_bytes: u64,
    used: u64,
    entries: HashMap<String, Entry>,
}

impl ReadCache {
    pub fn new(ttl: Duration, max_bytes: u64) -> Self {
        Self {
            ttl,
            max_bytes,
            used: 0,
            entries: HashMap::new(),
        }
    }

    /// Expired entries are dropped on access.
    pub fn get(&mut self, name: &str) -> Option<Arc<Vec<u8>>> {
        let expired = self.entries.get(name)?.inserted.elapsed() >= self.ttl;
        if expired {
            self.invalidate(name);
            return None;
        }
        self.entries.get(name).map(|entry| Arc::clone(&entry.data))
    }

    /// Stores `data`, evicting the oldest entries until it fits. Payloads
    /// larger than the whole budget are not cached at all.
    pub fn insert(&mut self, name: &str, data: Arc<Vec<u8>>) {
        self.invalidate(name);
        let size = data.len() as u64;
        if size > self.max_bytes {
            return;
        }
        while self.used + size > self.max_bytes {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(name, _)| name.clone())
            else {
                break;
            };
            self.invalidate(&oldest);
        }
        self.used += size;
        self.entries.insert(
            name.to_string(),
            Entry {
                data,
                inserted: Instant::now(),
            },
        );
    }

    pub fn invalidate(&mut self, name: &str) -> bool {
        match self.entries.remove(name) {
            Some(entry) => {
                self.used -= entry.data.len() as u64;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used
    }
}
