use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Process-local stand-in for an external TTL key-value service.
///
/// Entries expire lazily: a read past the deadline removes the entry and
/// reports a miss, so expiry needs no background sweep. Handed around as an
/// injected handle, never a global, so tests can construct their own.
pub struct TtlCache {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl TtlCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.entries.lock();
        match guard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set_ex(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        let mut guard = self.entries.lock();
        guard.insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn del(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_del() {
        let cache = TtlCache::new();
        cache.set_ex("k", "v", Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        cache.del("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn entries_expire_without_delete() {
        let cache = TtlCache::new();
        cache.set_ex("k", "v", Duration::from_millis(20));
        assert!(cache.get("k").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn overwrite_resets_ttl() {
        let cache = TtlCache::new();
        cache.set_ex("k", "old", Duration::from_millis(20));
        cache.set_ex("k", "new", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("k").as_deref(), Some("new"));
    }
}
