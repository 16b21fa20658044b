//! Process-local flag store.
//!
//! The first storage tier: a mutex-guarded map from flag name to its
//! attribute fields, with per-flag TTL expiry swept lazily on each
//! access. Callers treat the store as opaque; only the registry and the
//! invalidation listener touch it.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

struct FlagEntry {
    fields: BTreeMap<String, String>,
    expires_at: Instant,
}

/// In-process cache of flag attribute fields.
pub struct LocalStore {
    entries: Mutex<HashMap<String, FlagEntry>>,
    ttl: Duration,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Read one attribute of a flag.
    pub fn get(&self, name: &str, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.get(name).and_then(|e| e.fields.get(key).cloned())
    }

    /// Read a flag's whole field map.
    pub fn get_fields(&self, name: &str) -> Option<BTreeMap<String, String>> {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.get(name).map(|e| e.fields.clone())
    }

    /// Write one attribute, refreshing the flag's expiry.
    pub fn set(&self, name: &str, key: &str, value: &str) {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        let expires_at = Instant::now() + self.ttl;
        let entry = entries.entry(name.to_string()).or_insert_with(|| FlagEntry {
            fields: BTreeMap::new(),
            expires_at,
        });
        entry.fields.insert(key.to_string(), value.to_string());
        entry.expires_at = expires_at;
    }

    /// Replace a flag's whole field map, refreshing its expiry.
    pub fn set_fields(&self, name: &str, fields: BTreeMap<String, String>) {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.insert(
            name.to_string(),
            FlagEntry {
                fields,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn delete(&self, name: &str) {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.remove(name);
    }

    pub fn exists(&self, name: &str) -> bool {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.contains_key(name)
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries);
        entries.keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn sweep(entries: &mut HashMap<String, FlagEntry>) {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}
