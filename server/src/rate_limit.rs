//! Sliding-window rate limiting keyed by (client identity, action).
//!
//! Windows live behind [`WindowStore`] so the backing can be swapped by
//! configuration. Each admission is a read-modify-write serialized by the
//! store's lock; windows are pruned lazily on every check.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use screenreel_common::config::{ActionLimits, Config, RateStoreKind};

use crate::error::StoreError;

/// Timestamps (unix milliseconds) of admitted actions, oldest first.
pub type Window = Vec<i64>;

/// Backend holding every key's window.
pub trait WindowStore: Send + Sync {
    /// Run `update` on the window for `key` while holding the store's lock
    /// and persist whatever it leaves behind. Returns `update`'s verdict.
    ///
    /// Other keys whose newest stamp is at or before `stale_before` are
    /// dropped in the same pass, so idle clients do not accumulate.
    fn with_window(
        &self,
        key: &str,
        stale_before: i64,
        update: &mut dyn FnMut(&mut Window) -> bool,
    ) -> std::io::Result<bool>;
}

fn drop_stale(windows: &mut HashMap<String, Window>, stale_before: i64) {
    windows.retain(|_, w| w.last().is_some_and(|&t| t > stale_before));
}

/// Process-local windows.
#[derive(Default)]
pub struct MemoryWindowStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl WindowStore for MemoryWindowStore {
    fn with_window(
        &self,
        key: &str,
        stale_before: i64,
        update: &mut dyn FnMut(&mut Window) -> bool,
    ) -> std::io::Result<bool> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| std::io::Error::other("rate-limit lock poisoned"))?;
        let mut window = windows.remove(key).unwrap_or_default();
        drop_stale(&mut windows, stale_before);
        let verdict = update(&mut window);
        if !window.is_empty() {
            windows.insert(key.to_string(), window);
        }
        Ok(verdict)
    }
}

/// Windows persisted as one JSON document, rewritten atomically.
///
/// Serialization is per process; concurrent writers from other processes
/// may lose an update, which only loosens the limit slightly.
pub struct JsonFileWindowStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileWindowStore {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn read(&self) -> std::io::Result<HashMap<String, Window>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Discarding unreadable rate-limit state {}: {e}", self.path.display());
                HashMap::new()
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }

    fn write(&self, windows: &HashMap<String, Window>) -> std::io::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(windows)?)?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl WindowStore for JsonFileWindowStore {
    fn with_window(
        &self,
        key: &str,
        stale_before: i64,
        update: &mut dyn FnMut(&mut Window) -> bool,
    ) -> std::io::Result<bool> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| std::io::Error::other("rate-limit lock poisoned"))?;

        let mut windows = self.read()?;
        let mut window = windows.remove(key).unwrap_or_default();
        let before = windows.len();
        drop_stale(&mut windows, stale_before);
        if windows.len() < before {
            debug!("Dropped {} idle rate-limit windows", before - windows.len());
        }
        let verdict = update(&mut window);
        if !window.is_empty() {
            windows.insert(key.to_string(), window);
        }
        self.write(&windows)?;
        Ok(verdict)
    }
}

/// Store mutations that are rate limited, each with its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitedAction {
    Upload,
    Delete,
    Rename,
    Clean,
}

impl LimitedAction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::Clean => "clean_old",
        }
    }

    pub fn limit(self, limits: &ActionLimits) -> u32 {
        match self {
            Self::Upload => limits.upload,
            Self::Delete => limits.delete,
            Self::Rename => limits.rename,
            Self::Clean => limits.clean,
        }
    }
}

/// Opaque window key; the raw identity never reaches the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateKey(String);

impl RateKey {
    pub fn new(identity: &str, action: &str) -> Self {
        let digest = Sha256::digest(format!("{identity}_{action}").as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self { store }
    }

    /// Build the limiter with the backend named in the config.
    pub fn from_config(config: &Config) -> std::io::Result<Self> {
        let store: Arc<dyn WindowStore> = match config.rate_store {
            RateStoreKind::File => {
                let path = config.rate_limit_file();
                info!("Rate-limit windows persisted in {}", path.display());
                Arc::new(JsonFileWindowStore::new(&path)?)
            }
            RateStoreKind::Memory => {
                info!("Rate-limit windows kept in memory");
                Arc::new(MemoryWindowStore::default())
            }
        };
        Ok(Self::new(store))
    }

    /// Admit one more event for `key` if fewer than `limit` happened within
    /// the trailing `window`.
    pub fn admit(&self, key: &RateKey, limit: u32, window: Duration) -> Result<bool, StoreError> {
        self.admit_at(key, limit, window, Utc::now())
    }

    /// [`admit`](Self::admit) against an explicit clock.
    pub fn admit_at(
        &self,
        key: &RateKey,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now_ms = now.timestamp_millis();
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let stale_before = now_ms.saturating_sub(window_ms);

        let admitted = self.store.with_window(key.as_str(), stale_before, &mut |stamps| {
            stamps.retain(|&t| t > stale_before);
            if stamps.len() >= limit as usize {
                return false;
            }
            stamps.push(now_ms);
            true
        })?;

        if !admitted {
            debug!("Rate limit hit for key {}", &key.as_str()[..12]);
        }
        Ok(admitted)
    }

    /// Admit a store mutation from `identity` under the configured budget.
    pub fn admit_action(
        &self,
        identity: &str,
        action: LimitedAction,
        limits: &ActionLimits,
    ) -> Result<(), StoreError> {
        let key = RateKey::new(identity, action.name());
        if self.admit(&key, action.limit(limits), limits.window)? {
            Ok(())
        } else {
            warn!(identity, action = action.name(), "Rate limit exceeded");
            Err(StoreError::RateLimited)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn memory() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryWindowStore::default()))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_limit_plus_one_is_refused() {
        let limiter = memory();
        let key = RateKey::new("10.0.0.1", "upload");
        for i in 0..20 {
            assert!(limiter.admit_at(&key, 20, HOUR, at(i)).unwrap(), "call {i}");
        }
        assert!(!limiter.admit_at(&key, 20, HOUR, at(30)).unwrap());
    }

    #[test]
    fn test_window_slides() {
        let limiter = memory();
        let key = RateKey::new("10.0.0.1", "delete");
        assert!(limiter.admit_at(&key, 2, HOUR, at(0)).unwrap());
        assert!(limiter.admit_at(&key, 2, HOUR, at(600)).unwrap());
        assert!(!limiter.admit_at(&key, 2, HOUR, at(3599)).unwrap());
        // The first stamp leaves the window, freeing exactly one slot.
        assert!(limiter.admit_at(&key, 2, HOUR, at(3600)).unwrap());
        assert!(!limiter.admit_at(&key, 2, HOUR, at(3601)).unwrap());
        // Both remaining stamps expire.
        assert!(limiter.admit_at(&key, 2, HOUR, at(7300)).unwrap());
    }

    #[test]
    fn test_refusals_are_not_recorded() {
        let limiter = memory();
        let key = RateKey::new("10.0.0.1", "upload");
        assert!(limiter.admit_at(&key, 1, HOUR, at(0)).unwrap());
        for i in 1..50 {
            assert!(!limiter.admit_at(&key, 1, HOUR, at(i)).unwrap());
        }
        // Only the single admitted event counts toward expiry.
        assert!(limiter.admit_at(&key, 1, HOUR, at(3600)).unwrap());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = memory();
        let upload = RateKey::new("10.0.0.1", "upload");
        let delete = RateKey::new("10.0.0.1", "delete");
        let other = RateKey::new("10.0.0.2", "upload");
        assert!(limiter.admit_at(&upload, 1, HOUR, at(0)).unwrap());
        assert!(!limiter.admit_at(&upload, 1, HOUR, at(1)).unwrap());
        assert!(limiter.admit_at(&delete, 1, HOUR, at(1)).unwrap());
        assert!(limiter.admit_at(&other, 1, HOUR, at(1)).unwrap());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("rate_limit.json");
        let key = RateKey::new("10.0.0.1", "upload");

        let first = RateLimiter::new(Arc::new(JsonFileWindowStore::new(&path).unwrap()));
        assert!(first.admit_at(&key, 2, HOUR, at(0)).unwrap());
        assert!(first.admit_at(&key, 2, HOUR, at(1)).unwrap());

        let reopened = RateLimiter::new(Arc::new(JsonFileWindowStore::new(&path).unwrap()));
        assert!(!reopened.admit_at(&key, 2, HOUR, at(2)).unwrap());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("10.0.0.1"));
    }

    #[test]
    fn test_file_store_drops_idle_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rate_limit.json");
        let limiter = RateLimiter::new(Arc::new(JsonFileWindowStore::new(&path).unwrap()));
        let stored_keys = || -> Vec<String> {
            let raw = std::fs::read(&path).unwrap();
            let windows: HashMap<String, Window> = serde_json::from_slice(&raw).unwrap();
            let mut keys: Vec<String> = windows.into_keys().collect();
            keys.sort();
            keys
        };

        let idle = RateKey::new("10.0.0.1", "upload");
        let recent = RateKey::new("10.0.0.2", "upload");
        let active = RateKey::new("10.0.0.3", "upload");
        assert!(limiter.admit_at(&idle, 5, HOUR, at(0)).unwrap());
        assert!(limiter.admit_at(&recent, 5, HOUR, at(3000)).unwrap());
        assert_eq!(stored_keys().len(), 2);

        // An hour past the idle key, only keys still inside the window survive.
        assert!(limiter.admit_at(&active, 5, HOUR, at(6000)).unwrap());
        let mut expected = vec![recent.as_str().to_string(), active.as_str().to_string()];
        expected.sort();
        assert_eq!(stored_keys(), expected);
    }

    #[test]
    fn test_memory_store_drops_idle_keys() {
        let store = MemoryWindowStore::default();
        store.with_window("old", 0, &mut |w| {
            w.push(100);
            true
        })
        .unwrap();
        store.with_window("new", 0, &mut |w| {
            w.push(200);
            true
        })
        .unwrap();
        store.with_window("new", 150, &mut |_| true).unwrap();
        let windows = store.windows.lock().unwrap();
        assert!(!windows.contains_key("old"));
        assert_eq!(windows["new"], vec![200]);
    }

    #[test]
    fn test_file_store_recovers_from_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rate_limit.json");
        std::fs::write(&path, b"{not json").unwrap();

        let limiter = RateLimiter::new(Arc::new(JsonFileWindowStore::new(&path).unwrap()));
        assert!(limiter
            .admit_at(&RateKey::new("a", "upload"), 1, HOUR, at(0))
            .unwrap());
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_limit() {
        let limiter = memory();
        let key = RateKey::new("10.0.0.1", "upload");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| limiter.admit_at(&key, 20, HOUR, at(0)).unwrap())
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 20);
    }

    #[test]
    fn test_admit_action_uses_per_action_budget() {
        let limiter = memory();
        let limits = ActionLimits {
            upload: 1,
            delete: 2,
            ..ActionLimits::default()
        };
        limiter.admit_action("ip", LimitedAction::Upload, &limits).unwrap();
        assert!(matches!(
            limiter.admit_action("ip", LimitedAction::Upload, &limits),
            Err(StoreError::RateLimited)
        ));
        limiter.admit_action("ip", LimitedAction::Delete, &limits).unwrap();
        limiter.admit_action("ip", LimitedAction::Delete, &limits).unwrap();
    }
}
