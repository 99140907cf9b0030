//! Tests for [`ModelCache`] — admission, eviction, and budget behavior.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use munin::config::ModelCacheConfig;
use munin::{EngineReloader, ModelCache, ModelKey, ModelProvider, MuninError};

/// Writes a marker file and reports a configured size per model name.
struct MockProvider {
    sizes: HashMap<String, u64>,
    default_size: u64,
    delay: Option<Duration>,
    fail: AtomicBool,
    fetches: AtomicUsize,
}

impl MockProvider {
    fn new() -> Self {
        Self {
            sizes: HashMap::new(),
            default_size: 100,
            delay: None,
            fail: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        }
    }

    fn with_size(mut self, name: &str, size: u64) -> Self {
        self.sizes.insert(name.to_string(), size);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn fetch(&self, key: &ModelKey, dest: &Path) -> munin::Result<u64> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(MuninError::FetchFailed {
                model: key.to_string(),
                reason: "mock failure".into(),
            });
        }
        tokio::fs::create_dir_all(dest).await?;
        tokio::fs::write(dest.join("saved_model.pb"), b"mock").await?;
        Ok(self.sizes.get(&key.name).copied().unwrap_or(self.default_size))
    }
}

/// Records every resident set it is handed.
struct MockEngine {
    reloads: Mutex<Vec<Vec<ModelKey>>>,
    fail: AtomicBool,
}

impl MockEngine {
    fn new() -> Self {
        Self {
            reloads: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    fn reload_count(&self) -> usize {
        self.reloads.lock().unwrap().len()
    }

    fn last_resident(&self) -> Vec<ModelKey> {
        self.reloads.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl EngineReloader for MockEngine {
    async fn reload(&self, resident: &[ModelKey]) -> munin::Result<()> {
        self.reloads.lock().unwrap().push(resident.to_vec());
        if self.fail.load(Ordering::SeqCst) {
            return Err(MuninError::ReloadFailed("mock engine refused".into()));
        }
        Ok(())
    }
}

struct Fixture {
    cache: ModelCache,
    provider: Arc<MockProvider>,
    engine: Arc<MockEngine>,
    _dir: tempfile::TempDir,
}

fn fixture(max_bytes: u64, max_concurrent: usize, provider: MockProvider) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(provider);
    let engine = Arc::new(MockEngine::new());
    let config = ModelCacheConfig {
        host_model_path: dir.path().join("models"),
        size_bytes: max_bytes,
    };
    let cache = ModelCache::new(
        &config,
        max_concurrent,
        false,
        provider.clone(),
        engine.clone(),
    )
    .unwrap();
    Fixture {
        cache,
        provider,
        engine,
        _dir: dir,
    }
}

fn key(name: &str) -> ModelKey {
    ModelKey::new(name, "1")
}

#[tokio::test]
async fn acquire_admits_then_hits() {
    let f = fixture(1000, 2, MockProvider::new());

    let guard = f.cache.acquire(&key("a")).await.unwrap();
    drop(guard);
    assert_eq!(f.provider.fetches(), 1);
    assert_eq!(f.engine.reload_count(), 1);
    assert_eq!(f.engine.last_resident(), vec![key("a")]);

    // Second acquire is a pure hit: no fetch, no reload.
    let guard = f.cache.acquire(&key("a")).await.unwrap();
    drop(guard);
    assert_eq!(f.provider.fetches(), 1);
    assert_eq!(f.engine.reload_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cold_miss_is_single_flight() {
    let f = fixture(1000, 2, MockProvider::new().with_delay(Duration::from_millis(50)));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let cache = f.cache.clone();
        handles.push(tokio::spawn(async move {
            let guard = cache.acquire(&ModelKey::new("a", "1")).await?;
            drop(guard);
            Ok::<(), MuninError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(f.provider.fetches(), 1, "load was not single-flight");
    assert_eq!(f.engine.reload_count(), 1);
    assert_eq!(f.cache.stats().resident_models, 1);
}

#[tokio::test]
async fn eviction_under_disk_pressure_keeps_newest() {
    let f = fixture(100, 2, MockProvider::new());

    drop(f.cache.acquire(&key("a")).await.unwrap());
    assert_eq!(f.cache.stats().resident_bytes, 100);

    drop(f.cache.acquire(&key("b")).await.unwrap());
    let stats = f.cache.stats();
    assert_eq!(stats.entries, 1, "evicted entry must be removed");
    assert_eq!(stats.resident_bytes, 100);
    assert_eq!(f.cache.resident_set(), vec![key("b")]);
    // The reload that admitted b already excluded a.
    assert_eq!(f.engine.last_resident(), vec![key("b")]);
}

#[tokio::test]
async fn busy_entries_are_never_evicted() {
    let f = fixture(1000, 1, MockProvider::new());

    let _held = f.cache.acquire(&key("a")).await.unwrap();
    let err = f.cache.acquire(&key("b")).await.unwrap_err();
    assert!(matches!(err, MuninError::Exhausted { .. }), "got {err}");
    assert_eq!(f.cache.resident_set(), vec![key("a")]);
}

#[tokio::test]
async fn released_entries_are_evictable_again() {
    let f = fixture(1000, 1, MockProvider::new());

    drop(f.cache.acquire(&key("a")).await.unwrap());
    drop(f.cache.acquire(&key("b")).await.unwrap());

    assert_eq!(f.cache.resident_set(), vec![key("b")]);
    assert_eq!(f.engine.last_resident(), vec![key("b")]);
}

#[tokio::test]
async fn max_concurrent_one_forces_eviction_between_keys() {
    let f = fixture(10_000, 1, MockProvider::new());

    for name in ["a", "b", "c", "a"] {
        drop(f.cache.acquire(&key(name)).await.unwrap());
        assert_eq!(f.cache.stats().resident_models, 1);
    }
    // Every distinct-key admission evicted the previous resident; the
    // final acquire re-fetched a.
    assert_eq!(f.provider.fetches(), 4);
    assert_eq!(f.cache.resident_set(), vec![key("a")]);
}

#[tokio::test]
async fn zero_disk_budget_rejects_everything() {
    let f = fixture(0, 2, MockProvider::new());

    let err = f.cache.acquire(&key("a")).await.unwrap_err();
    assert!(matches!(err, MuninError::Exhausted { .. }), "got {err}");
    assert_eq!(f.cache.stats().entries, 0);
}

#[tokio::test]
async fn repeated_acquire_is_idempotent() {
    let f = fixture(1000, 2, MockProvider::new());

    drop(f.cache.acquire(&key("a")).await.unwrap());
    let baseline = f.cache.stats();
    for _ in 0..5 {
        drop(f.cache.acquire(&key("a")).await.unwrap());
        assert_eq!(f.cache.stats(), baseline);
    }
    assert_eq!(f.provider.fetches(), 1);
}

#[tokio::test]
async fn failed_fetch_removes_entry_and_allows_retry() {
    let f = fixture(1000, 2, MockProvider::new());
    f.provider.fail.store(true, Ordering::SeqCst);

    let err = f.cache.acquire(&key("a")).await.unwrap_err();
    assert!(matches!(err, MuninError::FetchFailed { .. }), "got {err}");
    assert_eq!(f.cache.stats().entries, 0);

    f.provider.fail.store(false, Ordering::SeqCst);
    drop(f.cache.acquire(&key("a")).await.unwrap());
    assert_eq!(f.provider.fetches(), 2);
    assert_eq!(f.cache.resident_set(), vec![key("a")]);
}

#[tokio::test]
async fn failed_reload_removes_entry_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new());
    let engine = Arc::new(MockEngine::new());
    engine.fail.store(true, Ordering::SeqCst);
    let config = ModelCacheConfig {
        host_model_path: dir.path().join("models"),
        size_bytes: 1000,
    };
    let cache = ModelCache::new(&config, 2, false, provider, engine.clone()).unwrap();

    let err = cache.acquire(&key("a")).await.unwrap_err();
    assert!(matches!(err, MuninError::ReloadFailed(_)), "got {err}");
    assert_eq!(cache.stats().entries, 0);
    assert!(
        !dir.path().join("models/a/1").exists(),
        "fetched files must be cleaned up after a failed reload"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_observe_the_load_failure() {
    let f = fixture(
        1000,
        2,
        MockProvider::new().with_delay(Duration::from_millis(50)),
    );
    f.provider.fail.store(true, Ordering::SeqCst);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let cache = f.cache.clone();
        handles.push(tokio::spawn(
            async move { cache.acquire(&ModelKey::new("a", "1")).await.map(drop) },
        ));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }
    assert_eq!(f.provider.fetches(), 1, "failure was not shared");
}

#[tokio::test]
async fn resident_set_reflects_both_budgeted_models() {
    let f = fixture(1000, 2, MockProvider::new());

    drop(f.cache.acquire(&key("a")).await.unwrap());
    drop(f.cache.acquire(&key("b")).await.unwrap());

    assert_eq!(f.cache.resident_set(), vec![key("a"), key("b")]);
    assert_eq!(f.engine.last_resident(), vec![key("a"), key("b")]);
    assert_eq!(f.cache.stats().resident_bytes, 200);
}

#[tokio::test]
async fn sized_models_account_bytes_individually() {
    let provider = MockProvider::new().with_size("big", 300).with_size("small", 10);
    let f = fixture(1000, 4, provider);

    drop(f.cache.acquire(&key("big")).await.unwrap());
    drop(f.cache.acquire(&key("small")).await.unwrap());
    assert_eq!(f.cache.stats().resident_bytes, 310);
}

#[test]
fn startup_clears_stale_model_directory() {
    let dir = tempfile::tempdir().unwrap();
    let models = dir.path().join("models");
    std::fs::create_dir_all(models.join("stale/7")).unwrap();
    std::fs::write(models.join("stale/7/saved_model.pb"), b"old").unwrap();

    let config = ModelCacheConfig {
        host_model_path: models.clone(),
        size_bytes: 1000,
    };
    let cache = ModelCache::new(
        &config,
        2,
        false,
        Arc::new(MockProvider::new()),
        Arc::new(MockEngine::new()),
    )
    .unwrap();

    assert!(!models.join("stale").exists());
    assert_eq!(cache.stats().entries, 0);
}
