//! Reading-type metadata: a file-backed cache plus the discovery protocol that
//! fills it.

use crate::inference::InferenceProvider;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub const PLACEHOLDER_DESCRIPTION: &str = "analyzing...";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Sensor,
    Status,
    Technical,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub original_key: String,
    pub label: String,
    pub unit: String,
    pub description: String,
    pub category: Category,
}

impl Metadata {
    pub fn placeholder(key: &str) -> Self {
        Self {
            original_key: key.to_string(),
            label: key.to_string(),
            unit: String::new(),
            description: PLACEHOLDER_DESCRIPTION.to_string(),
            category: Category::Other,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.description == PLACEHOLDER_DESCRIPTION
    }
}

/// Process-wide map from reading type key to metadata. Every write rewrites the
/// backing JSON file. The snapshot is taken under the map lock; the file write
/// happens after it is released, and an older snapshot never replaces a newer one.
pub struct MetadataCache {
    entries: RwLock<BTreeMap<String, Metadata>>,
    path: Option<PathBuf>,
    generation: AtomicU64,
    written: Mutex<u64>,
}

struct Snapshot {
    generation: u64,
    json: String,
}

impl MetadataCache {
    /// Loads the cache from `path`. A missing file starts empty. An unreadable one is
    /// moved aside to `<path>.corrupt` and the cache also starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_entries(&path) {
            Ok(entries) => {
                info!("Loaded {} known reading types from {:?}.", entries.len(), path);
                entries
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                error!("Failed to load metadata from {:?}: {}", path, e);
                let aside = corrupt_path(&path);
                match fs::rename(&path, &aside) {
                    Ok(()) => warn!("Moved unreadable metadata file to {:?}.", aside),
                    Err(e) => error!("Failed to move {:?} aside: {}", path, e),
                }
                BTreeMap::new()
            }
        };

        Self::with_entries(entries, Some(path))
    }

    /// A cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self::with_entries(BTreeMap::new(), None)
    }

    fn with_entries(entries: BTreeMap<String, Metadata>, path: Option<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(entries),
            path,
            generation: AtomicU64::new(0),
            written: Mutex::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Metadata> {
        self.read().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn get_all(&self) -> Vec<Metadata> {
        self.read().values().cloned().collect()
    }

    /// Keys still waiting for (or given up on) enrichment.
    pub fn pending(&self) -> Vec<String> {
        self.read()
            .iter()
            .filter(|(_, meta)| meta.is_placeholder())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn set(&self, key: &str, metadata: Metadata) {
        let snapshot = {
            let mut entries = self.write();
            entries.insert(key.to_string(), metadata);
            self.snapshot(&entries)
        };
        self.persist(snapshot);
    }

    /// Inserts the placeholder for `key` unless the key is already known. The check
    /// and the insert happen under one write lock. Returns true when inserted.
    pub fn insert_placeholder(&self, key: &str) -> bool {
        let snapshot = {
            let mut entries = self.write();
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(key.to_string(), Metadata::placeholder(key));
            self.snapshot(&entries)
        };
        self.persist(snapshot);
        true
    }

    /// Must be called with the write lock held so generations follow map order.
    fn snapshot(&self, entries: &BTreeMap<String, Metadata>) -> Option<Snapshot> {
        self.path.as_ref()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match serde_json::to_string_pretty(entries) {
            Ok(json) => Some(Snapshot { generation, json }),
            Err(e) => {
                error!("Failed to serialize metadata: {}", e);
                None
            }
        }
    }

    fn persist(&self, snapshot: Option<Snapshot>) {
        let (Some(path), Some(snapshot)) = (&self.path, snapshot) else {
            return;
        };
        let mut written = self.written.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *written >= snapshot.generation {
            return; // a newer snapshot is already on disk
        }
        match write_json(path, &snapshot.json) {
            Ok(()) => *written = snapshot.generation,
            Err(e) => error!("Failed to save metadata to {:?}: {}", path, e),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Metadata>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Metadata>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

fn read_entries(path: &Path) -> io::Result<BTreeMap<String, Metadata>> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_json(path: &Path, json: &str) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

/// Runs the discovery protocol: placeholder first, then one inference call per new
/// key. A failed call leaves the placeholder in place and is not retried.
#[derive(Clone)]
pub struct Enricher {
    cache: Arc<MetadataCache>,
    provider: Arc<dyn InferenceProvider>,
}

impl Enricher {
    pub fn new(cache: Arc<MetadataCache>, provider: Arc<dyn InferenceProvider>) -> Self {
        Self { cache, provider }
    }

    /// Returns true when `key` was new and an enrichment task was started.
    pub fn discover(&self, key: &str, sample: Value) -> bool {
        if !self.cache.insert_placeholder(key) {
            return false;
        }
        info!("New reading type discovered: \"{}\". Inferring metadata via {}...", key, self.provider.name());

        let cache = Arc::clone(&self.cache);
        let provider = Arc::clone(&self.provider);
        let key = key.to_string();
        tokio::spawn(async move {
            match provider.infer(&key, &sample).await {
                Ok(metadata) => {
                    info!("Inferred metadata for \"{}\": {:?}", key, metadata);
                    cache.set(&key, metadata);
                }
                Err(e) => {
                    warn!("Metadata inference failed for \"{}\", keeping placeholder: {}", key, e);
                }
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct GatedProvider {
        calls: AtomicUsize,
        gate: Notify,
        fail: bool,
    }

    impl GatedProvider {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                fail,
            })
        }
    }

    #[async_trait]
    impl InferenceProvider for GatedProvider {
        async fn infer(&self, key: &str, _sample: &Value) -> Result<Metadata, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                return Err(InferenceError::ProviderUnavailable("mock".into()));
            }
            Ok(Metadata {
                original_key: key.to_string(),
                label: "Temperature".into(),
                unit: "°C".into(),
                description: "Ambient temperature".into(),
                category: Category::Sensor,
            })
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn placeholder_is_visible_before_enrichment_resolves() {
        let cache = Arc::new(MetadataCache::in_memory());
        let provider = GatedProvider::new(false);
        let enricher = Enricher::new(cache.clone(), provider.clone());

        assert!(enricher.discover("temp", json!(23.5)));
        let placeholder = cache.get("temp").unwrap();
        assert_eq!(placeholder, Metadata::placeholder("temp"));
        assert_eq!(cache.pending(), vec!["temp".to_string()]);

        wait_until(|| provider.calls.load(Ordering::SeqCst) == 1).await;
        provider.gate.notify_one();
        wait_until(|| !cache.get("temp").unwrap().is_placeholder()).await;

        assert_eq!(cache.get("temp").unwrap().label, "Temperature");
        assert!(cache.pending().is_empty());
    }

    #[tokio::test]
    async fn repeated_discovery_issues_one_inference_call() {
        let cache = Arc::new(MetadataCache::in_memory());
        let provider = GatedProvider::new(false);
        let enricher = Enricher::new(cache.clone(), provider.clone());

        let mut handles = Vec::new();
        for i in 0..16 {
            let enricher = enricher.clone();
            handles.push(tokio::spawn(async move { enricher.discover("rpm", json!(i)) }));
        }
        let mut started = 0;
        for handle in handles {
            if handle.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);

        wait_until(|| provider.calls.load(Ordering::SeqCst) == 1).await;
        assert!(!enricher.discover("rpm", json!(1)));
        provider.gate.notify_one();
        wait_until(|| !cache.get("rpm").unwrap().is_placeholder()).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_enrichment_keeps_placeholder() {
        let cache = Arc::new(MetadataCache::in_memory());
        let provider = GatedProvider::new(true);
        let enricher = Enricher::new(cache.clone(), provider.clone());

        enricher.discover("ok", json!(1.0));
        wait_until(|| provider.calls.load(Ordering::SeqCst) == 1).await;
        provider.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cache.get("ok").unwrap().is_placeholder());
        assert!(!enricher.discover("ok", json!(1.0)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writes_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");

        let cache = MetadataCache::load(&path);
        assert!(cache.get_all().is_empty());
        assert!(cache.insert_placeholder("temp"));
        cache.set(
            "temp",
            Metadata {
                original_key: "temp".into(),
                label: "Temperature".into(),
                unit: "°C".into(),
                description: "Corrected by hand".into(),
                category: Category::Sensor,
            },
        );

        let reloaded = MetadataCache::load(&path);
        assert!(reloaded.has("temp"));
        assert_eq!(reloaded.get("temp").unwrap().description, "Corrected by hand");

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["temp"]["originalKey"], "temp");
        assert_eq!(raw["temp"]["category"], "sensor");
    }

    #[test]
    fn corrupt_file_is_moved_aside_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        fs::write(&path, "{not json").unwrap();

        let cache = MetadataCache::load(&path);
        assert!(cache.get_all().is_empty());
        cache.set("temp", Metadata::placeholder("temp"));

        let aside = dir.path().join("metadata.json.corrupt");
        assert_eq!(fs::read_to_string(&aside).unwrap(), "{not json");
        assert!(MetadataCache::load(&path).has("temp"));
    }

    #[test]
    fn concurrent_writers_leave_the_latest_state_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let cache = MetadataCache::load(&path);

        std::thread::scope(|scope| {
            for t in 0..8 {
                let cache = &cache;
                scope.spawn(move || {
                    for i in 0..10 {
                        cache.insert_placeholder(&format!("k{}_{}", t, i));
                    }
                });
            }
        });

        let reloaded = MetadataCache::load(&path);
        assert_eq!(reloaded.get_all().len(), 80);
        assert_eq!(reloaded.get_all(), cache.get_all());
    }

    #[test]
    fn unknown_category_reads_as_other() {
        let meta: Metadata = serde_json::from_value(json!({
            "originalKey": "x", "label": "X", "unit": "", "description": "d", "category": "weird"
        }))
        .unwrap();
        assert_eq!(meta.category, Category::Other);
    }
}
