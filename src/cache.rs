//! Read-through caches for the registry, plus the watch loop that keeps
//! them coherent with the backing KV.
//!
//! Per §9's design note, this models the four caches as one struct behind a
//! single coarse `futures_locks::RwLock`, not as per-entry sharded maps —
//! contention here is low, and one lock makes the coherence invariants
//! (versions/id maps staying in lockstep) straightforward to reason about.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_locks::RwLock;
use tokio::sync::Notify;
use tokio_stream::StreamExt;

use crate::error::RegistryError;
use crate::keys::{parse_key, ParsedKey};
use crate::schema::{CompatibilityLevel, Schema};
use crate::storage::{ChangeEvent, KvOp, VersionedKv};

#[derive(Debug, Default)]
struct CacheState {
    schema_by_id: HashMap<u32, Schema>,
    versions_by_subject: HashMap<String, Vec<u32>>,
    id_by_version: HashMap<String, HashMap<u32, u32>>,
    config_level: HashMap<String, CompatibilityLevel>,
}

/// Which bucket a watch event came from — the two buckets share no key
/// namespace, so a single `parse_key` call always resolves unambiguously,
/// but keeping the origin around makes the watch loop's two tasks easy to
/// tell apart in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Schemas,
    Config,
}

pub struct RegistryCache {
    state: RwLock<CacheState>,
    schemas_ready: AtomicBool,
    config_ready: AtomicBool,
    ready_notify: Notify,
}

impl Default for RegistryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryCache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            schemas_ready: AtomicBool::new(false),
            config_ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.schemas_ready.load(Ordering::SeqCst) && self.config_ready.load(Ordering::SeqCst)
    }

    fn mark_ready(&self, bucket: Bucket) {
        match bucket {
            Bucket::Schemas => self.schemas_ready.store(true, Ordering::SeqCst),
            Bucket::Config => self.config_ready.store(true, Ordering::SeqCst),
        }
        self.ready_notify.notify_waiters();
    }

    /// Blocks until both watches are live, or the deadline elapses.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<(), RegistryError> {
        if self.is_ready() {
            return Ok(());
        }
        let wait = async {
            while !self.is_ready() {
                self.ready_notify.notified().await;
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| RegistryError::Internal("timed out waiting for watch loop readiness".into()))
    }

    pub async fn get_schema(&self, id: u32) -> Option<Schema> {
        self.state.read().await.schema_by_id.get(&id).cloned()
    }

    pub async fn put_schema(&self, schema: Schema) {
        let mut state = self.state.write().await;
        let subject = schema.subject.clone();
        let version = schema.version;
        let id = schema.id;

        let versions = state.versions_by_subject.entry(subject.clone()).or_default();
        if !versions.contains(&version) {
            versions.push(version);
            versions.sort_unstable();
        }
        state
            .id_by_version
            .entry(subject)
            .or_default()
            .insert(version, id);
        state.schema_by_id.insert(id, schema);
    }

    /// Links `(subject, version)` to `id` without touching `schema_by_id` —
    /// used for a content-identical reuse, where the canonical body already
    /// lives under another subject's entry and must not be overwritten with
    /// this one's subject/version.
    pub async fn put_subject_version(&self, subject: &str, version: u32, id: u32) {
        let mut state = self.state.write().await;
        let versions = state.versions_by_subject.entry(subject.to_string()).or_default();
        if !versions.contains(&version) {
            versions.push(version);
            versions.sort_unstable();
        }
        state
            .id_by_version
            .entry(subject.to_string())
            .or_default()
            .insert(version, id);
    }

    pub async fn evict_schema_by_id(&self, id: u32) {
        self.state.write().await.schema_by_id.remove(&id);
    }

    pub async fn evict_subject_version(&self, subject: &str, version: u32) {
        let mut state = self.state.write().await;
        if let Some(versions) = state.versions_by_subject.get_mut(subject) {
            versions.retain(|&v| v != version);
            let now_empty = versions.is_empty();
            if now_empty {
                state.versions_by_subject.remove(subject);
            }
        }
        if let Some(by_version) = state.id_by_version.get_mut(subject) {
            by_version.remove(&version);
            if by_version.is_empty() {
                state.id_by_version.remove(subject);
            }
        }
    }

    pub async fn get_versions(&self, subject: &str) -> Option<Vec<u32>> {
        self.state
            .read()
            .await
            .versions_by_subject
            .get(subject)
            .cloned()
    }

    pub async fn get_id_by_version(&self, subject: &str, version: u32) -> Option<u32> {
        self.state
            .read()
            .await
            .id_by_version
            .get(subject)
            .and_then(|m| m.get(&version))
            .copied()
    }

    pub async fn get_config(&self, key: &str) -> Option<CompatibilityLevel> {
        self.state.read().await.config_level.get(key).copied()
    }

    pub async fn put_config(&self, key: String, level: CompatibilityLevel) {
        self.state.write().await.config_level.insert(key, level);
    }

    pub async fn evict_config(&self, key: &str) {
        self.state.write().await.config_level.remove(key);
    }

    async fn apply_event(&self, event: ChangeEvent) {
        match parse_key(&event.key) {
            ParsedKey::SchemaById(id) => match event.op {
                KvOp::Delete => self.evict_schema_by_id(id).await,
                KvOp::Put => {
                    if let Some(value) = event.value {
                        if let Ok(schema) = serde_json::from_slice::<Schema>(&value) {
                            self.put_schema(schema).await;
                        }
                    }
                }
            },
            ParsedKey::SubjectVersion { subject, version } => match event.op {
                KvOp::Delete => self.evict_subject_version(&subject, version).await,
                KvOp::Put => {
                    if let Some(value) = event.value {
                        if let Ok(schema) = serde_json::from_slice::<Schema>(&value) {
                            self.put_subject_version(&subject, version, schema.id).await;
                        }
                    }
                }
            },
            ParsedKey::ConfigGlobal => self.apply_config_event("global", event).await,
            ParsedKey::ConfigSubject(subject) => self.apply_config_event(&subject, event).await,
            ParsedKey::Unrecognized => {}
        }
    }

    async fn apply_config_event(&self, key: &str, event: ChangeEvent) {
        match event.op {
            KvOp::Delete => self.evict_config(key).await,
            KvOp::Put => {
                if let Some(value) = event.value {
                    if let Ok(text) = String::from_utf8(value) {
                        if let Some(level) = CompatibilityLevel::parse(text.trim()) {
                            self.put_config(key.to_string(), level).await;
                        }
                    }
                }
            }
        }
    }
}

type WatchFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Starts the two watch-loop tasks (schemas bucket, config bucket)
/// described in §4.4. Readiness for a bucket is signaled as soon as its
/// watch is open, not after the first event — callers otherwise racing
/// `wait_ready` against an idle store would hang forever.
pub fn watch_loop(
    cache: Arc<RegistryCache>,
    schemas_kv: Arc<dyn VersionedKv>,
    config_kv: Arc<dyn VersionedKv>,
) -> (WatchFuture, WatchFuture) {
    let schemas_task: WatchFuture = {
        let cache = Arc::clone(&cache);
        Box::pin(async move {
            let mut stream = schemas_kv.watch_all();
            cache.mark_ready(Bucket::Schemas);
            trace::info!("watch loop ready: schemas bucket");
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => cache.apply_event(event).await,
                    Err(lagged) => {
                        trace::warn!(skipped = lagged.skipped, "watch stream item lost, retrying");
                        // Resynchronize by discarding the cache; the next
                        // read-through miss repopulates it from the KV.
                    }
                }
            }
        })
    };

    let config_task: WatchFuture = {
        let cache = Arc::clone(&cache);
        Box::pin(async move {
            let mut stream = config_kv.watch_all();
            cache.mark_ready(Bucket::Config);
            trace::info!("watch loop ready: config bucket");
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => cache.apply_event(event).await,
                    Err(lagged) => {
                        trace::warn!(skipped = lagged.skipped, "watch stream item lost, retrying");
                    }
                }
            }
        })
    };

    (schemas_task, config_task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Format;

    fn test_schema(subject: &str, version: u32, id: u32) -> Schema {
        Schema {
            id,
            subject: subject.to_string(),
            version,
            format: Format::Avro,
            text: "{}".to_string(),
            references: vec![],
        }
    }

    #[tokio::test]
    async fn put_schema_keeps_versions_ascending() {
        let cache = RegistryCache::new();
        cache.put_schema(test_schema("s", 2, 20)).await;
        cache.put_schema(test_schema("s", 1, 10)).await;
        assert_eq!(cache.get_versions("s").await, Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn evict_subject_version_removes_subject_when_empty() {
        let cache = RegistryCache::new();
        cache.put_schema(test_schema("s", 1, 10)).await;
        cache.evict_subject_version("s", 1).await;
        assert_eq!(cache.get_versions("s").await, None);
        assert_eq!(cache.get_id_by_version("s", 1).await, None);
    }

    #[tokio::test]
    async fn put_subject_version_links_without_touching_schema_by_id() {
        let cache = RegistryCache::new();
        cache.put_subject_version("b", 1, 10).await;
        assert_eq!(cache.get_id_by_version("b", 1).await, Some(10));
        assert_eq!(cache.get_schema(10).await, None);
    }

    #[tokio::test]
    async fn wait_ready_resolves_once_both_buckets_marked() {
        let cache = Arc::new(RegistryCache::new());
        assert!(!cache.is_ready());
        cache.mark_ready(Bucket::Schemas);
        assert!(!cache.is_ready());
        cache.mark_ready(Bucket::Config);
        cache
            .wait_ready(Duration::from_millis(50))
            .await
            .expect("should already be ready");
    }

    #[tokio::test]
    async fn wait_ready_times_out_when_never_signaled() {
        let cache = RegistryCache::new();
        let err = cache.wait_ready(Duration::from_millis(10)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn apply_event_installs_schema_from_put() {
        let cache = RegistryCache::new();
        let schema = test_schema("s", 1, 10);
        let event = ChangeEvent {
            key: crate::keys::schema_by_id_key(10),
            value: Some(serde_json::to_vec(&schema).unwrap()),
            op: KvOp::Put,
            revision: 1,
        };
        cache.apply_event(event).await;
        assert_eq!(cache.get_schema(10).await, Some(schema));
    }

    #[tokio::test]
    async fn apply_event_evicts_schema_on_delete() {
        let cache = RegistryCache::new();
        cache.put_schema(test_schema("s", 1, 10)).await;
        let event = ChangeEvent {
            key: crate::keys::schema_by_id_key(10),
            value: None,
            op: KvOp::Delete,
            revision: 2,
        };
        cache.apply_event(event).await;
        assert_eq!(cache.get_schema(10).await, None);
    }

    #[tokio::test]
    async fn apply_config_event_parses_level() {
        let cache = RegistryCache::new();
        let event = ChangeEvent {
            key: crate::keys::config_global_key(),
            value: Some(b"FULL_TRANSITIVE".to_vec()),
            op: KvOp::Put,
            revision: 1,
        };
        cache.apply_event(event).await;
        assert_eq!(
            cache.get_config("global").await,
            Some(CompatibilityLevel::FullTransitive)
        );
    }
}
