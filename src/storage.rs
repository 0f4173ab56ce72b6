//! The abstract *versioned key-value store* the registry is built on top of,
//! plus an in-memory witness implementation.
//!
//! A production binary is expected to supply its own [`VersionedKv`] backed
//! by a real distributed store (etcd, Consul, NATS JetStream, …); that
//! client is an external collaborator and lives outside this crate. The
//! [`InMemoryKv`] here exists for `test_mode` and for the test suite, and
//! implements `watch_all` so the cache/watch loop of [`crate::cache`] always
//! has something to drive it.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_locks::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOp {
    Put,
    Delete,
}

/// A single committed change, as delivered by [`VersionedKv::watch_all`].
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub op: KvOp,
    pub revision: u64,
}

/// Raised when a watch stream cannot keep up with the rate of change.
///
/// The watch loop treats this as non-fatal: it resynchronizes by re-reading
/// `keys()` rather than failing the request path.
#[derive(Debug, thiserror::Error)]
#[error("watch stream lagged, {skipped} event(s) dropped")]
pub struct WatchLagged {
    pub skipped: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent, WatchLagged>> + Send>>;

/// The minimal versioned KV contract the registry depends on. See §4.1.
#[async_trait]
pub trait VersionedKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<(Vec<u8>, u64), KvError>;

    /// Last-writer-wins; no CAS required for correctness of this design.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// May return any currently live key; ordering is not required.
    async fn keys(&self) -> Result<Vec<String>, KvError>;

    /// A stream of every committed change from this point on. Must deliver
    /// every committed change eventually; may coalesce but must not lose
    /// the latest state of any key.
    fn watch_all(&self) -> WatchStream;
}

/// The in-memory fallback of §4.1, keyed by a single flat namespace (the
/// registry prefixes keys per the §4.1 key schema before calling through).
pub struct InMemoryKv {
    state: RwLock<BTreeMap<String, (Vec<u8>, u64)>>,
    revision: AtomicU64,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKv {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            state: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            changes,
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl VersionedKv for InMemoryKv {
    async fn get(&self, key: &str) -> Result<(Vec<u8>, u64), KvError> {
        let state = self.state.read().await;
        state
            .get(key)
            .cloned()
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        let revision = self.next_revision();
        let mut state = self.state.write().await;
        state.insert(key.to_string(), (value.clone(), revision));
        drop(state);
        // No subscribers is not an error: the watch loop may not have
        // started yet, or nobody is watching in this process.
        let _ = self.changes.send(ChangeEvent {
            key: key.to_string(),
            value: Some(value),
            op: KvOp::Put,
            revision,
        });
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let revision = self.next_revision();
        let mut state = self.state.write().await;
        let existed = state.remove(key).is_some();
        drop(state);
        if !existed {
            return Err(KvError::NotFound(key.to_string()));
        }
        let _ = self.changes.send(ChangeEvent {
            key: key.to_string(),
            value: None,
            op: KvOp::Delete,
            revision,
        });
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, KvError> {
        let state = self.state.read().await;
        Ok(state.keys().cloned().collect())
    }

    fn watch_all(&self) -> WatchStream {
        let rx = self.changes.subscribe();
        let stream = BroadcastStream::new(rx).map(|item| match item {
            Ok(event) => Ok(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Err(WatchLagged { skipped }),
        });
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let kv = InMemoryKv::new();
        kv.put("a", b"1".to_vec()).await.unwrap();
        let (value, revision) = kv.get("a").await.unwrap();
        assert_eq!(value, b"1");
        assert_eq!(revision, 1);
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_not_found() {
        let kv = InMemoryKv::new();
        let err = kv.delete("missing").await.unwrap_err();
        assert!(matches!(err, KvError::NotFound(_)));
    }

    #[tokio::test]
    async fn revisions_strictly_increase_across_keys() {
        let kv = InMemoryKv::new();
        let r1 = kv.put("a", b"1".to_vec()).await.unwrap();
        let r2 = kv.put("b", b"2".to_vec()).await.unwrap();
        assert!(r2 > r1);
    }

    #[tokio::test]
    async fn watch_all_observes_put_and_delete() {
        let kv = InMemoryKv::new();
        let mut stream = kv.watch_all();
        kv.put("a", b"1".to_vec()).await.unwrap();
        kv.delete("a").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.key, "a");
        assert_eq!(first.op, KvOp::Put);
        assert_eq!(first.value, Some(b"1".to_vec()));

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.key, "a");
        assert_eq!(second.op, KvOp::Delete);
        assert_eq!(second.value, None);
    }
}
