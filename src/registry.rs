//! The registry state machine: the durable versioning/identifier
//! allocator, the cached read path, and the operations an HTTP layer
//! would call directly.
//!
//! Mutating operations (`register`, `delete_*`, `set_compatibility_level`)
//! are serialized behind one coarse lock, same rationale as the cache's
//! single `RwLock<CacheState>` — register calls within a process are
//! totally ordered, so ID/version allocation is race-free without
//! per-subject bookkeeping.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_locks::RwLock;

use crate::cache::{watch_loop, RegistryCache};
use crate::codec;
use crate::compat::{self, CompatOutcome};
use crate::error::{RegistryError, Result};
use crate::keys::{config_global_key, config_subject_key, parse_key, schema_by_id_key, subject_version_key, ParsedKey};
use crate::schema::{CompatibilityLevel, Format, Schema};
use crate::storage::{InMemoryKv, KvError, VersionedKv};

/// Which version of a subject an operation targets.
#[derive(Debug, Clone, Copy)]
pub enum VersionQuery {
    Exact(u32),
    Latest,
}

/// Which compatibility setting an operation targets.
#[derive(Debug, Clone)]
pub enum ConfigTarget {
    Global,
    Subject(String),
}

pub struct SchemaRegistry {
    schemas_kv: Arc<dyn VersionedKv>,
    config_kv: Arc<dyn VersionedKv>,
    cache: Arc<RegistryCache>,
    write_lock: RwLock<()>,
}

impl SchemaRegistry {
    pub fn new(schemas_kv: Arc<dyn VersionedKv>, config_kv: Arc<dyn VersionedKv>) -> Arc<Self> {
        Arc::new(Self {
            schemas_kv,
            config_kv,
            cache: Arc::new(RegistryCache::new()),
            write_lock: RwLock::new(()),
        })
    }

    /// Constructs a registry over a fresh in-process `InMemoryKv` pair,
    /// matching `RegistryConfig::test_mode`.
    pub fn new_in_memory() -> Arc<Self> {
        Self::new(Arc::new(InMemoryKv::new()), Arc::new(InMemoryKv::new()))
    }

    pub fn cache(&self) -> &Arc<RegistryCache> {
        &self.cache
    }

    /// The two watch-loop tasks that keep the cache coherent with the
    /// backing KV. The embedding binary drives these to completion (e.g.
    /// `tokio::spawn`); this crate does not spawn its own background
    /// tasks.
    pub fn watch_futures(
        self: &Arc<Self>,
    ) -> (
        impl Future<Output = ()> + Send,
        impl Future<Output = ()> + Send,
    ) {
        watch_loop(
            Arc::clone(&self.cache),
            Arc::clone(&self.schemas_kv),
            Arc::clone(&self.config_kv),
        )
    }

    pub async fn wait_ready(&self, deadline: Duration) -> Result<()> {
        self.cache.wait_ready(deadline).await
    }

    // ---- register -------------------------------------------------

    pub async fn register(&self, subject: &str, text: &str, format: Format) -> Result<u32> {
        compat::validate(format, text)?;

        let _guard = self.write_lock.write().await;

        let versions = self.fetch_versions(subject).await?;

        if let Some(&latest_version) = versions.last() {
            let level = self.get_compatibility_level(subject).await?;
            self.enforce_compatibility(subject, &versions, text, format, level).await?;

            let latest = self.fetch_schema_by_subject_version(subject, latest_version).await?;
            if latest.content_equals(format, text) {
                trace::info!(subject, version = latest_version, id = latest.id, "idempotent re-register");
                return Ok(latest.id);
            }
        }

        let (id, is_new_id) = match self.find_content_identical_id(format, text).await? {
            Some(id) => (id, false),
            None => (self.allocate_id().await?, true),
        };
        let version = versions.last().map(|v| v + 1).unwrap_or(1);

        let schema = Schema {
            id,
            subject: subject.to_string(),
            version,
            format,
            text: text.to_string(),
            references: Vec::new(),
        };

        if is_new_id {
            self.write_schema_new(&schema).await?;
        } else {
            self.write_schema_link(&schema).await?;
        }

        trace::info!(subject, version, id, format = %format, "schema registered");
        Ok(id)
    }

    async fn enforce_compatibility(
        &self,
        subject: &str,
        versions: &[u32],
        text: &str,
        format: Format,
        level: CompatibilityLevel,
    ) -> Result<()> {
        let outcome = self.compatibility_over(subject, versions, text, format, level).await?;
        if !outcome.compatible {
            let reason = outcome.reason().unwrap_or_else(|| "incompatible".to_string());
            trace::warn!(subject, reason = %reason, "registration rejected");
            return Err(RegistryError::incompatible(reason));
        }
        Ok(())
    }

    /// Checks `text` against every version named by `versions`, per
    /// `level`'s transitivity — non-transitive levels check only the
    /// latest (the last element of `versions`, which is kept ascending).
    async fn compatibility_over(
        &self,
        subject: &str,
        versions: &[u32],
        text: &str,
        format: Format,
        level: CompatibilityLevel,
    ) -> Result<CompatOutcome> {
        let to_check: Vec<u32> = if level.is_transitive() {
            versions.to_vec()
        } else {
            versions.last().copied().into_iter().collect()
        };
        let mut outcome = CompatOutcome {
            compatible: true,
            reasons: Vec::new(),
        };
        for version in to_check {
            let prior = self.fetch_schema_by_subject_version(subject, version).await?;
            let result = compat::check(format, &prior.text, text, level);
            outcome.compatible = outcome.compatible && result.compatible;
            outcome.reasons.extend(result.reasons);
        }
        Ok(outcome)
    }

    pub async fn check_compatibility(
        &self,
        subject: &str,
        text: &str,
        format: Format,
        level: CompatibilityLevel,
    ) -> Result<CompatOutcome> {
        let versions = self.fetch_versions(subject).await?;
        if versions.is_empty() {
            return Ok(CompatOutcome {
                compatible: true,
                reasons: Vec::new(),
            });
        }
        self.compatibility_over(subject, &versions, text, format, level).await
    }

    async fn find_content_identical_id(&self, format: Format, text: &str) -> Result<Option<u32>> {
        let keys = self.schemas_kv.keys().await.map_err(map_kv_err)?;
        for key in keys {
            if let ParsedKey::SchemaById(id) = parse_key(&key) {
                let schema = self.fetch_schema_by_id(id).await?;
                if schema.content_equals(format, text) {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    async fn allocate_id(&self) -> Result<u32> {
        let keys = self.schemas_kv.keys().await.map_err(map_kv_err)?;
        let max_id = keys
            .iter()
            .filter_map(|k| match parse_key(k) {
                ParsedKey::SchemaById(id) => Some(id),
                _ => None,
            })
            .max();
        Ok(max_id.map(|id| id + 1).unwrap_or(1))
    }

    async fn write_schema_new(&self, schema: &Schema) -> Result<()> {
        let bytes = serde_json::to_vec(schema).map_err(|e| RegistryError::Internal(e.to_string()))?;
        self.schemas_kv
            .put(&schema_by_id_key(schema.id), bytes.clone())
            .await
            .map_err(map_kv_err)?;
        self.schemas_kv
            .put(&subject_version_key(&schema.subject, schema.version), bytes)
            .await
            .map_err(map_kv_err)?;
        self.cache.put_schema(schema.clone()).await;
        Ok(())
    }

    /// A content-identical reuse: only the subject/version pointer is new,
    /// so the by-ID entry (owned by whichever subject registered first) is
    /// left untouched.
    async fn write_schema_link(&self, schema: &Schema) -> Result<()> {
        let bytes = serde_json::to_vec(schema).map_err(|e| RegistryError::Internal(e.to_string()))?;
        self.schemas_kv
            .put(&subject_version_key(&schema.subject, schema.version), bytes)
            .await
            .map_err(map_kv_err)?;
        self.cache.put_subject_version(&schema.subject, schema.version, schema.id).await;
        Ok(())
    }

    // ---- reads ------------------------------------------------------

    pub async fn get_schema(&self, id: u32) -> Result<Schema> {
        self.fetch_schema_by_id(id).await
    }

    pub async fn get_schema_by_subject_version(&self, subject: &str, query: VersionQuery) -> Result<Schema> {
        let version = self.resolve_version(subject, query).await?;
        self.fetch_schema_by_subject_version(subject, version).await
    }

    pub async fn get_versions(&self, subject: &str) -> Result<Vec<u32>> {
        let versions = self.fetch_versions(subject).await?;
        if versions.is_empty() {
            return Err(RegistryError::not_found(format!("subject `{subject}` has no versions")));
        }
        Ok(versions)
    }

    pub async fn lookup_schema(&self, subject: &str, text: &str, format: Format) -> Result<Schema> {
        for version in self.get_versions(subject).await? {
            let schema = self.fetch_schema_by_subject_version(subject, version).await?;
            if schema.content_equals(format, text) {
                return Ok(schema);
            }
        }
        Err(RegistryError::not_found(format!(
            "no version of subject `{subject}` matches the given schema"
        )))
    }

    pub async fn get_compatibility_level(&self, subject: &str) -> Result<CompatibilityLevel> {
        if let Some(level) = self.fetch_subject_config(subject).await? {
            return Ok(level);
        }
        if let Some(level) = self.fetch_global_config().await? {
            return Ok(level);
        }
        Ok(CompatibilityLevel::default())
    }

    pub async fn set_compatibility_level(&self, target: ConfigTarget, level: CompatibilityLevel) -> Result<()> {
        let _guard = self.write_lock.write().await;
        let (kv_key, cache_key) = match &target {
            ConfigTarget::Global => (config_global_key(), "global".to_string()),
            ConfigTarget::Subject(subject) => (config_subject_key(subject), subject.clone()),
        };
        self.config_kv
            .put(&kv_key, level.as_str().as_bytes().to_vec())
            .await
            .map_err(map_kv_err)?;
        self.cache.put_config(cache_key, level).await;
        Ok(())
    }

    // ---- deletes ------------------------------------------------------

    pub async fn delete_schema_version(&self, subject: &str, query: VersionQuery) -> Result<u32> {
        let _guard = self.write_lock.write().await;
        let version = self.resolve_version(subject, query).await?;
        self.schemas_kv
            .delete(&subject_version_key(subject, version))
            .await
            .map_err(map_kv_err)?;
        self.cache.evict_subject_version(subject, version).await;
        trace::info!(subject, version, "schema version deleted");
        Ok(version)
    }

    /// Deletes every version of `subject` plus each version's by-ID entry,
    /// returning the affected IDs in ascending version order. Per the
    /// design note on deletion asymmetry, an ID shared with another
    /// subject is deleted here too — that subject's `get_schema` will then
    /// fail until it registers again.
    pub async fn delete_subject(&self, subject: &str) -> Result<Vec<u32>> {
        let _guard = self.write_lock.write().await;
        let versions = self.fetch_versions(subject).await?;
        let mut deleted_ids = Vec::with_capacity(versions.len());
        for version in versions {
            let schema = self.fetch_schema_by_subject_version(subject, version).await?;
            self.schemas_kv
                .delete(&subject_version_key(subject, version))
                .await
                .map_err(map_kv_err)?;
            self.schemas_kv.delete(&schema_by_id_key(schema.id)).await.map_err(map_kv_err)?;
            self.cache.evict_subject_version(subject, version).await;
            self.cache.evict_schema_by_id(schema.id).await;
            deleted_ids.push(schema.id);
        }
        trace::info!(subject, ids = ?deleted_ids, "subject deleted");
        Ok(deleted_ids)
    }

    // ---- wire format --------------------------------------------------

    pub async fn serialize(&self, id: u32, value: &serde_json::Value) -> Result<Vec<u8>> {
        let schema = self.fetch_schema_by_id(id).await?;
        let payload = codec::encode_payload(&schema, value).map_err(|e| RegistryError::BadRequest(e.to_string()))?;
        Ok(codec::encode_envelope(id, &payload))
    }

    pub async fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        let (id, payload) = codec::decode_envelope(bytes).map_err(|e| RegistryError::BadRequest(e.to_string()))?;
        let schema = self.fetch_schema_by_id(id).await?;
        codec::decode_payload(&schema, payload).map_err(|e| RegistryError::BadRequest(e.to_string()))
    }

    // ---- cache/KV read-through ------------------------------------

    async fn resolve_version(&self, subject: &str, query: VersionQuery) -> Result<u32> {
        match query {
            VersionQuery::Exact(v) => Ok(v),
            VersionQuery::Latest => {
                let versions = self.get_versions(subject).await?;
                Ok(*versions.last().expect("get_versions never returns an empty list"))
            }
        }
    }

    async fn fetch_versions(&self, subject: &str) -> Result<Vec<u32>> {
        if let Some(versions) = self.cache.get_versions(subject).await {
            return Ok(versions);
        }
        let keys = self.schemas_kv.keys().await.map_err(map_kv_err)?;
        let prefix = format!("subjects/{subject}/versions/");
        let mut versions: Vec<u32> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|v| v.parse().ok())
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn fetch_schema_by_id(&self, id: u32) -> Result<Schema> {
        if let Some(schema) = self.cache.get_schema(id).await {
            return Ok(schema);
        }
        let (bytes, _revision) = self.schemas_kv.get(&schema_by_id_key(id)).await.map_err(|e| match e {
            KvError::NotFound(_) => RegistryError::not_found(format!("schema id {id}")),
            KvError::Unavailable(msg) => RegistryError::StorageUnavailable(msg),
        })?;
        let schema: Schema = serde_json::from_slice(&bytes).map_err(|e| RegistryError::Internal(e.to_string()))?;
        self.cache.put_schema(schema.clone()).await;
        Ok(schema)
    }

    /// Resolves a specific `(subject, version)`. When only the shared
    /// by-ID body is cached (a content-identical reuse), the subject and
    /// version in the returned record are overridden to the caller's
    /// query — by invariant I2 the format/text are identical regardless
    /// of which subject's copy answered the lookup.
    async fn fetch_schema_by_subject_version(&self, subject: &str, version: u32) -> Result<Schema> {
        if let Some(id) = self.cache.get_id_by_version(subject, version).await {
            let canonical = self.fetch_schema_by_id(id).await?;
            return Ok(Schema {
                subject: subject.to_string(),
                version,
                ..canonical
            });
        }
        let key = subject_version_key(subject, version);
        let (bytes, _revision) = self.schemas_kv.get(&key).await.map_err(|e| match e {
            KvError::NotFound(_) => RegistryError::not_found(format!("subject `{subject}` version {version}")),
            KvError::Unavailable(msg) => RegistryError::StorageUnavailable(msg),
        })?;
        let schema: Schema = serde_json::from_slice(&bytes).map_err(|e| RegistryError::Internal(e.to_string()))?;
        self.cache.put_subject_version(subject, version, schema.id).await;
        Ok(schema)
    }

    async fn fetch_global_config(&self) -> Result<Option<CompatibilityLevel>> {
        if let Some(level) = self.cache.get_config("global").await {
            return Ok(Some(level));
        }
        match self.config_kv.get(&config_global_key()).await {
            Ok((bytes, _revision)) => {
                let level = parse_level(bytes)?;
                self.cache.put_config("global".to_string(), level).await;
                Ok(Some(level))
            }
            Err(KvError::NotFound(_)) => Ok(None),
            Err(KvError::Unavailable(msg)) => Err(RegistryError::StorageUnavailable(msg)),
        }
    }

    async fn fetch_subject_config(&self, subject: &str) -> Result<Option<CompatibilityLevel>> {
        if let Some(level) = self.cache.get_config(subject).await {
            return Ok(Some(level));
        }
        match self.config_kv.get(&config_subject_key(subject)).await {
            Ok((bytes, _revision)) => {
                let level = parse_level(bytes)?;
                self.cache.put_config(subject.to_string(), level).await;
                Ok(Some(level))
            }
            Err(KvError::NotFound(_)) => Ok(None),
            Err(KvError::Unavailable(msg)) => Err(RegistryError::StorageUnavailable(msg)),
        }
    }
}

fn parse_level(bytes: Vec<u8>) -> Result<CompatibilityLevel> {
    let text = String::from_utf8(bytes).map_err(|e| RegistryError::Internal(e.to_string()))?;
    CompatibilityLevel::parse(text.trim())
        .ok_or_else(|| RegistryError::Internal(format!("corrupt compatibility level `{text}`")))
}

fn map_kv_err(e: KvError) -> RegistryError {
    match e {
        KvError::NotFound(key) => RegistryError::not_found(key),
        KvError::Unavailable(msg) => RegistryError::StorageUnavailable(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SchemaRegistry> {
        SchemaRegistry::new_in_memory()
    }

    const V1: &str = r#"{"type":"record","name":"U","fields":[
        {"name":"id","type":"int"},
        {"name":"name","type":"string"}
    ]}"#;

    #[tokio::test]
    async fn register_first_version_allocates_id_one_version_one() {
        let reg = registry();
        let id = reg.register("orders-value", V1, Format::Avro).await.unwrap();
        assert_eq!(id, 1);
        let schema = reg.get_schema_by_subject_version("orders-value", VersionQuery::Latest).await.unwrap();
        assert_eq!(schema.version, 1);
    }

    #[tokio::test]
    async fn s1_backward_compatible_addition_is_accepted_as_version_two() {
        let reg = registry();
        reg.register("orders-value", V1, Format::Avro).await.unwrap();
        let v2 = r#"{"type":"record","name":"U","fields":[
            {"name":"id","type":"int"},
            {"name":"name","type":"string"},
            {"name":"email","type":["null","string"],"default":null}
        ]}"#;
        let id = reg.register("orders-value", v2, Format::Avro).await.unwrap();
        assert_eq!(id, 2);
        assert_eq!(reg.get_versions("orders-value").await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn s2_backward_incompatible_addition_is_rejected() {
        let reg = registry();
        reg.register("orders-value", V1, Format::Avro).await.unwrap();
        let v2 = r#"{"type":"record","name":"U","fields":[
            {"name":"id","type":"int"},
            {"name":"name","type":"string"},
            {"name":"email","type":"string"}
        ]}"#;
        let err = reg.register("orders-value", v2, Format::Avro).await.unwrap_err();
        assert!(matches!(err, RegistryError::Incompatible { .. }));
        assert_eq!(reg.get_versions("orders-value").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn property_4_idempotent_reregister_yields_one_version() {
        let reg = registry();
        let id1 = reg.register("orders-value", V1, Format::Avro).await.unwrap();
        let id2 = reg.register("orders-value", V1, Format::Avro).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(reg.get_versions("orders-value").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn property_3_cross_subject_id_sharing() {
        let reg = registry();
        let id_a = reg.register("a-value", V1, Format::Avro).await.unwrap();
        let id_b = reg.register("b-value", V1, Format::Avro).await.unwrap();
        assert_eq!(id_a, id_b);
        assert_eq!(reg.get_versions("a-value").await.unwrap(), vec![1]);
        assert_eq!(reg.get_versions("b-value").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn property_8_delete_isolation() {
        let reg = registry();
        let id = reg.register("a-value", V1, Format::Avro).await.unwrap();
        reg.register("b-value", V1, Format::Avro).await.unwrap();
        reg.delete_schema_version("a-value", VersionQuery::Exact(1)).await.unwrap();
        assert!(reg.get_schema_by_subject_version("a-value", VersionQuery::Exact(1)).await.is_err());
        assert!(reg.get_schema(id).await.is_ok());
    }

    #[tokio::test]
    async fn s6_transitive_rejects_against_an_older_version_even_if_pairwise_passes() {
        let reg = registry();
        // v1 has `flag: boolean`. v2 changes it to `flag: string`, seeded at
        // NONE since that transition would fail any real check on its own.
        let v1 = r#"{"type":"record","name":"U","fields":[{"name":"flag","type":"boolean"}]}"#;
        reg.register("flags-value", v1, Format::Avro).await.unwrap();
        reg.set_compatibility_level(ConfigTarget::Subject("flags-value".into()), CompatibilityLevel::None)
            .await
            .unwrap();
        let v2 = r#"{"type":"record","name":"U","fields":[{"name":"flag","type":"string"}]}"#;
        reg.register("flags-value", v2, Format::Avro).await.unwrap();

        // v3 keeps `flag` as a string, matching v2 exactly, plus an optional
        // field. Pairwise against v2 alone this is compatible; transitive
        // also checks against v1, where `flag` was still boolean, and fails.
        reg.set_compatibility_level(ConfigTarget::Subject("flags-value".into()), CompatibilityLevel::ForwardTransitive)
            .await
            .unwrap();
        let v3 = r#"{"type":"record","name":"U","fields":[{"name":"flag","type":"string"},{"name":"note","type":["null","string"],"default":null}]}"#;
        let err = reg.register("flags-value", v3, Format::Avro).await.unwrap_err();
        assert!(matches!(err, RegistryError::Incompatible { .. }));
        assert_eq!(reg.get_versions("flags-value").await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn delete_subject_returns_ids_in_ascending_version_order() {
        let reg = registry();
        reg.register("s-value", V1, Format::Avro).await.unwrap();
        reg.set_compatibility_level(ConfigTarget::Subject("s-value".into()), CompatibilityLevel::None)
            .await
            .unwrap();
        let v2 = r#"{"type":"record","name":"U","fields":[{"name":"id","type":"long"}]}"#;
        reg.register("s-value", v2, Format::Avro).await.unwrap();
        let ids = reg.delete_subject("s-value").await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(reg.get_versions("s-value").await.is_err());
    }

    #[tokio::test]
    async fn property_7_envelope_round_trips_json() {
        let reg = registry();
        let id = reg
            .register("payload-value", r#"{"type":"object"}"#, Format::Json)
            .await
            .unwrap();
        let value = serde_json::json!({"a": 1, "b": "two"});
        let bytes = reg.serialize(id, &value).await.unwrap();
        let decoded = reg.deserialize(&bytes).await.unwrap();
        assert_eq!(decoded, value);
    }

    #[tokio::test]
    async fn get_compatibility_level_falls_back_through_subject_global_default() {
        let reg = registry();
        assert_eq!(reg.get_compatibility_level("unset-value").await.unwrap(), CompatibilityLevel::Backward);
        reg.set_compatibility_level(ConfigTarget::Global, CompatibilityLevel::Full).await.unwrap();
        assert_eq!(reg.get_compatibility_level("unset-value").await.unwrap(), CompatibilityLevel::Full);
        reg.set_compatibility_level(ConfigTarget::Subject("unset-value".into()), CompatibilityLevel::None)
            .await
            .unwrap();
        assert_eq!(reg.get_compatibility_level("unset-value").await.unwrap(), CompatibilityLevel::None);
    }
}
