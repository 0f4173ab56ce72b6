//! A Confluent-compatible schema registry core: versioned schema storage,
//! numeric ID allocation, per-format compatibility checking, and the wire
//! envelope used to frame serialized values.
//!
//! This crate is the registry *subsystem* — it owns the data model,
//! storage abstraction, cache/watch coherence, compatibility engines, and
//! wire codec. An embedding binary supplies a [`storage::VersionedKv`]
//! (or uses [`registry::SchemaRegistry::new_in_memory`] for `test_mode`),
//! drives the watch-loop futures from [`registry::SchemaRegistry::watch_futures`],
//! and exposes whatever HTTP/gRPC surface it wants on top.

mod cache;
mod codec;
mod compat;
mod config;
mod error;
mod keys;
mod registry;
mod schema;
mod storage;

pub use cache::{Bucket, RegistryCache};
pub use codec::{decode_envelope, encode_envelope, CodecError, ENVELOPE_HEADER_LEN, MAGIC_BYTE};
pub use compat::CompatOutcome;
pub use config::RegistryConfig;
pub use error::{RegistryError, Result};
pub use registry::{ConfigTarget, SchemaRegistry, VersionQuery};
pub use schema::{CompatibilityLevel, Format, Schema, SchemaReference};
pub use storage::{ChangeEvent, InMemoryKv, KvError, KvOp, VersionedKv, WatchLagged, WatchStream};

#[cfg(feature = "avro")]
pub use avro_rs as avro;
