use serde::{Deserialize, Serialize};

/// Process-level configuration the registry is constructed from.
///
/// This is a plain data value — parsing it out of environment variables or
/// CLI flags, and wiring up process lifecycle (signals, graceful shutdown),
/// is the embedding binary's job, not this crate's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Connection URL for the backing versioned KV store. Ignored when
    /// `test_mode` is set.
    pub kv_url: String,
    pub bind_addr: String,
    pub schemas_bucket: String,
    pub config_bucket: String,
    pub debug: bool,
    /// When true, the registry is constructed against an in-process
    /// `InMemoryKv` instead of dialing `kv_url`.
    pub test_mode: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kv_url: String::new(),
            bind_addr: ":8081".to_string(),
            schemas_bucket: "SCHEMAS".to_string(),
            config_bucket: "CONFIG".to_string(),
            debug: false,
            test_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_process_configuration() {
        let cfg = RegistryConfig::default();
        assert_eq!(cfg.bind_addr, ":8081");
        assert_eq!(cfg.schemas_bucket, "SCHEMAS");
        assert_eq!(cfg.config_bucket, "CONFIG");
        assert!(!cfg.test_mode);
    }
}
