//! The §4.1 key schema, centralized so the registry (which writes these
//! keys) and the cache (which parses them back out of watch events) agree
//! on one format.

/// A KV key's logical meaning once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    SchemaById(u32),
    SubjectVersion { subject: String, version: u32 },
    ConfigGlobal,
    ConfigSubject(String),
    Unrecognized,
}

pub fn schema_by_id_key(id: u32) -> String {
    format!("schemas/{}", id)
}

pub fn subject_version_key(subject: &str, version: u32) -> String {
    format!("subjects/{}/versions/{}", subject, version)
}

pub fn config_global_key() -> String {
    "config/global".to_string()
}

pub fn config_subject_key(subject: &str) -> String {
    format!("config/subjects/{}", subject)
}

pub fn parse_key(key: &str) -> ParsedKey {
    if key == "config/global" {
        return ParsedKey::ConfigGlobal;
    }
    if let Some(subject) = key.strip_prefix("config/subjects/") {
        if !subject.is_empty() {
            return ParsedKey::ConfigSubject(subject.to_string());
        }
        return ParsedKey::Unrecognized;
    }
    if let Some(id) = key.strip_prefix("schemas/") {
        if let Ok(id) = id.parse::<u32>() {
            return ParsedKey::SchemaById(id);
        }
        return ParsedKey::Unrecognized;
    }
    if let Some(rest) = key.strip_prefix("subjects/") {
        if let Some((subject, version_part)) = rest.rsplit_once("/versions/") {
            if let Ok(version) = version_part.parse::<u32>() {
                return ParsedKey::SubjectVersion {
                    subject: subject.to_string(),
                    version,
                };
            }
        }
    }
    ParsedKey::Unrecognized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_schema_by_id() {
        let key = schema_by_id_key(42);
        assert_eq!(key, "schemas/42");
        assert_eq!(parse_key(&key), ParsedKey::SchemaById(42));
    }

    #[test]
    fn round_trips_subject_version() {
        let key = subject_version_key("orders-value", 3);
        assert_eq!(
            parse_key(&key),
            ParsedKey::SubjectVersion {
                subject: "orders-value".to_string(),
                version: 3
            }
        );
    }

    #[test]
    fn round_trips_config_keys() {
        assert_eq!(parse_key(&config_global_key()), ParsedKey::ConfigGlobal);
        assert_eq!(
            parse_key(&config_subject_key("orders-value")),
            ParsedKey::ConfigSubject("orders-value".to_string())
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_key("nonsense"), ParsedKey::Unrecognized);
        assert_eq!(parse_key("schemas/not-a-number"), ParsedKey::Unrecognized);
    }

    #[test]
    fn subject_names_may_contain_slashes() {
        let key = subject_version_key("topic/with/slash-value", 1);
        assert_eq!(
            parse_key(&key),
            ParsedKey::SubjectVersion {
                subject: "topic/with/slash-value".to_string(),
                version: 1
            }
        );
    }
}
