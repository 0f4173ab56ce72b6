use serde::{Deserialize, Serialize};

/// Serialization dialect a schema is written in.
///
/// There are serialization format specific behaviors that occur within the
/// Schema Registry — see the compatibility engines in [`crate::compat`] for
/// how each one judges evolution, and [`crate::codec`] for how each one is
/// framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Format {
    Avro,
    Json,
    Protobuf,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Avro => write!(f, "AVRO"),
            Self::Json => write!(f, "JSON"),
            Self::Protobuf => write!(f, "PROTOBUF"),
        }
    }
}

/// A pointer from one schema to another, by subject and version.
///
/// Stored and round-tripped but not dereferenced during compatibility
/// checking — see the Open Questions in DESIGN.md.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaReference {
    pub name: String,
    pub subject: String,
    pub version: u32,
}

/// An immutable, versioned schema record.
///
/// `id` is globally unique across all subjects; `(subject, version)` is
/// unique within a subject. Two records may share an `id` iff their
/// `format` and `text` are identical (cross-subject ID sharing, §3 I2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub id: u32,
    pub subject: String,
    pub version: u32,
    pub format: Format,
    pub text: String,
    #[serde(default)]
    pub references: Vec<SchemaReference>,
}

impl Schema {
    /// Two schemas are "content-identical" when their payload and dialect
    /// match, independent of id/subject/version. Registration reuses the id
    /// of a content-identical schema rather than minting a new one.
    pub fn content_equals(&self, format: Format, text: &str) -> bool {
        self.format == format && self.text == text
    }
}

/// Compatibility policy controlling which evolutions of a subject are
/// permitted. Default when unset: [`CompatibilityLevel::Backward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompatibilityLevel {
    Backward,
    Forward,
    Full,
    None,
    BackwardTransitive,
    ForwardTransitive,
    FullTransitive,
}

impl Default for CompatibilityLevel {
    fn default() -> Self {
        Self::Backward
    }
}

impl CompatibilityLevel {
    /// Whether this level must be checked against every prior version
    /// rather than only the latest.
    pub fn is_transitive(self) -> bool {
        matches!(
            self,
            Self::BackwardTransitive | Self::ForwardTransitive | Self::FullTransitive
        )
    }

    /// The pairwise check a transitive level reduces to once the registry
    /// has fanned it out over every prior version. Non-transitive levels
    /// are their own base.
    pub fn base(self) -> Self {
        match self {
            Self::BackwardTransitive => Self::Backward,
            Self::ForwardTransitive => Self::Forward,
            Self::FullTransitive => Self::Full,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backward => "BACKWARD",
            Self::Forward => "FORWARD",
            Self::Full => "FULL",
            Self::None => "NONE",
            Self::BackwardTransitive => "BACKWARD_TRANSITIVE",
            Self::ForwardTransitive => "FORWARD_TRANSITIVE",
            Self::FullTransitive => "FULL_TRANSITIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "BACKWARD" => Self::Backward,
            "FORWARD" => Self::Forward,
            "FULL" => Self::Full,
            "NONE" => Self::None,
            "BACKWARD_TRANSITIVE" => Self::BackwardTransitive,
            "FORWARD_TRANSITIVE" => Self::ForwardTransitive,
            "FULL_TRANSITIVE" => Self::FullTransitive,
            _ => return None,
        })
    }
}

impl std::fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitive_levels_reduce_to_base() {
        assert_eq!(CompatibilityLevel::BackwardTransitive.base(), CompatibilityLevel::Backward);
        assert!(CompatibilityLevel::BackwardTransitive.is_transitive());
        assert!(!CompatibilityLevel::Backward.is_transitive());
    }

    #[test]
    fn level_round_trips_through_str() {
        for level in [
            CompatibilityLevel::Backward,
            CompatibilityLevel::Forward,
            CompatibilityLevel::Full,
            CompatibilityLevel::None,
            CompatibilityLevel::BackwardTransitive,
            CompatibilityLevel::ForwardTransitive,
            CompatibilityLevel::FullTransitive,
        ] {
            assert_eq!(CompatibilityLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(CompatibilityLevel::parse("BOGUS"), None);
    }

    #[test]
    fn content_equals_requires_format_and_text_match() {
        let schema = Schema {
            id: 1,
            subject: "orders-value".into(),
            version: 1,
            format: Format::Avro,
            text: "{}".into(),
            references: vec![],
        };
        assert!(schema.content_equals(Format::Avro, "{}"));
        assert!(!schema.content_equals(Format::Json, "{}"));
        assert!(!schema.content_equals(Format::Avro, "{\"a\":1}"));
    }
}
