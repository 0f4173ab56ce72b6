//! The per-format compatibility engine, dispatched on [`Format`].
//!
//! Each engine satisfies the same small capability set — parse/validate and
//! judge backward/forward compatibility between two schema texts — modeled
//! as a tagged variant rather than open inheritance, per §9. The registry
//! owns the transitive fan-out over prior versions; an engine only ever
//! compares two schemas.

mod avro;
mod json;
pub(crate) mod protobuf;

use crate::error::RegistryError;
use crate::schema::{CompatibilityLevel, Format};

/// The result of comparing two schema texts under one direction
/// (backward or forward). `FULL` checks are the conjunction of both.
#[derive(Debug, Clone, Default)]
pub struct CompatOutcome {
    pub compatible: bool,
    pub reasons: Vec<String>,
}

impl CompatOutcome {
    fn ok() -> Self {
        Self {
            compatible: true,
            reasons: Vec::new(),
        }
    }

    fn violation(reason: impl Into<String>) -> Self {
        Self {
            compatible: false,
            reasons: vec![reason.into()],
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.compatible = self.compatible && other.compatible;
        self.reasons.extend(other.reasons);
        self
    }

    pub fn reason(&self) -> Option<String> {
        if self.reasons.is_empty() {
            None
        } else {
            Some(self.reasons.join("; "))
        }
    }
}

/// One format's ability to parse its own dialect and judge evolution.
/// All three implementations fail closed: a parse error is reported as
/// [`RegistryError::InvalidSchema`], and an ambiguous shape is judged
/// incompatible rather than silently allowed.
pub(crate) trait FormatEngine {
    fn validate(&self, text: &str) -> Result<(), String>;

    /// `writer` produced data; `reader` is trying to decode it. Backward
    /// compatibility is `check_direction(old, new)`; forward is the mirror,
    /// `check_direction(new, old)`.
    fn check_direction(&self, writer_text: &str, reader_text: &str) -> CompatOutcome;
}

fn engine(format: Format) -> Box<dyn FormatEngine> {
    match format {
        Format::Avro => Box::new(avro::AvroEngine),
        Format::Json => Box::new(json::JsonSchemaEngine),
        Format::Protobuf => Box::new(protobuf::ProtobufEngine),
    }
}

/// Confirms `text` parses under `format`. Called at registration time
/// before any compatibility check runs.
pub fn validate(format: Format, text: &str) -> Result<(), RegistryError> {
    engine(format)
        .validate(text)
        .map_err(|reason| RegistryError::InvalidSchema { format, reason })
}

/// Judges `new_text` against `old_text` for a single, non-transitive
/// level. Transitive levels are the registry's responsibility to fan out
/// over every prior version and reduce with [`CompatibilityLevel::base`].
pub fn check(
    format: Format,
    old_text: &str,
    new_text: &str,
    level: CompatibilityLevel,
) -> CompatOutcome {
    let engine = engine(format);
    match level.base() {
        CompatibilityLevel::None => CompatOutcome::ok(),
        CompatibilityLevel::Backward => engine.check_direction(old_text, new_text),
        CompatibilityLevel::Forward => engine.check_direction(new_text, old_text),
        CompatibilityLevel::Full => engine
            .check_direction(old_text, new_text)
            .merge(engine.check_direction(new_text, old_text)),
        // `base()` never returns a transitive variant.
        _ => unreachable!("CompatibilityLevel::base() always returns a non-transitive level"),
    }
}
