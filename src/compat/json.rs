//! JSON Schema compatibility rules, operating on top-level `properties`.
//!
//! Unlike Avro, type matching here is by strict identity: `integer` does
//! **not** unify with `number` (see DESIGN.md's note on §9).

use serde_json::{Map, Value};

use super::{CompatOutcome, FormatEngine};

pub(super) struct JsonSchemaEngine;

impl FormatEngine for JsonSchemaEngine {
    fn validate(&self, text: &str) -> Result<(), String> {
        parse_doc(text).map(|_| ())
    }

    fn check_direction(&self, writer_text: &str, reader_text: &str) -> CompatOutcome {
        let writer = match parse_doc(writer_text) {
            Ok(doc) => doc,
            Err(e) => return CompatOutcome::violation(format!("writer schema invalid: {e}")),
        };
        let reader = match parse_doc(reader_text) {
            Ok(doc) => doc,
            Err(e) => return CompatOutcome::violation(format!("reader schema invalid: {e}")),
        };
        doc_direction(&writer, &reader)
    }
}

struct Doc {
    properties: Map<String, Value>,
    required: Vec<String>,
}

fn parse_doc(text: &str) -> Result<Doc, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let obj = value
        .as_object()
        .ok_or_else(|| "top-level schema must be a JSON object".to_string())?;
    // Default top-level type when not specified: "object".
    let declared_type = obj.get("type").and_then(Value::as_str).unwrap_or("object");
    if declared_type != "object" {
        return Err(format!(
            "only top-level type \"object\" is supported, found \"{declared_type}\""
        ));
    }
    let properties = obj
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let required = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    Ok(Doc {
        properties,
        required,
    })
}

/// For each property in `writer`: if missing in `reader`, `writer` must not
/// have required it; if present, the declared type must match exactly and
/// it must not have become newly required.
fn doc_direction(writer: &Doc, reader: &Doc) -> CompatOutcome {
    let mut out = CompatOutcome::ok();
    for (name, writer_prop) in &writer.properties {
        let was_required = writer.required.contains(name);
        match reader.properties.get(name) {
            None => {
                if was_required {
                    out = out.merge(CompatOutcome::violation(format!(
                        "required property `{name}` was removed"
                    )));
                }
            }
            Some(reader_prop) => {
                let writer_type = writer_prop.get("type");
                let reader_type = reader_prop.get("type");
                if writer_type != reader_type {
                    out = out.merge(CompatOutcome::violation(format!(
                        "property `{name}` changed type from {writer_type:?} to {reader_type:?}"
                    )));
                }
                let now_required = reader.required.contains(name);
                if now_required && !was_required {
                    out = out.merge(CompatOutcome::violation(format!(
                        "property `{name}` became required"
                    )));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_integer_does_not_unify_with_number() {
        let old = r#"{"type":"object","properties":{"x":{"type":"integer"}},"required":["x"]}"#;
        let new = r#"{"type":"object","properties":{"x":{"type":"number"}},"required":["x"]}"#;
        let outcome = doc_direction(&parse_doc(old).unwrap(), &parse_doc(new).unwrap());
        assert!(!outcome.compatible);
    }

    #[test]
    fn removing_optional_property_is_compatible() {
        let old = r#"{"type":"object","properties":{"x":{"type":"string"}}}"#;
        let new = r#"{"type":"object","properties":{}}"#;
        let outcome = doc_direction(&parse_doc(old).unwrap(), &parse_doc(new).unwrap());
        assert!(outcome.compatible);
    }

    #[test]
    fn removing_required_property_is_incompatible() {
        let old = r#"{"type":"object","properties":{"x":{"type":"string"}},"required":["x"]}"#;
        let new = r#"{"type":"object","properties":{}}"#;
        let outcome = doc_direction(&parse_doc(old).unwrap(), &parse_doc(new).unwrap());
        assert!(!outcome.compatible);
    }

    #[test]
    fn making_an_existing_optional_property_required_is_incompatible() {
        let old = r#"{"type":"object","properties":{"x":{"type":"string"}}}"#;
        let new = r#"{"type":"object","properties":{"x":{"type":"string"}},"required":["x"]}"#;
        let outcome = doc_direction(&parse_doc(old).unwrap(), &parse_doc(new).unwrap());
        assert!(!outcome.compatible);
    }

    #[test]
    fn default_top_level_type_is_object() {
        let doc = parse_doc(r#"{"properties":{"x":{"type":"string"}}}"#).unwrap();
        assert_eq!(doc.properties.len(), 1);
    }
}
