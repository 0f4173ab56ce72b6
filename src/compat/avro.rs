//! Avro compatibility rules, recursing over record fields.
//!
//! `check_direction(writer_text, reader_text)` answers: can a reader using
//! `reader_text` decode data written by `writer_text`? Backward and
//! forward compatibility are both expressed as calls to this one function
//! with the arguments swapped — see [`super::check`].

use avro_rs::schema::{RecordField, Schema as AvroSchema};

use super::{CompatOutcome, FormatEngine};

pub(super) struct AvroEngine;

impl FormatEngine for AvroEngine {
    fn validate(&self, text: &str) -> Result<(), String> {
        AvroSchema::parse_str(text)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn check_direction(&self, writer_text: &str, reader_text: &str) -> CompatOutcome {
        let writer = match AvroSchema::parse_str(writer_text) {
            Ok(s) => s,
            Err(e) => return CompatOutcome::violation(format!("writer schema failed to parse: {e}")),
        };
        let reader = match AvroSchema::parse_str(reader_text) {
            Ok(s) => s,
            Err(e) => return CompatOutcome::violation(format!("reader schema failed to parse: {e}")),
        };
        schema_direction(&writer, &reader)
    }
}

fn schema_direction(writer: &AvroSchema, reader: &AvroSchema) -> CompatOutcome {
    match (writer, reader) {
        (AvroSchema::Record { fields: wf, .. }, AvroSchema::Record { fields: rf, .. }) => {
            fields_direction(wf, rf)
        }
        (AvroSchema::Array(w), AvroSchema::Array(r)) => {
            tag("array element", schema_direction(w, r))
        }
        (AvroSchema::Map(w), AvroSchema::Map(r)) => tag("map value", schema_direction(w, r)),
        (AvroSchema::Enum { symbols: ws, .. }, AvroSchema::Enum { symbols: rs, .. }) => {
            let missing: Vec<_> = ws.iter().filter(|s| !rs.contains(s)).cloned().collect();
            if missing.is_empty() {
                CompatOutcome::ok()
            } else {
                CompatOutcome::violation(format!(
                    "enum symbol(s) {:?} from writer schema missing from reader schema",
                    missing
                ))
            }
        }
        (AvroSchema::Union(wu), AvroSchema::Union(ru)) => {
            let reader_branches = ru.variants();
            let mut missing = Vec::new();
            for branch in wu.variants() {
                if !reader_branches
                    .iter()
                    .any(|r| schema_direction(branch, r).compatible)
                {
                    missing.push(shape_name(branch));
                }
            }
            if missing.is_empty() {
                CompatOutcome::ok()
            } else {
                CompatOutcome::violation(format!(
                    "union branch(es) {:?} from writer schema have no compatible reader branch",
                    missing
                ))
            }
        }
        (w, r) if is_union(r) && !is_union(w) => {
            // A non-union writer is compatible with a union reader iff one
            // of the reader's branches accepts it.
            let branches = union_variants(r);
            if branches.iter().any(|b| schema_direction(w, b).compatible) {
                CompatOutcome::ok()
            } else {
                CompatOutcome::violation(format!(
                    "writer type {} has no compatible branch in reader union",
                    shape_name(w)
                ))
            }
        }
        (w, r) => promotable(w, r),
    }
}

fn fields_direction(writer_fields: &[RecordField], reader_fields: &[RecordField]) -> CompatOutcome {
    let mut out = CompatOutcome::ok();
    // Every field the writer produced must either still be readable, or
    // have been a removable (non-required) field.
    for field in writer_fields {
        match reader_fields.iter().find(|f| f.name == field.name) {
            Some(rfield) => {
                let nested = schema_direction(&field.schema, &rfield.schema);
                if !nested.compatible {
                    out = out.merge(tag(&format!("field `{}`", field.name), nested));
                }
            }
            None => {
                if field_required(&field.schema) {
                    out = out.merge(CompatOutcome::violation(format!(
                        "required field `{}` was removed",
                        field.name
                    )));
                }
            }
        }
    }
    // A field the reader expects but the writer never produced can only be
    // filled in from its default; with no default, resolution fails.
    for field in reader_fields {
        let is_new = !writer_fields.iter().any(|f| f.name == field.name);
        if is_new && field.default.is_none() {
            out = out.merge(CompatOutcome::violation(format!(
                "field `{}` was added with no default and cannot be filled in when reading data missing it",
                field.name
            )));
        }
    }
    out
}

/// A field is required unless its type is a union containing `null`.
fn field_required(schema: &AvroSchema) -> bool {
    match schema {
        AvroSchema::Union(u) => !u.variants().iter().any(|s| matches!(s, AvroSchema::Null)),
        _ => true,
    }
}

fn is_union(schema: &AvroSchema) -> bool {
    matches!(schema, AvroSchema::Union(_))
}

fn union_variants(schema: &AvroSchema) -> Vec<AvroSchema> {
    match schema {
        AvroSchema::Union(u) => u.variants().to_vec(),
        other => vec![other.clone()],
    }
}

fn tag(context: &str, outcome: CompatOutcome) -> CompatOutcome {
    if outcome.compatible {
        return outcome;
    }
    CompatOutcome {
        compatible: false,
        reasons: outcome
            .reasons
            .into_iter()
            .map(|r| format!("{context}: {r}"))
            .collect(),
    }
}

fn shape_name(schema: &AvroSchema) -> &'static str {
    match schema {
        AvroSchema::Null => "null",
        AvroSchema::Boolean => "boolean",
        AvroSchema::Int => "int",
        AvroSchema::Long => "long",
        AvroSchema::Float => "float",
        AvroSchema::Double => "double",
        AvroSchema::Bytes => "bytes",
        AvroSchema::String => "string",
        AvroSchema::Array(_) => "array",
        AvroSchema::Map(_) => "map",
        AvroSchema::Union(_) => "union",
        AvroSchema::Record { .. } => "record",
        AvroSchema::Enum { .. } => "enum",
        AvroSchema::Fixed { .. } => "fixed",
        _ => "unsupported",
    }
}

/// `int -> {int,long,float,double}`, `long -> {long,float,double}`,
/// `float -> {float,double}`, `double -> {double}`,
/// `bytes -> {bytes,string}`, `string -> {string}`. Primitives with no
/// rule map to themselves only.
fn promotable(writer: &AvroSchema, reader: &AvroSchema) -> CompatOutcome {
    use AvroSchema::*;
    let ok = matches!(
        (writer, reader),
        (Int, Int) | (Int, Long) | (Int, Float) | (Int, Double)
            | (Long, Long) | (Long, Float) | (Long, Double)
            | (Float, Float) | (Float, Double)
            | (Double, Double)
            | (Bytes, Bytes) | (Bytes, String)
            | (String, String)
            | (Boolean, Boolean)
            | (Null, Null)
            | (Fixed { .. }, Fixed { .. })
    );
    if ok {
        CompatOutcome::ok()
    } else {
        CompatOutcome::violation(format!(
            "writer type {} is not promotable to reader type {}",
            shape_name(writer),
            shape_name(reader)
        ))
    }
}
