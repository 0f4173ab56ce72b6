//! Protobuf compatibility rules.
//!
//! The upstream `protobuf` crate (the teacher's optional `proto` feature)
//! supplies the wire-level primitives used by [`crate::codec`]; it has no
//! lightweight way to parse a bare `.proto` source string into a
//! descriptor without invoking `protoc`, so this module owns a small
//! recursive-descent parser for the field-number/kind/cardinality shape
//! the compatibility rules need. This is the "canonical generic
//! representation" §9 calls out as missing from the distilled design.

use std::collections::HashMap;
use std::iter::Peekable;
use std::vec::IntoIter;

use super::{CompatOutcome, FormatEngine};

pub(super) struct ProtobufEngine;

impl FormatEngine for ProtobufEngine {
    fn validate(&self, text: &str) -> Result<(), String> {
        parse_file(text).map(|_| ())
    }

    fn check_direction(&self, writer_text: &str, reader_text: &str) -> CompatOutcome {
        let writer = match parse_file(writer_text) {
            Ok(m) => m,
            Err(e) => return CompatOutcome::violation(format!("writer .proto failed to parse: {e}")),
        };
        let reader = match parse_file(reader_text) {
            Ok(m) => m,
            Err(e) => return CompatOutcome::violation(format!("reader .proto failed to parse: {e}")),
        };
        message_direction(&writer, &reader)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScalarType {
    Int32,
    Int64,
    UInt32,
    UInt64,
    SInt32,
    SInt64,
    Fixed32,
    Fixed64,
    SFixed32,
    SFixed64,
    Bool,
    String,
    Bytes,
    Double,
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FieldKind {
    Scalar(ScalarType),
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cardinality {
    Singular,
    Optional,
    Repeated,
    Required,
}

#[derive(Debug, Clone)]
pub(crate) struct FieldDesc {
    pub name: String,
    pub number: u32,
    pub kind: FieldKind,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageDesc {
    pub name: String,
    pub fields: Vec<FieldDesc>,
    pub nested: HashMap<String, MessageDesc>,
}

fn scalar_kind(token: &str) -> Option<ScalarType> {
    Some(match token {
        "int32" => ScalarType::Int32,
        "int64" => ScalarType::Int64,
        "uint32" => ScalarType::UInt32,
        "uint64" => ScalarType::UInt64,
        "sint32" => ScalarType::SInt32,
        "sint64" => ScalarType::SInt64,
        "fixed32" => ScalarType::Fixed32,
        "fixed64" => ScalarType::Fixed64,
        "sfixed32" => ScalarType::SFixed32,
        "sfixed64" => ScalarType::SFixed64,
        "bool" => ScalarType::Bool,
        "string" => ScalarType::String,
        "bytes" => ScalarType::Bytes,
        "double" => ScalarType::Double,
        "float" => ScalarType::Float,
        _ => return None,
    })
}

fn tokenize(src: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '/' {
            let mut lookahead = chars.clone();
            lookahead.next();
            if lookahead.peek() == Some(&'/') {
                for c2 in chars.by_ref() {
                    if c2 == '\n' {
                        break;
                    }
                }
                continue;
            }
        }
        if "{};=\"".contains(c) {
            tokens.push(c.to_string());
            chars.next();
            continue;
        }
        let mut buf = String::new();
        while let Some(&c2) = chars.peek() {
            if c2.is_whitespace() || "{};=\"".contains(c2) {
                break;
            }
            buf.push(c2);
            chars.next();
        }
        if !buf.is_empty() {
            tokens.push(buf);
        }
    }
    tokens
}

type Tokens = Peekable<IntoIter<String>>;

fn expect(tokens: &mut Tokens, want: &str) -> Result<(), String> {
    match tokens.next() {
        Some(ref t) if t == want => Ok(()),
        other => Err(format!("expected `{want}`, found {other:?}")),
    }
}

/// Parses the first message type in the file, recursing into nested
/// messages. Everything before the first `message` keyword (`syntax`,
/// `package`, imports) is skipped.
///
/// Shared with [`crate::codec`], which walks the same descriptor to encode
/// and decode wire payloads field-by-field.
pub(crate) fn parse_file(text: &str) -> Result<MessageDesc, String> {
    let tokens = tokenize(text);
    let mut iter = tokens.into_iter().peekable();
    while let Some(tok) = iter.peek() {
        if tok == "message" {
            return parse_message(&mut iter);
        }
        iter.next();
    }
    Err("no message type found".to_string())
}

fn parse_message(tokens: &mut Tokens) -> Result<MessageDesc, String> {
    expect(tokens, "message")?;
    let name = tokens.next().ok_or("expected message name")?;
    expect(tokens, "{")?;
    let mut fields = Vec::new();
    let mut nested = HashMap::new();
    loop {
        match tokens.peek().map(String::as_str) {
            Some("}") => {
                tokens.next();
                break;
            }
            Some("message") => {
                let m = parse_message(tokens)?;
                nested.insert(m.name.clone(), m);
            }
            Some(_) => fields.push(parse_field(tokens)?),
            None => return Err("unexpected end of input inside message".to_string()),
        }
    }
    Ok(MessageDesc {
        name,
        fields,
        nested,
    })
}

fn parse_field(tokens: &mut Tokens) -> Result<FieldDesc, String> {
    let mut cardinality = Cardinality::Singular;
    let mut tok = tokens.next().ok_or("expected field declaration")?;
    match tok.as_str() {
        "repeated" => {
            cardinality = Cardinality::Repeated;
            tok = tokens.next().ok_or("expected type after `repeated`")?;
        }
        "optional" => {
            cardinality = Cardinality::Optional;
            tok = tokens.next().ok_or("expected type after `optional`")?;
        }
        "required" => {
            cardinality = Cardinality::Required;
            tok = tokens.next().ok_or("expected type after `required`")?;
        }
        _ => {}
    }
    let type_token = tok;
    let name = tokens.next().ok_or("expected field name")?;
    expect(tokens, "=")?;
    let number_token = tokens.next().ok_or("expected field number")?;
    let number: u32 = number_token
        .parse()
        .map_err(|_| format!("invalid field number `{number_token}`"))?;
    expect(tokens, ";")?;
    let kind = scalar_kind(&type_token)
        .map(FieldKind::Scalar)
        .unwrap_or(FieldKind::Message(type_token));
    Ok(FieldDesc {
        name,
        number,
        kind,
        cardinality,
    })
}

/// Each old field (keyed by field number) must exist in the new
/// descriptor, with matching cardinality and a promotable wire kind.
fn message_direction(writer: &MessageDesc, reader: &MessageDesc) -> CompatOutcome {
    let mut out = CompatOutcome::ok();
    for field in &writer.fields {
        match reader.fields.iter().find(|f| f.number == field.number) {
            None => {
                out = out.merge(CompatOutcome::violation(format!(
                    "field number {} (`{}`) was removed",
                    field.number, field.name
                )));
            }
            Some(rfield) => {
                if field.cardinality != rfield.cardinality {
                    out = out.merge(CompatOutcome::violation(format!(
                        "field number {} changed cardinality from {:?} to {:?}",
                        field.number, field.cardinality, rfield.cardinality
                    )));
                }
                let kind_outcome = kind_direction(&field.kind, &rfield.kind, writer, reader);
                if !kind_outcome.compatible {
                    out = out.merge(kind_outcome);
                }
            }
        }
    }
    out
}

fn kind_direction(
    writer_kind: &FieldKind,
    reader_kind: &FieldKind,
    writer_scope: &MessageDesc,
    reader_scope: &MessageDesc,
) -> CompatOutcome {
    match (writer_kind, reader_kind) {
        (FieldKind::Scalar(w), FieldKind::Scalar(r)) => {
            if scalar_promotable(*w, *r) {
                CompatOutcome::ok()
            } else {
                CompatOutcome::violation(format!("type changed from {w:?} to {r:?}"))
            }
        }
        (FieldKind::Message(w), FieldKind::Message(r)) => {
            match (writer_scope.nested.get(w), reader_scope.nested.get(r)) {
                (Some(wm), Some(rm)) => message_direction(wm, rm),
                _ if w == r => CompatOutcome::ok(),
                _ => CompatOutcome::violation(format!(
                    "message type changed from `{w}` to `{r}`"
                )),
            }
        }
        (w, r) => CompatOutcome::violation(format!("type changed from {w:?} to {r:?}")),
    }
}

/// Integer families permit widening within the same sign/encoding;
/// `string`/`bytes` pair since both are length-delimited on the wire.
fn scalar_promotable(writer: ScalarType, reader: ScalarType) -> bool {
    use ScalarType::*;
    matches!(
        (writer, reader),
        (Int32, Int32) | (Int32, Int64)
            | (Int64, Int64)
            | (UInt32, UInt32) | (UInt32, UInt64)
            | (UInt64, UInt64)
            | (SInt32, SInt32) | (SInt32, SInt64)
            | (SInt64, SInt64)
            | (Fixed32, Fixed32) | (Fixed32, Fixed64)
            | (Fixed64, Fixed64)
            | (SFixed32, SFixed32) | (SFixed32, SFixed64)
            | (SFixed64, SFixed64)
            | (Bool, Bool)
            | (Double, Double)
            | (Float, Float)
            | (String, String) | (String, Bytes)
            | (Bytes, Bytes) | (Bytes, String)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1: &str = "message User { int32 id = 1; string name = 2; }";

    #[test]
    fn s4_additive_field_is_backward_compatible() {
        let v2 = "message User { int32 id = 1; string name = 2; string email = 3; }";
        let outcome = message_direction(&parse_file(V1).unwrap(), &parse_file(v2).unwrap());
        assert!(outcome.compatible, "{:?}", outcome.reasons);
    }

    #[test]
    fn s5_type_change_is_rejected() {
        let v2 = "message User { string id = 1; string name = 2; }";
        let outcome = message_direction(&parse_file(V1).unwrap(), &parse_file(v2).unwrap());
        assert!(!outcome.compatible);
    }

    #[test]
    fn removed_field_is_rejected() {
        let v2 = "message User { int32 id = 1; }";
        let outcome = message_direction(&parse_file(V1).unwrap(), &parse_file(v2).unwrap());
        assert!(!outcome.compatible);
    }

    #[test]
    fn int32_widens_to_int64() {
        assert!(scalar_promotable(ScalarType::Int32, ScalarType::Int64));
        assert!(!scalar_promotable(ScalarType::Int64, ScalarType::Int32));
    }

    #[test]
    fn nested_message_fields_recurse() {
        let v1 = "message Outer { message Inner { int32 x = 1; } Inner inner = 1; }";
        let v2 = "message Outer { message Inner { int32 x = 1; int32 y = 2; } Inner inner = 1; }";
        let outcome = message_direction(&parse_file(v1).unwrap(), &parse_file(v2).unwrap());
        assert!(outcome.compatible, "{:?}", outcome.reasons);
    }

    #[test]
    fn parses_syntax_and_package_preamble() {
        let text = "syntax = \"proto3\"; package demo; message User { int32 id = 1; }";
        let desc = parse_file(text).unwrap();
        assert_eq!(desc.name, "User");
    }
}
