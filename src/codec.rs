//! The wire envelope and per-format payload codec described in §4.5: a
//! magic byte, a big-endian schema ID, and a format-specific payload.
//!
//! `serde_json::Value` is the canonical in-memory representation across
//! all three dialects — the caller never sees `avro_rs::types::Value` or a
//! hand-rolled protobuf message type, only JSON.

use serde_json::Value;

use crate::schema::{Format, Schema};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("input too short to contain a wire envelope")]
    ShortInput,

    #[error("unrecognized magic byte {0:#04x}, expected 0x00")]
    BadMagic(u8),

    #[error("failed to encode {format} payload: {reason}")]
    Encode { format: Format, reason: String },

    #[error("failed to decode {format} payload: {reason}")]
    Decode { format: Format, reason: String },
}

pub const MAGIC_BYTE: u8 = 0x00;
pub const ENVELOPE_HEADER_LEN: usize = 5;

/// `0x00 ‖ BE32(id) ‖ payload`.
pub fn encode_envelope(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    bytes.push(MAGIC_BYTE);
    bytes.extend_from_slice(&id.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Splits a wire envelope into its schema ID and payload slice.
pub fn decode_envelope(bytes: &[u8]) -> Result<(u32, &[u8]), CodecError> {
    if bytes.len() < ENVELOPE_HEADER_LEN {
        return Err(CodecError::ShortInput);
    }
    if bytes[0] != MAGIC_BYTE {
        return Err(CodecError::BadMagic(bytes[0]));
    }
    let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok((id, &bytes[ENVELOPE_HEADER_LEN..]))
}

/// Encodes `value` as the format-specific payload named by `schema`,
/// without the envelope header — callers compose with [`encode_envelope`].
pub fn encode_payload(schema: &Schema, value: &Value) -> Result<Vec<u8>, CodecError> {
    match schema.format {
        Format::Json => serde_json::to_vec(value).map_err(|e| encode_err(Format::Json, e)),
        Format::Avro => avro::encode(&schema.text, value),
        Format::Protobuf => protobuf_wire::encode(&schema.text, value),
    }
}

pub fn decode_payload(schema: &Schema, payload: &[u8]) -> Result<Value, CodecError> {
    match schema.format {
        Format::Json => serde_json::from_slice(payload).map_err(|e| decode_err(Format::Json, e)),
        Format::Avro => avro::decode(&schema.text, payload),
        Format::Protobuf => protobuf_wire::decode(&schema.text, payload),
    }
}

fn encode_err(format: Format, e: impl std::fmt::Display) -> CodecError {
    CodecError::Encode {
        format,
        reason: e.to_string(),
    }
}

fn decode_err(format: Format, e: impl std::fmt::Display) -> CodecError {
    CodecError::Decode {
        format,
        reason: e.to_string(),
    }
}

#[cfg(feature = "avro")]
mod avro {
    use avro_rs::{Reader, Schema as AvroSchema, Writer};
    use serde_json::Value;

    use super::CodecError;
    use crate::schema::Format;

    pub fn encode(text: &str, value: &Value) -> Result<Vec<u8>, CodecError> {
        let schema = AvroSchema::parse_str(text).map_err(|e| super::encode_err(Format::Avro, e))?;
        let mut writer = Writer::new(&schema, Vec::new());
        writer
            .append_ser(value)
            .map_err(|e| super::encode_err(Format::Avro, e))?;
        writer
            .into_inner()
            .map_err(|e| super::encode_err(Format::Avro, e))
    }

    pub fn decode(text: &str, payload: &[u8]) -> Result<Value, CodecError> {
        let schema = AvroSchema::parse_str(text).map_err(|e| super::decode_err(Format::Avro, e))?;
        let mut reader =
            Reader::with_schema(&schema, payload).map_err(|e| super::decode_err(Format::Avro, e))?;
        let record = reader
            .next()
            .ok_or_else(|| super::decode_err(Format::Avro, "payload contained no avro record"))?
            .map_err(|e| super::decode_err(Format::Avro, e))?;
        avro_rs::from_value(&record).map_err(|e| super::decode_err(Format::Avro, e))
    }
}

#[cfg(not(feature = "avro"))]
mod avro {
    use serde_json::Value;

    use super::CodecError;
    use crate::schema::Format;

    pub fn encode(_text: &str, _value: &Value) -> Result<Vec<u8>, CodecError> {
        Err(super::encode_err(Format::Avro, "avro support not compiled in"))
    }

    pub fn decode(_text: &str, _payload: &[u8]) -> Result<Value, CodecError> {
        Err(super::decode_err(Format::Avro, "avro support not compiled in"))
    }
}

/// A small hand-rolled protobuf wire codec: it walks the field-number
/// descriptor parsed by [`crate::compat::protobuf`] and reuses the
/// upstream `protobuf` crate only for the low-level varint, fixed-width,
/// and length-delimited primitives — there is no generated message type
/// to serialize against, since the schema itself is data here.
#[cfg(feature = "proto")]
mod protobuf_wire {
    use protobuf::{CodedInputStream, CodedOutputStream};
    use serde_json::{Map, Value};

    use super::CodecError;
    use crate::compat::protobuf::{parse_file, Cardinality, FieldDesc, FieldKind, MessageDesc, ScalarType};
    use crate::schema::Format;

    pub fn encode(text: &str, value: &Value) -> Result<Vec<u8>, CodecError> {
        let desc = parse_file(text).map_err(|e| super::encode_err(Format::Protobuf, e))?;
        let obj = value
            .as_object()
            .ok_or_else(|| super::encode_err(Format::Protobuf, "payload must be a JSON object"))?;
        encode_message(&desc, obj)
    }

    pub fn decode(text: &str, payload: &[u8]) -> Result<Value, CodecError> {
        let desc = parse_file(text).map_err(|e| super::decode_err(Format::Protobuf, e))?;
        decode_message(&desc, payload)
    }

    fn encode_message(desc: &MessageDesc, obj: &Map<String, Value>) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        {
            let mut cos = CodedOutputStream::new(&mut buf);
            for field in &desc.fields {
                let raw = match obj.get(&field.name) {
                    Some(v) => v,
                    None => continue,
                };
                if field.cardinality == Cardinality::Repeated {
                    let items = raw.as_array().ok_or_else(|| {
                        super::encode_err(
                            Format::Protobuf,
                            format!("field `{}` is repeated, expected a JSON array", field.name),
                        )
                    })?;
                    for item in items {
                        write_field(&mut cos, desc, field, item)?;
                    }
                } else {
                    write_field(&mut cos, desc, field, raw)?;
                }
            }
            cos.flush()
                .map_err(|e| super::encode_err(Format::Protobuf, e))?;
        }
        Ok(buf)
    }

    fn write_field(
        cos: &mut CodedOutputStream,
        desc: &MessageDesc,
        field: &FieldDesc,
        value: &Value,
    ) -> Result<(), CodecError> {
        match &field.kind {
            FieldKind::Scalar(scalar) => write_scalar(cos, field.number, *scalar, value),
            FieldKind::Message(name) => {
                let nested_desc = desc.nested.get(name).ok_or_else(|| {
                    super::encode_err(Format::Protobuf, format!("unknown nested message `{name}`"))
                })?;
                let nested_obj = value.as_object().ok_or_else(|| {
                    super::encode_err(
                        Format::Protobuf,
                        format!("field `{}` expects a JSON object", field.name),
                    )
                })?;
                let nested_bytes = encode_message(nested_desc, nested_obj)?;
                write_tag(cos, field.number, 2)?;
                cos.write_raw_varint32(nested_bytes.len() as u32)
                    .map_err(|e| super::encode_err(Format::Protobuf, e))?;
                cos.write_raw_bytes(&nested_bytes)
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
        }
    }

    fn write_tag(cos: &mut CodedOutputStream, field_number: u32, wire_type: u64) -> Result<(), CodecError> {
        let tag = ((field_number as u64) << 3) | wire_type;
        cos.write_raw_varint64(tag)
            .map_err(|e| super::encode_err(Format::Protobuf, e))
    }

    fn write_scalar(
        cos: &mut CodedOutputStream,
        number: u32,
        scalar: ScalarType,
        value: &Value,
    ) -> Result<(), CodecError> {
        use ScalarType::*;
        let bad = || super::encode_err(Format::Protobuf, "value did not match the field's declared scalar type");
        match scalar {
            Int32 | Int64 | UInt32 | UInt64 => {
                write_tag(cos, number, 0)?;
                let n = value.as_i64().or_else(|| value.as_u64().map(|u| u as i64)).ok_or_else(bad)?;
                cos.write_raw_varint64(n as u64)
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
            Bool => {
                write_tag(cos, number, 0)?;
                let b = value.as_bool().ok_or_else(bad)?;
                cos.write_raw_varint64(if b { 1 } else { 0 })
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
            SInt32 => {
                write_tag(cos, number, 0)?;
                let n = value.as_i64().ok_or_else(bad)? as i32;
                cos.write_raw_varint32(zigzag_encode32(n))
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
            SInt64 => {
                write_tag(cos, number, 0)?;
                let n = value.as_i64().ok_or_else(bad)?;
                cos.write_raw_varint64(zigzag_encode64(n))
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
            Fixed32 => {
                write_tag(cos, number, 5)?;
                let n = value.as_u64().ok_or_else(bad)? as u32;
                cos.write_raw_little_endian32(n)
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
            SFixed32 => {
                write_tag(cos, number, 5)?;
                let n = value.as_i64().ok_or_else(bad)? as i32;
                cos.write_raw_little_endian32(n as u32)
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
            Float => {
                write_tag(cos, number, 5)?;
                let f = value.as_f64().ok_or_else(bad)? as f32;
                cos.write_raw_little_endian32(f.to_bits())
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
            Fixed64 => {
                write_tag(cos, number, 1)?;
                let n = value.as_u64().ok_or_else(bad)?;
                cos.write_raw_little_endian64(n)
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
            SFixed64 => {
                write_tag(cos, number, 1)?;
                let n = value.as_i64().ok_or_else(bad)?;
                cos.write_raw_little_endian64(n as u64)
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
            Double => {
                write_tag(cos, number, 1)?;
                let f = value.as_f64().ok_or_else(bad)?;
                cos.write_raw_little_endian64(f.to_bits())
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
            String | Bytes => {
                write_tag(cos, number, 2)?;
                let s = value.as_str().ok_or_else(bad)?;
                cos.write_raw_varint32(s.len() as u32)
                    .map_err(|e| super::encode_err(Format::Protobuf, e))?;
                cos.write_raw_bytes(s.as_bytes())
                    .map_err(|e| super::encode_err(Format::Protobuf, e))
            }
        }
    }

    fn decode_message(desc: &MessageDesc, bytes: &[u8]) -> Result<Value, CodecError> {
        let mut cis = CodedInputStream::from_bytes(bytes);
        let mut obj = Map::new();
        while !cis.eof().map_err(|e| super::decode_err(Format::Protobuf, e))? {
            let tag = cis
                .read_raw_varint64()
                .map_err(|e| super::decode_err(Format::Protobuf, e))?;
            let field_number = (tag >> 3) as u32;
            let wire_type = (tag & 0x7) as u8;
            match desc.fields.iter().find(|f| f.number == field_number) {
                None => skip_unknown(&mut cis, wire_type)?,
                Some(field) => {
                    let value = read_field_value(&mut cis, desc, field)?;
                    if field.cardinality == Cardinality::Repeated {
                        obj.entry(field.name.clone())
                            .or_insert_with(|| Value::Array(Vec::new()))
                            .as_array_mut()
                            .expect("inserted as Array above")
                            .push(value);
                    } else {
                        obj.insert(field.name.clone(), value);
                    }
                }
            }
        }
        Ok(Value::Object(obj))
    }

    fn skip_unknown(cis: &mut CodedInputStream, wire_type: u8) -> Result<(), CodecError> {
        match wire_type {
            0 => cis.read_raw_varint64().map(|_| ()),
            1 => cis.read_raw_little_endian64().map(|_| ()),
            2 => match cis.read_raw_varint32() {
                Ok(len) => cis.read_raw_bytes(len).map(|_| ()),
                Err(e) => Err(e),
            },
            5 => cis.read_raw_little_endian32().map(|_| ()),
            other => {
                return Err(super::decode_err(
                    Format::Protobuf,
                    format!("unsupported wire type {other} in unknown field"),
                ))
            }
        }
        .map_err(|e| super::decode_err(Format::Protobuf, e))
    }

    fn read_field_value(
        cis: &mut CodedInputStream,
        desc: &MessageDesc,
        field: &FieldDesc,
    ) -> Result<Value, CodecError> {
        match &field.kind {
            FieldKind::Scalar(scalar) => read_scalar(cis, *scalar),
            FieldKind::Message(name) => {
                let len = cis
                    .read_raw_varint32()
                    .map_err(|e| super::decode_err(Format::Protobuf, e))?;
                let bytes = cis
                    .read_raw_bytes(len)
                    .map_err(|e| super::decode_err(Format::Protobuf, e))?;
                let nested_desc = desc.nested.get(name).ok_or_else(|| {
                    super::decode_err(Format::Protobuf, format!("unknown nested message `{name}`"))
                })?;
                decode_message(nested_desc, &bytes)
            }
        }
    }

    fn read_scalar(cis: &mut CodedInputStream, scalar: ScalarType) -> Result<Value, CodecError> {
        use ScalarType::*;
        let e = |err: protobuf::ProtobufError| super::decode_err(Format::Protobuf, err);
        Ok(match scalar {
            Int32 => Value::from(cis.read_raw_varint64().map_err(e)? as i64 as i32),
            Int64 => Value::from(cis.read_raw_varint64().map_err(e)? as i64),
            UInt32 => Value::from(cis.read_raw_varint64().map_err(e)? as u32),
            UInt64 => Value::from(cis.read_raw_varint64().map_err(e)?),
            Bool => Value::from(cis.read_raw_varint64().map_err(e)? != 0),
            SInt32 => Value::from(zigzag_decode32(cis.read_raw_varint32().map_err(e)?)),
            SInt64 => Value::from(zigzag_decode64(cis.read_raw_varint64().map_err(e)?)),
            Fixed32 => Value::from(cis.read_raw_little_endian32().map_err(e)?),
            SFixed32 => Value::from(cis.read_raw_little_endian32().map_err(e)? as i32),
            Float => Value::from(f32::from_bits(cis.read_raw_little_endian32().map_err(e)?) as f64),
            Fixed64 => Value::from(cis.read_raw_little_endian64().map_err(e)?),
            SFixed64 => Value::from(cis.read_raw_little_endian64().map_err(e)? as i64),
            Double => Value::from(f64::from_bits(cis.read_raw_little_endian64().map_err(e)?)),
            String | Bytes => {
                let len = cis.read_raw_varint32().map_err(e)?;
                let bytes = cis.read_raw_bytes(len).map_err(e)?;
                Value::from(std::string::String::from_utf8(bytes).map_err(|e| {
                    super::decode_err(Format::Protobuf, e)
                })?)
            }
        })
    }

    fn zigzag_encode32(n: i32) -> u32 {
        ((n << 1) ^ (n >> 31)) as u32
    }

    fn zigzag_decode32(n: u32) -> i32 {
        ((n >> 1) as i32) ^ -((n & 1) as i32)
    }

    fn zigzag_encode64(n: i64) -> u64 {
        ((n << 1) ^ (n >> 63)) as u64
    }

    fn zigzag_decode64(n: u64) -> i64 {
        ((n >> 1) as i64) ^ -((n & 1) as i64)
    }
}

#[cfg(not(feature = "proto"))]
mod protobuf_wire {
    use serde_json::Value;

    use super::CodecError;
    use crate::schema::Format;

    pub fn encode(_text: &str, _value: &Value) -> Result<Vec<u8>, CodecError> {
        Err(super::encode_err(Format::Protobuf, "protobuf support not compiled in"))
    }

    pub fn decode(_text: &str, _payload: &[u8]) -> Result<Value, CodecError> {
        Err(super::decode_err(Format::Protobuf, "protobuf support not compiled in"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let bytes = encode_envelope(42, b"hello");
        let (id, payload) = decode_envelope(&bytes).unwrap();
        assert_eq!(id, 42);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(matches!(decode_envelope(&[0, 0, 0]), Err(CodecError::ShortInput)));
    }

    #[test]
    fn bad_magic_byte_is_rejected() {
        let bytes = [1, 0, 0, 0, 1];
        assert!(matches!(decode_envelope(&bytes), Err(CodecError::BadMagic(1))));
    }

    #[test]
    fn json_payload_round_trips() {
        let schema = Schema {
            id: 1,
            subject: "s".into(),
            version: 1,
            format: Format::Json,
            text: r#"{"type":"object"}"#.into(),
            references: vec![],
        };
        let value = serde_json::json!({"x": 1});
        let bytes = encode_payload(&schema, &value).unwrap();
        let decoded = decode_payload(&schema, &bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[cfg(feature = "proto")]
    #[test]
    fn protobuf_payload_round_trips_scalars() {
        let schema = Schema {
            id: 1,
            subject: "s".into(),
            version: 1,
            format: Format::Protobuf,
            text: "message User { int32 id = 1; string name = 2; }".into(),
            references: vec![],
        };
        let value = serde_json::json!({"id": 7, "name": "ada"});
        let bytes = encode_payload(&schema, &value).unwrap();
        let decoded = decode_payload(&schema, &bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[cfg(feature = "proto")]
    #[test]
    fn protobuf_payload_round_trips_nested_and_repeated() {
        let schema = Schema {
            id: 1,
            subject: "s".into(),
            version: 1,
            format: Format::Protobuf,
            text: "message Order { message Item { string sku = 1; } repeated Item items = 1; }".into(),
            references: vec![],
        };
        let value = serde_json::json!({"items": [{"sku": "a"}, {"sku": "b"}]});
        let bytes = encode_payload(&schema, &value).unwrap();
        let decoded = decode_payload(&schema, &bytes).unwrap();
        assert_eq!(decoded, value);
    }
}
