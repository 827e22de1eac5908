//! Generic value tree and its binary encoding.
//!
//! Every value is encoded as `<type byte> [body]`. The low nibble of the
//! type byte selects the type, the high nibble carries type-specific flags.
//! Variable-length integers use 7-bit little-endian groups with the high bit
//! marking continuation.

use crate::error::DecodeError;
use crate::registry;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::Read;

/// Low-nibble type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Void = 0x00,
    Scalar = 0x01,
    Boolean = 0x02,
    Float = 0x03,
    String = 0x04,
    Bytes = 0x05,
    Array = 0x06,
    Map = 0x07,
    Struct = 0x08,
}

impl TypeTag {
    pub fn from_byte(b: u8) -> Option<TypeTag> {
        match b & 0x0F {
            0x00 => Some(TypeTag::Void),
            0x01 => Some(TypeTag::Scalar),
            0x02 => Some(TypeTag::Boolean),
            0x03 => Some(TypeTag::Float),
            0x04 => Some(TypeTag::String),
            0x05 => Some(TypeTag::Bytes),
            0x06 => Some(TypeTag::Array),
            0x07 => Some(TypeTag::Map),
            0x08 => Some(TypeTag::Struct),
            _ => None,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Void => "Void",
            TypeTag::Scalar => "Scalar",
            TypeTag::Boolean => "Boolean",
            TypeTag::Float => "Float",
            TypeTag::String => "String",
            TypeTag::Bytes => "Bytes",
            TypeTag::Array => "Array",
            TypeTag::Map => "Map",
            TypeTag::Struct => "Struct",
        };
        f.write_str(name)
    }
}

/// Scalar flags: signed type, zero short form, negative magnitude.
const SCALAR_SIGNED: u8 = 0x01 << 4;
const SCALAR_ZERO: u8 = 0x01 << 5;
const SCALAR_NEGATIVE: u8 = 0x01 << 6;

/// Boolean flag: the value itself.
const BOOL_VALUE: u8 = 0x01 << 4;

/// Float flags: 64-bit width, zero short form.
const FLOAT_WIDE: u8 = 0x01 << 4;
const FLOAT_ZERO: u8 = 0x01 << 5;

/// Container flag: empty short form (string, bytes, array, map).
const EMPTY: u8 = 0x01 << 4;

/// The body of an encoded struct: its registry id plus tagged fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructBody {
    pub id: String,
    pub fields: Vec<(u64, Value)>,
}

/// A decoded value in generic, width-normalized form.
///
/// Scalars keep the wire-level `(signed, negative, magnitude)` triple;
/// binding into a declared field type happens through [`crate::FromValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Boolean(bool),
    Scalar {
        signed: bool,
        negative: bool,
        magnitude: u64,
    },
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Struct(StructBody),
}

impl Value {
    pub fn kind(&self) -> TypeTag {
        match self {
            Value::Void => TypeTag::Void,
            Value::Boolean(_) => TypeTag::Boolean,
            Value::Scalar { .. } => TypeTag::Scalar,
            Value::Float32(_) | Value::Float64(_) => TypeTag::Float,
            Value::String(_) => TypeTag::String,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::Array(_) => TypeTag::Array,
            Value::Map(_) => TypeTag::Map,
            Value::Struct(_) => TypeTag::Struct,
        }
    }
}

macro_rules! value_from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Value {
                Value::Scalar { signed: false, negative: false, magnitude: v as u64 }
            }
        }
    )*};
}

macro_rules! value_from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Value {
                Value::Scalar { signed: true, negative: v < 0, magnitude: v.unsigned_abs() as u64 }
            }
        }
    )*};
}

value_from_unsigned!(u8, u16, u32, u64);
value_from_signed!(i8, i16, i32, i64);

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Boolean(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Value {
        Value::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_string())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Value {
        Value::Bytes(v)
    }
}

pub(crate) fn encode_uvarint(buf: &mut BytesMut, mut x: u64) {
    while x >= 0x80 {
        buf.put_u8(x as u8 | 0x80);
        x >>= 7;
    }
    buf.put_u8(x as u8);
}

pub(crate) fn decode_uvarint(r: &mut dyn Read) -> Result<u64, DecodeError> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    loop {
        let b = read_u8(r)?;
        if s >= 64 {
            return Err(DecodeError::VarintOverflow);
        }
        if b < 0x80 {
            return Ok(x | (b as u64) << s);
        }
        x |= ((b & 0x7F) as u64) << s;
        s += 7;
    }
}

fn read_u8(r: &mut dyn Read) -> Result<u8, DecodeError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_vec(r: &mut dyn Read, n: usize) -> Result<Vec<u8>, DecodeError> {
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Encodes a value, appending it to `buf`.
///
/// Zero numerics and empty containers always use the single-byte short form
/// so that the canonical encoding is stable.
pub fn encode_value(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Void => buf.put_u8(TypeTag::Void as u8),
        Value::Boolean(v) => {
            let mut tb = TypeTag::Boolean as u8;
            if *v {
                tb |= BOOL_VALUE;
            }
            buf.put_u8(tb);
        }
        Value::Scalar {
            signed,
            negative,
            magnitude,
        } => {
            let mut tb = TypeTag::Scalar as u8;
            if *signed {
                tb |= SCALAR_SIGNED;
            }
            if *magnitude == 0 {
                buf.put_u8(tb | SCALAR_ZERO);
                return;
            }
            if *negative {
                tb |= SCALAR_NEGATIVE;
            }
            buf.put_u8(tb);
            encode_uvarint(buf, *magnitude);
        }
        Value::Float32(v) => {
            if *v == 0.0 {
                buf.put_u8(TypeTag::Float as u8 | FLOAT_ZERO);
            } else {
                buf.put_u8(TypeTag::Float as u8);
                buf.put_u32(v.to_bits());
            }
        }
        Value::Float64(v) => {
            if *v == 0.0 {
                buf.put_u8(TypeTag::Float as u8 | FLOAT_WIDE | FLOAT_ZERO);
            } else {
                buf.put_u8(TypeTag::Float as u8 | FLOAT_WIDE);
                buf.put_u64(v.to_bits());
            }
        }
        Value::String(s) => encode_string(s, buf),
        Value::Bytes(b) => encode_bytes(b, buf),
        Value::Array(items) => {
            if items.is_empty() {
                buf.put_u8(TypeTag::Array as u8 | EMPTY);
                return;
            }
            buf.put_u8(TypeTag::Array as u8);
            encode_uvarint(buf, items.len() as u64);
            for item in items {
                encode_value(item, buf);
            }
        }
        Value::Map(pairs) => {
            if pairs.is_empty() {
                buf.put_u8(TypeTag::Map as u8 | EMPTY);
                return;
            }
            let mut keys = BytesMut::new();
            let mut values = BytesMut::new();
            for (k, v) in pairs {
                encode_value(k, &mut keys);
                encode_value(v, &mut values);
            }
            let mut count = BytesMut::new();
            encode_uvarint(&mut count, pairs.len() as u64);

            buf.put_u8(TypeTag::Map as u8);
            encode_uvarint(buf, (count.len() + keys.len() + values.len()) as u64);
            buf.put_slice(&count);
            buf.put_slice(&keys);
            buf.put_slice(&values);
        }
        Value::Struct(body) => {
            let mut sorted: Vec<&(u64, Value)> = body.fields.iter().collect();
            sorted.sort_by_key(|(tag, _)| *tag);

            let mut payload = BytesMut::new();
            for (tag, value) in sorted {
                encode_uvarint(&mut payload, *tag);
                encode_value(value, &mut payload);
            }

            buf.put_u8(TypeTag::Struct as u8);
            encode_string(&body.id, buf);
            encode_uvarint(buf, payload.len() as u64);
            buf.put_slice(&payload);
        }
    }
}

/// Encodes a value into a fresh buffer.
pub fn encode_to_vec(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_value(value, &mut buf);
    buf.to_vec()
}

/// Encodes a string value, appending it to `buf`.
pub fn encode_string(s: &str, buf: &mut BytesMut) {
    if s.is_empty() {
        buf.put_u8(TypeTag::String as u8 | EMPTY);
        return;
    }
    buf.put_u8(TypeTag::String as u8);
    encode_uvarint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

/// Encodes a byte-array value, appending it to `buf`.
pub fn encode_bytes(b: &[u8], buf: &mut BytesMut) {
    if b.is_empty() {
        buf.put_u8(TypeTag::Bytes as u8 | EMPTY);
        return;
    }
    buf.put_u8(TypeTag::Bytes as u8);
    encode_uvarint(buf, b.len() as u64);
    buf.put_slice(b);
}

/// Decodes one value from the reader.
pub fn decode_value(r: &mut dyn Read) -> Result<Value, DecodeError> {
    decode_any(r)
}

fn read_type(r: &mut dyn Read) -> Result<(TypeTag, u8), DecodeError> {
    let b = read_u8(r)?;
    match TypeTag::from_byte(b) {
        Some(tag) => Ok((tag, b)),
        None => Err(DecodeError::UnknownType(b & 0x0F)),
    }
}

fn decode_any(r: &mut dyn Read) -> Result<Value, DecodeError> {
    let (tag, header) = read_type(r)?;
    decode_body(tag, header, r)
}

fn decode_body(tag: TypeTag, header: u8, r: &mut dyn Read) -> Result<Value, DecodeError> {
    match tag {
        TypeTag::Void => Ok(Value::Void),
        TypeTag::Boolean => Ok(Value::Boolean(header & BOOL_VALUE != 0)),
        TypeTag::Scalar => {
            let signed = header & SCALAR_SIGNED != 0;
            let negative = header & SCALAR_NEGATIVE != 0;
            let magnitude = if header & SCALAR_ZERO != 0 {
                0
            } else {
                decode_uvarint(r)?
            };
            Ok(Value::Scalar {
                signed,
                negative,
                magnitude,
            })
        }
        TypeTag::Float => {
            let wide = header & FLOAT_WIDE != 0;
            if header & FLOAT_ZERO != 0 {
                return Ok(if wide {
                    Value::Float64(0.0)
                } else {
                    Value::Float32(0.0)
                });
            }
            if wide {
                let mut b = [0u8; 8];
                r.read_exact(&mut b)?;
                Ok(Value::Float64(f64::from_bits(u64::from_be_bytes(b))))
            } else {
                let mut b = [0u8; 4];
                r.read_exact(&mut b)?;
                Ok(Value::Float32(f32::from_bits(u32::from_be_bytes(b))))
            }
        }
        TypeTag::String => Ok(Value::String(decode_string_body(header, r)?)),
        TypeTag::Bytes => {
            if header & EMPTY != 0 {
                return Ok(Value::Bytes(Bytes::new()));
            }
            let len = decode_uvarint(r)? as usize;
            Ok(Value::Bytes(Bytes::from(read_vec(r, len)?)))
        }
        TypeTag::Array => {
            if header & EMPTY != 0 {
                return Ok(Value::Array(Vec::new()));
            }
            let len = decode_uvarint(r)? as usize;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(decode_any(r)?);
            }
            Ok(Value::Array(items))
        }
        TypeTag::Map => {
            if header & EMPTY != 0 {
                return Ok(Value::Map(Vec::new()));
            }
            // Byte length of the pair section; the decoder walks the pairs
            // directly so the length is only consumed, not enforced.
            let _byte_len = decode_uvarint(r)?;
            let len = decode_uvarint(r)? as usize;
            let mut keys = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                keys.push(decode_any(r)?);
            }
            let mut pairs = Vec::with_capacity(len.min(1024));
            for key in keys {
                pairs.push((key, decode_any(r)?));
            }
            Ok(Value::Map(pairs))
        }
        TypeTag::Struct => decode_struct(r),
    }
}

fn decode_struct(r: &mut dyn Read) -> Result<Value, DecodeError> {
    let id = decode_string(r)?;
    if !registry::contains(&id) {
        return Err(DecodeError::UnknownStructId(id));
    }

    let len = decode_uvarint(r)?;
    let mut section = r.take(len);
    let mut fields = Vec::new();
    while section.limit() > 0 {
        let tag = decode_uvarint(&mut section)?;
        let value = decode_any(&mut section)?;
        fields.push((tag, value));
    }

    Ok(Value::Struct(StructBody { id, fields }))
}

fn decode_string_body(header: u8, r: &mut dyn Read) -> Result<String, DecodeError> {
    if header & EMPTY != 0 {
        return Ok(String::new());
    }
    let len = decode_uvarint(r)? as usize;
    String::from_utf8(read_vec(r, len)?).map_err(|_| DecodeError::InvalidUtf8)
}

/// Decodes a value that must be a string.
pub fn decode_string(r: &mut dyn Read) -> Result<String, DecodeError> {
    let (tag, header) = read_type(r)?;
    if tag != TypeTag::String {
        return Err(DecodeError::TypeMismatch {
            expected: TypeTag::String,
            actual: tag,
        });
    }
    decode_string_body(header, r)
}

/// Decodes a value that must be a byte array.
pub fn decode_bytes(r: &mut dyn Read) -> Result<Bytes, DecodeError> {
    let (tag, header) = read_type(r)?;
    if tag != TypeTag::Bytes {
        return Err(DecodeError::TypeMismatch {
            expected: TypeTag::Bytes,
            actual: tag,
        });
    }
    if header & EMPTY != 0 {
        return Ok(Bytes::new());
    }
    let len = decode_uvarint(r)? as usize;
    Ok(Bytes::from(read_vec(r, len)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) -> Value {
        let encoded = encode_to_vec(&value);
        decode_value(&mut &encoded[..]).unwrap()
    }

    #[test]
    fn test_signed_scalar_range() {
        for i in -1024i64..=1024 {
            let encoded = encode_to_vec(&Value::from(i));
            let decoded = decode_value(&mut &encoded[..]).unwrap();
            match decoded {
                Value::Scalar {
                    signed,
                    negative,
                    magnitude,
                } => {
                    assert!(signed);
                    assert_eq!(negative, i < 0, "sign mismatch for {}", i);
                    assert_eq!(magnitude, i.unsigned_abs(), "magnitude mismatch for {}", i);
                }
                other => panic!("expected scalar, got {:?}", other),
            }
            assert_eq!(decoded, Value::from(i));
        }
    }

    #[test]
    fn test_unsigned_scalar_range() {
        for i in 0u64..=1024 {
            assert_eq!(roundtrip(Value::from(i)), Value::from(i));
        }
    }

    #[test]
    fn test_zero_scalar_is_single_byte() {
        assert_eq!(encode_to_vec(&Value::from(0u64)).len(), 1);
        assert_eq!(encode_to_vec(&Value::from(0i64)).len(), 1);
        assert_eq!(encode_to_vec(&Value::Float32(0.0)).len(), 1);
        assert_eq!(encode_to_vec(&Value::Float64(0.0)).len(), 1);
    }

    #[test]
    fn test_empty_string_single_byte() {
        let encoded = encode_to_vec(&Value::from(""));
        assert_eq!(encoded, vec![0x14]);

        let decoded = decode_value(&mut &[0x14u8][..]).unwrap();
        assert_eq!(decoded, Value::String(String::new()));
    }

    #[test]
    fn test_empty_containers_single_byte() {
        assert_eq!(encode_to_vec(&Value::Bytes(Bytes::new())).len(), 1);
        assert_eq!(encode_to_vec(&Value::Array(Vec::new())).len(), 1);
        assert_eq!(encode_to_vec(&Value::Map(Vec::new())).len(), 1);
    }

    #[test]
    fn test_string_roundtrip() {
        let v = Value::from("hello, arf");
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let v = Value::Bytes(Bytes::from_static(&[0x01, 0x02, 0xFF]));
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn test_bool_roundtrip() {
        assert_eq!(roundtrip(Value::Boolean(true)), Value::Boolean(true));
        assert_eq!(roundtrip(Value::Boolean(false)), Value::Boolean(false));
    }

    #[test]
    fn test_float_roundtrip() {
        assert_eq!(roundtrip(Value::Float32(1.5)), Value::Float32(1.5));
        assert_eq!(roundtrip(Value::Float64(-2.75)), Value::Float64(-2.75));
    }

    #[test]
    fn test_array_roundtrip() {
        let v = Value::Array(vec![Value::from(1u32), Value::from("two"), Value::Void]);
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn test_map_roundtrip() {
        let v = Value::Map(vec![
            (Value::from("a"), Value::from(1u32)),
            (Value::from("b"), Value::from(2u32)),
        ]);
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn test_nested_containers() {
        let v = Value::Array(vec![
            Value::Map(vec![(Value::from("k"), Value::Array(vec![Value::from(9u8)]))]),
            Value::Bytes(Bytes::from_static(b"xyz")),
        ]);
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn test_unknown_type_byte() {
        let result = decode_value(&mut &[0x0Fu8][..]);
        assert!(matches!(result, Err(DecodeError::UnknownType(0x0F))));
    }

    #[test]
    fn test_truncated_input() {
        let encoded = encode_to_vec(&Value::from("some string"));
        let result = decode_value(&mut &encoded[..encoded.len() - 2]);
        assert!(matches!(result, Err(DecodeError::UnexpectedEof)));
    }

    #[test]
    fn test_invalid_utf8() {
        // String of length 2 with invalid UTF-8 bytes.
        let bad = [TypeTag::String as u8, 0x02, 0xFF, 0xFE];
        let result = decode_value(&mut &bad[..]);
        assert!(matches!(result, Err(DecodeError::InvalidUtf8)));
    }

    #[test]
    fn test_unknown_struct_id() {
        let body = StructBody {
            id: "tests/never-registered".to_string(),
            fields: vec![],
        };
        let encoded = encode_to_vec(&Value::Struct(body));
        let result = decode_value(&mut &encoded[..]);
        assert!(matches!(result, Err(DecodeError::UnknownStructId(_))));
    }

    #[test]
    fn test_uvarint_roundtrip() {
        for x in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            encode_uvarint(&mut buf, x);
            let decoded = decode_uvarint(&mut &buf[..]).unwrap();
            assert_eq!(decoded, x);
        }
    }
}
