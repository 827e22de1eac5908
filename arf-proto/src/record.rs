//! Typed record binding over the generic value tree.
//!
//! Records declare a stable string id and tagged fields through the
//! [`arf_struct!`] macro. Decoding is tolerant of schema skew: unknown tags
//! are skipped, absent tags keep the field's default value, and a decoded
//! value whose shape cannot be converted to the declared field type is
//! silently dropped rather than failing the whole record.

use crate::error::DecodeError;
use crate::value::{decode_value, encode_to_vec, StructBody, Value};
use bytes::Bytes;
use std::collections::HashMap;
use std::hash::Hash;
use std::io::Read;

/// Conversion from a field's concrete type into a generic [`Value`].
pub trait ToValue {
    fn to_value(&self) -> Value;
}

/// Conversion from a decoded [`Value`] into a declared field type.
///
/// Returns `None` when the value's shape does not fit the target type;
/// callers treat that as "skip this field".
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

/// A record with a registry id and tagged fields.
pub trait ArfStruct: Default + Send + Sync + 'static {
    const STRUCT_ID: &'static str;

    /// The encoded form of this record: id plus `(tag, value)` fields.
    fn to_body(&self) -> StructBody;

    /// Applies one decoded field, skipping it when unconvertible.
    fn merge_field(&mut self, tag: u64, value: &Value);

    fn from_body(body: &StructBody) -> Self {
        let mut record = Self::default();
        for (tag, value) in &body.fields {
            record.merge_field(*tag, value);
        }
        record
    }
}

/// Encodes a record as a struct value.
pub fn encode_record<T: ArfStruct>(record: &T) -> Vec<u8> {
    encode_to_vec(&Value::Struct(record.to_body()))
}

/// Decodes a record of a known type, failing on an id mismatch.
pub fn decode_record<T: ArfStruct>(r: &mut dyn Read) -> Result<T, DecodeError> {
    match decode_value(r)? {
        Value::Struct(body) => {
            if body.id != T::STRUCT_ID {
                return Err(DecodeError::StructIdMismatch {
                    expected: T::STRUCT_ID.to_string(),
                    actual: body.id,
                });
            }
            Ok(T::from_body(&body))
        }
        other => Err(DecodeError::TypeMismatch {
            expected: crate::value::TypeTag::Struct,
            actual: other.kind(),
        }),
    }
}

macro_rules! to_value_via_from {
    ($($t:ty),*) => {$(
        impl ToValue for $t {
            fn to_value(&self) -> Value {
                Value::from(*self)
            }
        }
    )*};
}

to_value_via_from!(u8, u16, u32, u64, i8, i16, i32, i64, bool, f32, f64);

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }
}

impl ToValue for Bytes {
    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Void,
        }
    }
}

impl<T: ToValue> ToValue for Vec<T> {
    fn to_value(&self) -> Value {
        Value::Array(self.iter().map(ToValue::to_value).collect())
    }
}

impl<K: ToValue, V: ToValue> ToValue for HashMap<K, V> {
    fn to_value(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (k.to_value(), v.to_value()))
                .collect(),
        )
    }
}

fn scalar_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Scalar {
            negative: false,
            magnitude,
            ..
        } => Some(*magnitude),
        Value::Float32(f) => float_as_u64(*f as f64),
        Value::Float64(f) => float_as_u64(*f),
        _ => None,
    }
}

fn scalar_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Scalar {
            negative,
            magnitude,
            ..
        } => {
            let m = *magnitude as i128;
            let v = if *negative { -m } else { m };
            i64::try_from(v).ok()
        }
        Value::Float32(f) => float_as_i64(*f as f64),
        Value::Float64(f) => float_as_i64(*f),
        _ => None,
    }
}

fn float_as_u64(f: f64) -> Option<u64> {
    if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 {
        Some(f as u64)
    } else {
        None
    }
}

fn float_as_i64(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

macro_rules! from_value_unsigned {
    ($($t:ty),*) => {$(
        impl FromValue for $t {
            fn from_value(value: &Value) -> Option<Self> {
                scalar_as_u64(value).and_then(|v| <$t>::try_from(v).ok())
            }
        }
    )*};
}

macro_rules! from_value_signed {
    ($($t:ty),*) => {$(
        impl FromValue for $t {
            fn from_value(value: &Value) -> Option<Self> {
                scalar_as_i64(value).and_then(|v| <$t>::try_from(v).ok())
            }
        }
    )*};
}

from_value_unsigned!(u8, u16, u32, u64);
from_value_signed!(i8, i16, i32, i64);

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float64(f) => Some(*f),
            Value::Float32(f) => Some(*f as f64),
            Value::Scalar {
                negative,
                magnitude,
                ..
            } => {
                let f = *magnitude as f64;
                Some(if *negative { -f } else { f })
            }
            _ => None,
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float32(f) => Some(*f),
            // Accept the wide form only when the conversion is exact.
            Value::Float64(f) => {
                let narrow = *f as f32;
                (narrow as f64 == *f).then_some(narrow)
            }
            Value::Scalar { .. } => f64::from_value(value).map(|f| f as f32),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromValue for Bytes {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Void => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => items.iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}

impl<K: FromValue + Eq + Hash, V: FromValue> FromValue for HashMap<K, V> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Map(pairs) => pairs
                .iter()
                .map(|(k, v)| Some((K::from_value(k)?, V::from_value(v)?)))
                .collect(),
            _ => None,
        }
    }
}

/// Declares a tagged record type.
///
/// ```
/// use arf_proto::arf_struct;
///
/// arf_struct! {
///     pub struct Greeting: "demo/greeting" {
///         1 => text: String,
///         2 => repeat: u32,
///     }
/// }
/// ```
#[macro_export]
macro_rules! arf_struct {
    ($(#[$meta:meta])* $vis:vis struct $name:ident : $id:literal {
        $($tag:literal => $field:ident : $ftype:ty),* $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $(pub $field: $ftype,)*
        }

        impl $crate::ArfStruct for $name {
            const STRUCT_ID: &'static str = $id;

            fn to_body(&self) -> $crate::StructBody {
                $crate::StructBody {
                    id: Self::STRUCT_ID.to_string(),
                    fields: vec![$(($tag, $crate::ToValue::to_value(&self.$field)),)*],
                }
            }

            fn merge_field(&mut self, tag: u64, value: &$crate::Value) {
                match tag {
                    $($tag => {
                        if let Some(v) = $crate::FromValue::from_value(value) {
                            self.$field = v;
                        }
                    })*
                    _ => {}
                }
            }
        }

        impl $crate::ToValue for $name {
            fn to_value(&self) -> $crate::Value {
                $crate::Value::Struct($crate::ArfStruct::to_body(self))
            }
        }

        impl $crate::FromValue for $name {
            fn from_value(value: &$crate::Value) -> Option<Self> {
                match value {
                    $crate::Value::Struct(body)
                        if body.id == <Self as $crate::ArfStruct>::STRUCT_ID =>
                    {
                        Some(<Self as $crate::ArfStruct>::from_body(body))
                    }
                    _ => None,
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    arf_struct! {
        struct Inner: "tests/record/inner" {
            1 => label: String,
            2 => weight: u32,
        }
    }

    arf_struct! {
        struct Everything: "tests/record/everything" {
            1 => u8_field: u8,
            2 => u16_field: u16,
            3 => u32_field: u32,
            4 => u64_field: u64,
            5 => i8_field: i8,
            6 => i16_field: i16,
            7 => i32_field: i32,
            8 => i64_field: i64,
            9 => f32_field: f32,
            10 => f64_field: f64,
            11 => bool_field: bool,
            12 => string_field: String,
            13 => bytes_field: Bytes,
            14 => optional: Option<String>,
            15 => nested: Inner,
            16 => strings: Vec<String>,
            17 => string_map: HashMap<String, String>,
            18 => inners: Vec<Inner>,
            19 => inner_map: HashMap<String, Inner>,
        }
    }

    fn sample() -> Everything {
        Everything {
            u8_field: 8,
            u16_field: 1600,
            u32_field: 320_000,
            u64_field: u64::MAX,
            i8_field: -8,
            i16_field: -1600,
            i32_field: -320_000,
            i64_field: i64::MIN,
            f32_field: 1.25,
            f64_field: -9.5,
            bool_field: true,
            string_field: "hello".to_string(),
            bytes_field: Bytes::from_static(&[1, 2, 3]),
            optional: None,
            nested: Inner {
                label: "inner".to_string(),
                weight: 7,
            },
            strings: vec!["a".to_string(), "b".to_string()],
            string_map: HashMap::from([("k".to_string(), "v".to_string())]),
            inners: vec![Inner {
                label: "first".to_string(),
                weight: 1,
            }],
            inner_map: HashMap::from([(
                "one".to_string(),
                Inner {
                    label: "mapped".to_string(),
                    weight: 2,
                },
            )]),
        }
    }

    #[test]
    fn test_full_record_roundtrip() {
        registry::register::<Inner>();
        registry::register::<Everything>();

        let original = sample();
        let encoded = encode_record(&original);
        let decoded: Everything = decode_record(&mut &encoded[..]).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_optional_some_roundtrip() {
        registry::register::<Inner>();
        registry::register::<Everything>();

        let mut original = sample();
        original.optional = Some("present".to_string());
        let encoded = encode_record(&original);
        let decoded: Everything = decode_record(&mut &encoded[..]).unwrap();
        assert_eq!(decoded.optional.as_deref(), Some("present"));
    }

    #[test]
    fn test_unknown_tag_skipped() {
        registry::register::<Inner>();

        let mut inner = Inner::default();
        inner.merge_field(99, &Value::from("ignored"));
        assert_eq!(inner, Inner::default());
    }

    #[test]
    fn test_unconvertible_field_skipped() {
        let mut inner = Inner {
            label: "keep".to_string(),
            weight: 3,
        };
        // A string cannot bind to the u32 field; the decode keeps going.
        inner.merge_field(2, &Value::from("not a number"));
        assert_eq!(inner.weight, 3);
    }

    #[test]
    fn test_absent_tags_keep_defaults() {
        let body = StructBody {
            id: Inner::STRUCT_ID.to_string(),
            fields: vec![(1, Value::from("only label"))],
        };
        let inner = Inner::from_body(&body);
        assert_eq!(inner.label, "only label");
        assert_eq!(inner.weight, 0);
    }

    #[test]
    fn test_struct_id_mismatch() {
        registry::register::<Inner>();
        let encoded = encode_record(&Inner::default());
        let result: Result<Everything, _> = decode_record(&mut &encoded[..]);
        assert!(matches!(result, Err(DecodeError::StructIdMismatch { .. })));
    }

    #[test]
    fn test_numeric_widening_and_narrowing() {
        assert_eq!(u64::from_value(&Value::from(42u8)), Some(42));
        assert_eq!(u8::from_value(&Value::from(300u32)), None);
        assert_eq!(i64::from_value(&Value::from(-1i8)), Some(-1));
        assert_eq!(i8::from_value(&Value::from(-129i32)), None);
        assert_eq!(u32::from_value(&Value::from(-1i32)), None);
    }

    #[test]
    fn test_float_conversions() {
        assert_eq!(f64::from_value(&Value::Float32(1.5)), Some(1.5));
        assert_eq!(f32::from_value(&Value::Float64(1.5)), Some(1.5));
        // 0.1 is not representable in f32 without loss.
        assert_eq!(f32::from_value(&Value::Float64(0.1)), None);
        assert_eq!(f64::from_value(&Value::from(-3i32)), Some(-3.0));
        assert_eq!(u32::from_value(&Value::Float64(4.0)), Some(4));
        assert_eq!(u32::from_value(&Value::Float64(4.5)), None);
    }
}
