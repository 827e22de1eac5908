//! # arf-proto
//!
//! Self-describing binary value codec for arf.
//!
//! This crate provides:
//! - Tag-based encoding of primitives, strings, bytes, arrays, maps and
//!   tagged structs into a generic [`Value`] tree
//! - Conversion traits ([`ToValue`]/[`FromValue`]) implementing the
//!   widening/narrowing rules used when binding decoded values to records
//! - A process-wide struct registry keyed by string struct ids
//! - The [`arf_struct!`] macro declaring tagged record types

pub mod error;
pub mod record;
pub mod registry;
pub mod value;

pub use error::DecodeError;
pub use record::{decode_record, encode_record, ArfStruct, FromValue, ToValue};
pub use registry::StructDescriptor;
pub use value::{
    decode_bytes, decode_string, decode_value, encode_bytes, encode_string, encode_to_vec,
    encode_value, StructBody, TypeTag, Value,
};
