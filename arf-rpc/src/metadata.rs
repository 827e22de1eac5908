//! Ordered metadata multimap.
//!
//! Metadata preserves insertion order; lookups walk from the most recently
//! added pair so that `set` (delete-then-append) behaves as last-write-wins.
//!
//! Wire form: `u16` pair count, then all keys as encoded strings, then all
//! values as encoded byte arrays.

use crate::binary::read_u16;
use arf_proto::{decode_bytes, decode_string, encode_bytes, encode_string, DecodeError};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Read;

/// One metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPair {
    pub key: String,
    pub value: Bytes,
}

/// Ordered multimap of string keys to byte values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(Vec<MetadataPair>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds metadata from `(key, value)` string pairs.
    pub fn from_string_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut meta = Metadata::new();
        for (key, value) in pairs {
            meta.add_string(key, value);
        }
        meta
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetadataPair> {
        self.0.iter()
    }

    /// Appends a pair, keeping any existing pairs with the same key.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.0.push(MetadataPair {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn add_string(&mut self, key: impl Into<String>, value: &str) {
        self.add(key, Bytes::copy_from_slice(value.as_bytes()));
    }

    /// Replaces all pairs with this key by a single new pair.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        let key = key.into();
        self.0.retain(|pair| pair.key != key);
        self.add(key, value);
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: &str) {
        self.set(key, Bytes::copy_from_slice(value.as_bytes()));
    }

    /// Finds the most recently added value for a key.
    pub fn lookup(&self, key: &str) -> Option<&Bytes> {
        self.0.iter().rev().find(|pair| pair.key == key).map(|pair| &pair.value)
    }

    pub fn lookup_string(&self, key: &str) -> Option<String> {
        self.lookup(key)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    pub fn get(&self, key: &str) -> Bytes {
        self.lookup(key).cloned().unwrap_or_default()
    }

    pub fn get_string(&self, key: &str) -> String {
        self.lookup_string(key).unwrap_or_default()
    }

    /// Returns every value for a key, most recent first.
    pub fn get_all(&self, key: &str) -> Vec<Bytes> {
        self.0
            .iter()
            .rev()
            .filter(|pair| pair.key == key)
            .map(|pair| pair.value.clone())
            .collect()
    }

    pub fn get_all_string(&self, key: &str) -> Vec<String> {
        self.get_all(key)
            .iter()
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect()
    }

    /// Encodes the metadata block, appending it to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.0.len() as u16);
        for pair in &self.0 {
            encode_string(&pair.key, buf);
        }
        for pair in &self.0 {
            encode_bytes(&pair.value, buf);
        }
    }

    /// Decodes a metadata block.
    pub fn decode(r: &mut dyn Read) -> Result<Metadata, DecodeError> {
        let count = read_u16(r)? as usize;
        if count == 0 {
            return Ok(Metadata::new());
        }

        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(decode_string(r)?);
        }

        let mut pairs = Vec::with_capacity(count);
        for key in keys {
            pairs.push(MetadataPair {
                key,
                value: decode_bytes(r)?,
            });
        }

        Ok(Metadata(pairs))
    }
}

impl FromIterator<MetadataPair> for Metadata {
    fn from_iter<I: IntoIterator<Item = MetadataPair>>(iter: I) -> Self {
        Metadata(iter.into_iter().collect())
    }
}
