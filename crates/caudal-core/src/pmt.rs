//! Property values for block parameters and stream tags.
//!
//! [`Pmt`] is a tagged union over the value types a block parameter may
//! take: arithmetic scalars, strings, vectors (recursively of any supported
//! type), and nested maps. A [`PropertyMap`] is an ordered string → value
//! map — ordered so that serialisation, hashing and diffing are
//! deterministic.
//!
//! Values carry a canonical wire form — a one-byte discriminator followed by
//! a little-endian payload — used both for serialisation and for the
//! settings-context hash (base-64 of the canonical bytes, folded with the
//! golden-ratio mixer).

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ordered mapping from parameter key to value.
pub type PropertyMap = BTreeMap<String, Pmt>;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pmt {
    Null,
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Vec(Vec<Pmt>),
    Map(PropertyMap),
}

impl Default for Pmt {
    fn default() -> Self {
        Self::Null
    }
}

/// Discriminator of a [`Pmt`] variant, used for type checking and the wire
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PmtKind {
    Null,
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Str,
    Vec,
    Map,
}

impl std::fmt::Display for PmtKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PmtKind::Null => "null",
            PmtKind::Bool => "bool",
            PmtKind::U8 => "u8",
            PmtKind::U16 => "u16",
            PmtKind::U32 => "u32",
            PmtKind::U64 => "u64",
            PmtKind::I8 => "i8",
            PmtKind::I16 => "i16",
            PmtKind::I32 => "i32",
            PmtKind::I64 => "i64",
            PmtKind::F32 => "f32",
            PmtKind::F64 => "f64",
            PmtKind::Str => "string",
            PmtKind::Vec => "vector",
            PmtKind::Map => "map",
        };
        f.write_str(name)
    }
}

/// Malformed canonical encoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PmtError {
    #[error("unknown discriminator {0:#04x}")]
    UnknownDiscriminator(u8),
    #[error("payload truncated while decoding {0}")]
    Truncated(PmtKind),
    #[error("invalid utf-8 in string payload")]
    InvalidUtf8,
}

impl Pmt {
    /// The variant's discriminator.
    pub fn kind(&self) -> PmtKind {
        match self {
            Pmt::Null => PmtKind::Null,
            Pmt::Bool(_) => PmtKind::Bool,
            Pmt::U8(_) => PmtKind::U8,
            Pmt::U16(_) => PmtKind::U16,
            Pmt::U32(_) => PmtKind::U32,
            Pmt::U64(_) => PmtKind::U64,
            Pmt::I8(_) => PmtKind::I8,
            Pmt::I16(_) => PmtKind::I16,
            Pmt::I32(_) => PmtKind::I32,
            Pmt::I64(_) => PmtKind::I64,
            Pmt::F32(_) => PmtKind::F32,
            Pmt::F64(_) => PmtKind::F64,
            Pmt::Str(_) => PmtKind::Str,
            Pmt::Vec(_) => PmtKind::Vec,
            Pmt::Map(_) => PmtKind::Map,
        }
    }

    fn discriminator(&self) -> u8 {
        self.kind() as u8
    }

    /// Appends the canonical `(discriminator, payload)` form to `out`.
    /// Scalars are little-endian; strings, vectors and maps carry a `u64`
    /// length prefix; nested maps recurse with the same layout.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.discriminator());
        match self {
            Pmt::Null => {}
            Pmt::Bool(v) => out.push(*v as u8),
            Pmt::U8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Pmt::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Pmt::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Pmt::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Pmt::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Pmt::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Pmt::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Pmt::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Pmt::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Pmt::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Pmt::Str(v) => {
                out.extend_from_slice(&(v.len() as u64).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            Pmt::Vec(items) => {
                out.extend_from_slice(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.encode(out);
                }
            }
            Pmt::Map(map) => {
                out.extend_from_slice(&(map.len() as u64).to_le_bytes());
                for (key, value) in map {
                    out.extend_from_slice(&(key.len() as u64).to_le_bytes());
                    out.extend_from_slice(key.as_bytes());
                    value.encode(out);
                }
            }
        }
    }

    /// The canonical form as one freshly allocated byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Base-64 of the canonical form; input to the settings-context hash.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// Decodes one value from the front of `input`, advancing it.
    pub fn decode(input: &mut &[u8]) -> Result<Pmt, PmtError> {
        let disc = take::<1>(input, PmtKind::Null)?[0];
        let kind = match disc {
            x if x == PmtKind::Null as u8 => PmtKind::Null,
            x if x == PmtKind::Bool as u8 => PmtKind::Bool,
            x if x == PmtKind::U8 as u8 => PmtKind::U8,
            x if x == PmtKind::U16 as u8 => PmtKind::U16,
            x if x == PmtKind::U32 as u8 => PmtKind::U32,
            x if x == PmtKind::U64 as u8 => PmtKind::U64,
            x if x == PmtKind::I8 as u8 => PmtKind::I8,
            x if x == PmtKind::I16 as u8 => PmtKind::I16,
            x if x == PmtKind::I32 as u8 => PmtKind::I32,
            x if x == PmtKind::I64 as u8 => PmtKind::I64,
            x if x == PmtKind::F32 as u8 => PmtKind::F32,
            x if x == PmtKind::F64 as u8 => PmtKind::F64,
            x if x == PmtKind::Str as u8 => PmtKind::Str,
            x if x == PmtKind::Vec as u8 => PmtKind::Vec,
            x if x == PmtKind::Map as u8 => PmtKind::Map,
            other => return Err(PmtError::UnknownDiscriminator(other)),
        };
        Ok(match kind {
            PmtKind::Null => Pmt::Null,
            PmtKind::Bool => Pmt::Bool(take::<1>(input, kind)?[0] != 0),
            PmtKind::U8 => Pmt::U8(u8::from_le_bytes(take(input, kind)?)),
            PmtKind::U16 => Pmt::U16(u16::from_le_bytes(take(input, kind)?)),
            PmtKind::U32 => Pmt::U32(u32::from_le_bytes(take(input, kind)?)),
            PmtKind::U64 => Pmt::U64(u64::from_le_bytes(take(input, kind)?)),
            PmtKind::I8 => Pmt::I8(i8::from_le_bytes(take(input, kind)?)),
            PmtKind::I16 => Pmt::I16(i16::from_le_bytes(take(input, kind)?)),
            PmtKind::I32 => Pmt::I32(i32::from_le_bytes(take(input, kind)?)),
            PmtKind::I64 => Pmt::I64(i64::from_le_bytes(take(input, kind)?)),
            PmtKind::F32 => Pmt::F32(f32::from_le_bytes(take(input, kind)?)),
            PmtKind::F64 => Pmt::F64(f64::from_le_bytes(take(input, kind)?)),
            PmtKind::Str => {
                let len = u64::from_le_bytes(take(input, kind)?) as usize;
                let bytes = take_slice(input, len, kind)?;
                Pmt::Str(String::from_utf8(bytes.to_vec()).map_err(|_| PmtError::InvalidUtf8)?)
            }
            PmtKind::Vec => {
                let len = u64::from_le_bytes(take(input, kind)?) as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(Pmt::decode(input)?);
                }
                Pmt::Vec(items)
            }
            PmtKind::Map => {
                let len = u64::from_le_bytes(take(input, kind)?) as usize;
                let mut map = PropertyMap::new();
                for _ in 0..len {
                    let key_len = u64::from_le_bytes(take(input, kind)?) as usize;
                    let key_bytes = take_slice(input, key_len, kind)?;
                    let key = String::from_utf8(key_bytes.to_vec())
                        .map_err(|_| PmtError::InvalidUtf8)?;
                    map.insert(key, Pmt::decode(input)?);
                }
                Pmt::Map(map)
            }
        })
    }
}

fn take<'a, const N: usize>(input: &mut &'a [u8], kind: PmtKind) -> Result<[u8; N], PmtError> {
    let bytes = take_slice(input, N, kind)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn take_slice<'a>(input: &mut &'a [u8], n: usize, kind: PmtKind) -> Result<&'a [u8], PmtError> {
    if input.len() < n {
        return Err(PmtError::Truncated(kind));
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

/// Golden-ratio hash fold: mixes `value` into `seed`.
pub fn hash_combine(seed: &mut u64, value: u64) {
    *seed ^= value
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

/// Hashes a string through the golden-ratio fold.
pub(crate) fn hash_str(seed: &mut u64, s: &str) {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hash_combine(seed, hasher.finish());
}

macro_rules! pmt_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Pmt {
            fn from(value: $ty) -> Self {
                Pmt::$variant(value)
            }
        })*
    };
}

pmt_from! {
    bool => Bool,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    String => Str,
    Vec<Pmt> => Vec,
    PropertyMap => Map,
}

impl From<&str> for Pmt {
    fn from(value: &str) -> Self {
        Pmt::Str(value.to_owned())
    }
}

/// Convenience constructor for a [`PropertyMap`].
///
/// ```rust
/// use caudal_core::pmt::{property_map, Pmt};
///
/// let map = property_map([("sample_rate", Pmt::F32(48000.0))]);
/// assert_eq!(map.get("sample_rate"), Some(&Pmt::F32(48000.0)));
/// ```
pub fn property_map<K, V, I>(entries: I) -> PropertyMap
where
    K: Into<String>,
    V: Into<Pmt>,
    I: IntoIterator<Item = (K, V)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_discriminator() {
        assert_eq!(Pmt::Bool(true).kind(), PmtKind::Bool);
        assert_eq!(Pmt::F32(1.0).kind(), PmtKind::F32);
        assert_eq!(Pmt::Null.discriminator(), 0);
        assert_ne!(Pmt::U8(0).discriminator(), Pmt::I8(0).discriminator());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let value = Pmt::Map(property_map([
            ("rate", Pmt::F32(48000.0)),
            ("name", Pmt::from("channel-a")),
            ("counts", Pmt::Vec(vec![Pmt::U32(1), Pmt::U32(2)])),
            (
                "nested",
                Pmt::Map(property_map([("flag", Pmt::Bool(true))])),
            ),
        ]));

        let bytes = value.to_bytes();
        let mut input = bytes.as_slice();
        let decoded = Pmt::decode(&mut input).unwrap();
        assert_eq!(decoded, value);
        assert!(input.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut input: &[u8] = &[0xff];
        assert_eq!(
            Pmt::decode(&mut input),
            Err(PmtError::UnknownDiscriminator(0xff))
        );

        let mut truncated: &[u8] = &[PmtKind::U32 as u8, 0x01];
        assert!(matches!(
            Pmt::decode(&mut truncated),
            Err(PmtError::Truncated(_))
        ));
    }

    #[test]
    fn test_base64_is_stable() {
        let a = Pmt::Str("abc".into()).to_base64();
        let b = Pmt::Str("abc".into()).to_base64();
        assert_eq!(a, b);
        assert_ne!(a, Pmt::Str("abd".into()).to_base64());
    }

    #[test]
    fn test_hash_combine_order_sensitive() {
        let mut a = 0u64;
        hash_combine(&mut a, 1);
        hash_combine(&mut a, 2);

        let mut b = 0u64;
        hash_combine(&mut b, 2);
        hash_combine(&mut b, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_impls() {
        assert_eq!(Pmt::from(48000.0f32), Pmt::F32(48000.0));
        assert_eq!(Pmt::from("x"), Pmt::Str("x".into()));
        assert_eq!(Pmt::from(7u64), Pmt::U64(7));
    }

    #[test]
    fn test_property_map_is_ordered() {
        let map = property_map([("b", 1i32), ("a", 2i32), ("c", 3i32)]);
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
