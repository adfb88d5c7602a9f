//! Log keys and their derived discovery identities.
//!
//! A [`Key`] is the 32-byte public key of an append-only log. Everywhere a
//! key crosses a boundary (store rows, set membership, the wire) it is
//! normalized to lowercase hex, but callers may hand it over either as raw
//! bytes or as hex in any case via [`IntoKey`].

use crate::error::{ErrorKind, Result};
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use exn::ResultExt;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length in bytes of a log key (and of a discovery key).
pub const KEY_LENGTH: usize = 32;

/// Context string mixed into discovery key derivation. Peers that announce
/// under a discovery key never reveal the log key itself.
const DISCOVERY_CONTEXT: &[u8] = b"hypercore";

/// Public key of a replicated log.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LENGTH]);

impl Key {
    pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Lowercase hex form, as used for store keys.
    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    /// Parse a hex key. Upper and lower case are both accepted.
    pub fn from_hex(hex: impl AsRef<str>) -> Result<Self> {
        let hex = hex.as_ref();
        let bytes = HEXLOWER_PERMISSIVE
            .decode(hex.as_bytes())
            .or_raise(|| ErrorKind::InvalidKey(hex.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LENGTH] =
            <[u8; KEY_LENGTH]>::try_from(bytes).or_raise(|| ErrorKind::InvalidKey(format!("expected {KEY_LENGTH} bytes, got {}", bytes.len())))?;
        Ok(Self(bytes))
    }

    /// The identifier this log is announced under for peer discovery.
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey(*blake3::keyed_hash(&self.0, DISCOVERY_CONTEXT).as_bytes())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

impl FromStr for Key {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<[u8; KEY_LENGTH]> for Key {
    fn from(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(KeyVisitor)
    }
}

/// Accepts either a hex string or a sequence of 32 byte values.
struct KeyVisitor;

impl<'de> Visitor<'de> for KeyVisitor {
    type Value = Key;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a hex string or {KEY_LENGTH} raw bytes")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Key, E> {
        Key::from_hex(v).map_err(|e| E::custom(&*e))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Key, E> {
        Key::from_slice(v).map_err(|e| E::custom(&*e))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Key, A::Error> {
        let mut bytes = Vec::with_capacity(KEY_LENGTH);
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Key::from_slice(&bytes).map_err(|e| de::Error::custom(&*e))
    }
}

/// Anything a caller may address a resource with.
///
/// Implemented for [`Key`] itself, hex strings and raw byte slices so that
/// every public entry point accepts both representations.
pub trait IntoKey {
    fn into_key(self) -> Result<Key>;
}

impl IntoKey for Key {
    fn into_key(self) -> Result<Key> {
        Ok(self)
    }
}

impl IntoKey for &Key {
    fn into_key(self) -> Result<Key> {
        Ok(*self)
    }
}

impl IntoKey for [u8; KEY_LENGTH] {
    fn into_key(self) -> Result<Key> {
        Ok(Key(self))
    }
}

impl IntoKey for &[u8] {
    fn into_key(self) -> Result<Key> {
        Key::from_slice(self)
    }
}

impl IntoKey for Vec<u8> {
    fn into_key(self) -> Result<Key> {
        Key::from_slice(&self)
    }
}

impl IntoKey for &str {
    fn into_key(self) -> Result<Key> {
        Key::from_hex(self)
    }
}

impl IntoKey for String {
    fn into_key(self) -> Result<Key> {
        Key::from_hex(self)
    }
}

impl IntoKey for &String {
    fn into_key(self) -> Result<Key> {
        Key::from_hex(self)
    }
}

/// Derived identifier a log is announced under on the network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiscoveryKey([u8; KEY_LENGTH]);

impl DiscoveryKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({self})")
    }
}

impl Serialize for DiscoveryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const HEX: &str = "6f1b17063da8508541eb76dac260748a2d815c2c88b27cefb6205c90ae16fef5";

    #[test]
    fn test_hex_is_normalized_to_lowercase() {
        let key = Key::from_hex(HEX.to_uppercase()).unwrap();
        assert_eq!(key.to_hex(), HEX);
        assert_eq!(key.to_string(), HEX);
    }

    #[rstest]
    #[case("")]
    #[case("zz")]
    #[case("6f1b17063da8508541eb76dac260748a")]
    #[case("6f1b17063da8508541eb76dac260748a2d815c2c88b27cefb6205c90ae16fef5ff")]
    fn test_invalid_hex(#[case] input: &str) {
        let err = Key::from_hex(input).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey(_)));
    }

    #[test]
    fn test_into_key_accepts_bytes_and_hex() {
        let from_hex = HEX.into_key().unwrap();
        let from_bytes = from_hex.as_bytes().as_slice().into_key().unwrap();
        let from_vec = from_hex.as_bytes().to_vec().into_key().unwrap();
        assert_eq!(from_hex, from_bytes);
        assert_eq!(from_hex, from_vec);
        assert!(vec![0u8; 31].into_key().is_err());
    }

    #[test]
    fn test_discovery_key_is_stable_and_distinct() {
        let key = Key::from_hex(HEX).unwrap();
        assert_eq!(key.discovery_key(), key.discovery_key());
        assert_ne!(key.discovery_key().as_bytes(), key.as_bytes());
        let other = Key::from_bytes([7; KEY_LENGTH]);
        assert_ne!(key.discovery_key(), other.discovery_key());
    }

    #[test]
    fn test_deserialize_hex_or_byte_array() {
        let key = Key::from_hex(HEX).unwrap();
        let hex: Key = serde_json::from_str(&format!("\"{}\"", HEX.to_uppercase())).unwrap();
        let bytes: Key = serde_json::from_value(serde_json::json!(key.as_bytes().to_vec())).unwrap();
        assert_eq!(hex, key);
        assert_eq!(bytes, key);
        assert_eq!(serde_json::to_string(&key).unwrap(), format!("\"{HEX}\""));
        assert!(serde_json::from_str::<Key>("[1, 2, 3]").is_err());
    }
}
