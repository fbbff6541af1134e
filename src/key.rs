//! Internal-key and lookup-key codec.
//!
//! An internal key wraps a user key with the write's sequence number and a
//! type byte distinguishing values from deletion tombstones. The user value
//! is embedded in the encoding: data blocks store internal keys as block
//! keys with empty block values.
//!
//! # Binary layout (little-endian)
//!
//! ```text
//! +--------------+----------+----------------+------------+---------+---------+
//! | userKeyLen   | userKey  | userValueLen   | userValue  | seq     | type    |
//! | u32          | var      | u32            | var        | u64     | u8      |
//! +--------------+----------+----------------+------------+---------+---------+
//! ```
//!
//! # Ordering
//!
//! Internal keys are totally ordered by user key ascending, then sequence
//! number descending. The freshest entry for a user key therefore sorts
//! first, so a point lookup seeks to `LookupKey(key, seq)` and lands on the
//! entry with the largest sequence number <= seq. Type and value never
//! participate in the comparison.

use std::cmp::Ordering;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// A comparator capability over encoded keys.
pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

/// Distinguishes live values from deletion tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Deletion = 0,
    Value = 1,
}

impl KeyType {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(KeyType::Deletion),
            1 => Ok(KeyType::Value),
            other => Err(Error::Corruption(format!("invalid key type: {other}"))),
        }
    }
}

/// The unit of storage: a user key/value pair stamped with a sequence
/// number and a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub user_value: Vec<u8>,
    pub seq: u64,
    pub kind: KeyType,
}

impl InternalKey {
    pub fn new(user_key: &[u8], user_value: &[u8], seq: u64, kind: KeyType) -> Self {
        Self {
            user_key: user_key.to_vec(),
            user_value: user_value.to_vec(),
            seq,
            kind,
        }
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> u64 {
        (4 + self.user_key.len() + 4 + self.user_value.len() + 8 + 1) as u64
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        // Writes to a Vec cannot fail.
        self.encode_to(&mut buf).unwrap();
        buf
    }

    pub fn encode_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.user_key.len() as u32)?;
        w.write_all(&self.user_key)?;
        w.write_u32::<LittleEndian>(self.user_value.len() as u32)?;
        w.write_all(&self.user_value)?;
        w.write_u64::<LittleEndian>(self.seq)?;
        w.write_u8(self.kind as u8)?;
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = data;
        Self::decode_from(&mut r)
    }

    pub fn decode_from(r: &mut impl Read) -> Result<Self> {
        let key_len = r.read_u32::<LittleEndian>()? as usize;
        let mut user_key = vec![0u8; key_len];
        r.read_exact(&mut user_key)?;

        let value_len = r.read_u32::<LittleEndian>()? as usize;
        let mut user_value = vec![0u8; value_len];
        r.read_exact(&mut user_value)?;

        let seq = r.read_u64::<LittleEndian>()?;
        let kind = KeyType::from_u8(r.read_u8()?)?;

        Ok(Self {
            user_key,
            user_value,
            seq,
            kind,
        })
    }
}

/// A synthetic internal key used as a seek target for `(user_key, seq)`.
/// Carries no payload; the comparator only examines user key and seq.
pub fn lookup_key(user_key: &[u8], seq: u64) -> InternalKey {
    InternalKey::new(user_key, &[], seq, KeyType::Deletion)
}

/// Borrow the user key out of an encoded internal key.
pub fn decode_user_key(encoded: &[u8]) -> &[u8] {
    let key_len = u32::from_le_bytes(encoded[..4].try_into().unwrap()) as usize;
    &encoded[4..4 + key_len]
}

/// Extract the sequence number from an encoded internal key.
pub fn decode_seq(encoded: &[u8]) -> u64 {
    u64::from_le_bytes(encoded[encoded.len() - 9..encoded.len() - 1].try_into().unwrap())
}

/// Total order over encoded internal keys: user key ascending, seq
/// descending.
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    decode_user_key(a)
        .cmp(decode_user_key(b))
        .then_with(|| decode_seq(b).cmp(&decode_seq(a)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let cases = [
            InternalKey::new(b"key", b"value", 1, KeyType::Value),
            InternalKey::new(b"key", &[], 2, KeyType::Deletion),
            InternalKey::new(&[], &[], 0, KeyType::Value),
            InternalKey::new(&[0xff; 100], &[0x00; 1000], u64::MAX, KeyType::Value),
        ];
        for ik in cases {
            let encoded = ik.encode();
            assert_eq!(encoded.len() as u64, ik.size());
            assert_eq!(InternalKey::decode(&encoded).expect("decode"), ik);
        }
    }

    #[test]
    fn test_decode_rejects_bad_type() {
        let mut encoded = InternalKey::new(b"k", b"v", 1, KeyType::Value).encode();
        let end = encoded.len() - 1;
        encoded[end] = 9;
        assert!(matches!(
            InternalKey::decode(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_ordering_user_key_ascending() {
        let a = InternalKey::new(b"aaa", b"", 5, KeyType::Value).encode();
        let b = InternalKey::new(b"bbb", b"", 1, KeyType::Value).encode();
        assert_eq!(compare(&a, &b), Ordering::Less);
        assert_eq!(compare(&b, &a), Ordering::Greater);
    }

    #[test]
    fn test_ordering_seq_descending_on_equal_user_key() {
        let newer = InternalKey::new(b"k", b"v2", 9, KeyType::Value).encode();
        let older = InternalKey::new(b"k", b"v1", 3, KeyType::Value).encode();
        assert_eq!(compare(&newer, &older), Ordering::Less);
        assert_eq!(compare(&older, &newer), Ordering::Greater);
    }

    #[test]
    fn test_type_and_value_do_not_affect_ordering() {
        let a = InternalKey::new(b"k", b"some value", 7, KeyType::Value).encode();
        let b = lookup_key(b"k", 7).encode();
        assert_eq!(compare(&a, &b), Ordering::Equal);
    }

    #[test]
    fn test_lookup_key_finds_largest_seq_at_most_ceiling() {
        // Entries for "k" sorted by the comparator: seq 9, 5, 2.
        let e9 = InternalKey::new(b"k", b"v9", 9, KeyType::Value).encode();
        let e5 = InternalKey::new(b"k", b"v5", 5, KeyType::Value).encode();
        let e2 = InternalKey::new(b"k", b"v2", 2, KeyType::Value).encode();
        let target = lookup_key(b"k", 7).encode();

        // The first entry >= target is e5: the largest seq <= 7.
        assert_eq!(compare(&e9, &target), Ordering::Less);
        assert_eq!(compare(&e5, &target), Ordering::Greater);
        assert_eq!(compare(&e2, &target), Ordering::Greater);
        assert_eq!(compare(&e5, &e2), Ordering::Less);
    }
}
