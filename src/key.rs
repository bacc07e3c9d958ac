use std::cmp::Ordering;
use std::fmt;

use bytes::{BufMut, Bytes};

/// Length of the fixed suffix appended to every user key: seq (u64) + record type (u8).
pub const KEY_SUFFIX_LEN: usize = std::mem::size_of::<u64>() + 1;

/// The kind of a record. `Value` sorts before `Deletion` so that seeking to
/// `(key, seq, Value)` lands on whichever record carries exactly `(key, seq)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordType {
    Value = 0,
    Deletion = 1,
}

impl RecordType {
    pub fn from_u8(b: u8) -> RecordType {
        if b == RecordType::Deletion as u8 {
            RecordType::Deletion
        } else {
            RecordType::Value
        }
    }
}

/// An internal key: the caller's key plus the sequence number assigned at
/// write time and the record type.
///
/// Ordering: user key ascending, then seq DESCENDING, then record type.
/// Newer versions of a key sort first, so a lower-bound seek to
/// `(key, snapshot_seq, Value)` finds the newest visible version.
#[derive(Clone)]
pub struct Key<T: AsRef<[u8]>> {
    user_key: T,
    seq: u64,
    record_type: RecordType,
}

// aliases for the borrowing, owning and shared forms.
pub type KeySlice<'a> = Key<&'a [u8]>;
pub type KeyVec = Key<Vec<u8>>;
pub type KeyBytes = Key<Bytes>;

impl<'a> Copy for KeySlice<'a> {}

impl<T: AsRef<[u8]>> Key<T> {
    pub fn user_key(&self) -> &[u8] {
        self.user_key.as_ref()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn is_tombstone(&self) -> bool {
        self.record_type == RecordType::Deletion
    }

    /// The encoded length: user key plus the fixed suffix.
    pub fn raw_len(&self) -> usize {
        self.user_key.as_ref().len() + KEY_SUFFIX_LEN
    }

    pub fn as_key_slice(&self) -> KeySlice {
        Key {
            user_key: self.user_key.as_ref(),
            seq: self.seq,
            record_type: self.record_type,
        }
    }

    /// Serialize as `user_key ‖ seq (LE u64) ‖ type (u8)`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_slice(self.user_key.as_ref());
        buf.put_u64_le(self.seq);
        buf.put_u8(self.record_type as u8);
    }
}

impl<'a> KeySlice<'a> {
    pub fn new(user_key: &'a [u8], seq: u64, record_type: RecordType) -> Self {
        Key {
            user_key,
            seq,
            record_type,
        }
    }

    /// Parse an encoded internal key. The framing guarantees `data` carries
    /// at least the fixed suffix.
    pub fn decode(data: &'a [u8]) -> Self {
        debug_assert!(data.len() >= KEY_SUFFIX_LEN);
        let split = data.len() - KEY_SUFFIX_LEN;
        let seq = u64::from_le_bytes(data[split..split + 8].try_into().unwrap());
        Key {
            user_key: &data[..split],
            seq,
            record_type: RecordType::from_u8(data[data.len() - 1]),
        }
    }

    pub fn to_key_vec(self) -> KeyVec {
        Key {
            user_key: self.user_key.to_vec(),
            seq: self.seq,
            record_type: self.record_type,
        }
    }

    pub fn to_key_bytes(self) -> KeyBytes {
        Key {
            user_key: Bytes::copy_from_slice(self.user_key),
            seq: self.seq,
            record_type: self.record_type,
        }
    }
}

impl KeyVec {
    pub fn new() -> Self {
        Key {
            user_key: Vec::new(),
            seq: 0,
            record_type: RecordType::Value,
        }
    }

    pub fn set_from_slice(&mut self, key: KeySlice) {
        self.user_key.clear();
        self.user_key.extend_from_slice(key.user_key);
        self.seq = key.seq;
        self.record_type = key.record_type;
    }

    pub fn into_key_bytes(self) -> KeyBytes {
        Key {
            user_key: self.user_key.into(),
            seq: self.seq,
            record_type: self.record_type,
        }
    }
}

impl Default for KeyVec {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyBytes {
    pub fn from_bytes(user_key: Bytes, seq: u64, record_type: RecordType) -> Self {
        Key {
            user_key,
            seq,
            record_type,
        }
    }
}

impl<T: AsRef<[u8]>> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: AsRef<[u8]>> Eq for Key<T> {}

impl<T: AsRef<[u8]>> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: AsRef<[u8]>> Ord for Key<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .as_ref()
            .cmp(other.user_key.as_ref())
            // larger seq sorts first
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| self.record_type.cmp(&other.record_type))
    }
}

impl<T: AsRef<[u8]>> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}@{}{}",
            Bytes::copy_from_slice(self.user_key.as_ref()),
            self.seq,
            if self.is_tombstone() { "(del)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_order() {
        let a = KeySlice::new(b"apple", 3, RecordType::Value);
        let b = KeySlice::new(b"apple", 7, RecordType::Value);
        let c = KeySlice::new(b"banana", 1, RecordType::Value);
        // newer version of the same user key sorts first
        assert!(b < a);
        assert!(a < c);
        assert!(b < c);
        // at equal (key, seq) a value sorts before a tombstone
        let d = KeySlice::new(b"apple", 3, RecordType::Deletion);
        assert!(a < d);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = KeySlice::new(b"k1", 42, RecordType::Deletion);
        let mut buf = Vec::new();
        key.encode_into(&mut buf);
        assert_eq!(buf.len(), key.raw_len());
        let back = KeySlice::decode(&buf);
        assert_eq!(back.user_key(), b"k1");
        assert_eq!(back.seq(), 42);
        assert_eq!(back.record_type(), RecordType::Deletion);
    }

    #[test]
    fn test_empty_user_key() {
        let key = KeySlice::new(b"", 1, RecordType::Value);
        let mut buf = Vec::new();
        key.encode_into(&mut buf);
        let back = KeySlice::decode(&buf);
        assert!(back.user_key().is_empty());
        // the empty key sorts before every non-empty key
        assert!(back < KeySlice::new(b"\x00", 1, RecordType::Value));
    }
}
