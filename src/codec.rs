//! Record codec: converts a record to and from its storage key and packed
//! binary blob.
//!
//! The blob is a versioned little-endian framing: magic, format version,
//! the record's display name, then each attribute as a length-prefixed name
//! followed by its length-prefixed values. Packing is deterministic;
//! unpacking rejects truncated or malformed input. Attribute flags are
//! request-scoped and are not persisted.

use crate::error::{Error, Result};
use crate::model::{Attribute, Name, Record};

const BLOB_MAGIC: &[u8; 4] = b"SBL1";
const BLOB_VERSION: u32 = 1;

/// Key prefix for ordinary records.
pub const RECORD_KEY_PREFIX: &[u8] = b"REC=";
/// Key prefix for index entries.
pub const INDEX_KEY_PREFIX: &[u8] = b"IDX=";

/// Derives the storage key for a name.
///
/// Ordinary names are case-folded under the `REC=` prefix; special names
/// are used verbatim, unprefixed and unfolded.
pub fn key_for(name: &Name) -> Vec<u8> {
    if name.is_special() {
        name.as_str().as_bytes().to_vec()
    } else {
        let folded = name.folded();
        let mut key = Vec::with_capacity(RECORD_KEY_PREFIX.len() + folded.len());
        key.extend_from_slice(RECORD_KEY_PREFIX);
        key.extend_from_slice(folded.as_bytes());
        key
    }
}

/// Serializes a record into its packed blob.
///
/// Deterministic for any record the mutation engine produces; the only
/// failure mode is resource exhaustion, which aborts allocation rather
/// than returning.
pub fn pack(record: &Record) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(BLOB_MAGIC);
    put_u32(&mut out, BLOB_VERSION);
    put_bytes(&mut out, record.name.as_str().as_bytes());
    put_u32(&mut out, record.attributes.len() as u32);
    for attr in &record.attributes {
        put_bytes(&mut out, attr.name.as_bytes());
        put_u32(&mut out, attr.values.len() as u32);
        for value in &attr.values {
            put_bytes(&mut out, value);
        }
    }
    out
}

/// Deserializes a packed blob back into a record.
///
/// Fails on truncation, bad magic, an unknown format version, or counts
/// inconsistent with the blob length. Attribute flags come back as their
/// defaults.
pub fn unpack(blob: &[u8]) -> Result<Record> {
    let mut cur = Cursor::new(blob);
    let magic = cur.take_bytes(BLOB_MAGIC.len())?;
    if magic != BLOB_MAGIC {
        return Err(corrupt("bad blob magic"));
    }
    let version = cur.take_u32()?;
    if version != BLOB_VERSION {
        return Err(corrupt(&format!("unsupported blob version {version}")));
    }
    let name = String::from_utf8(cur.take_prefixed()?.to_vec())
        .map_err(|_| corrupt("record name is not valid UTF-8"))?;
    let attr_count = cur.take_count()?;
    let mut attributes = Vec::with_capacity(attr_count);
    for _ in 0..attr_count {
        let attr_name = String::from_utf8(cur.take_prefixed()?.to_vec())
            .map_err(|_| corrupt("attribute name is not valid UTF-8"))?;
        let value_count = cur.take_count()?;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            values.push(cur.take_prefixed()?.to_vec());
        }
        attributes.push(Attribute::new(attr_name, values));
    }
    if cur.remaining() != 0 {
        return Err(corrupt("trailing bytes after packed record"));
    }
    Ok(Record::with_attributes(Name::new(name), attributes))
}

fn corrupt(what: &str) -> Error {
    Error::Operations(format!("corrupt record blob: {what}"))
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(corrupt("truncated blob"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes = self.take_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.take_u32()? as usize;
        self.take_bytes(len)
    }

    // A count must leave room for at least one length prefix per item,
    // which bounds allocations on malformed input.
    fn take_count(&mut self) -> Result<usize> {
        let count = self.take_u32()? as usize;
        if count > self.remaining() / 4 {
            return Err(corrupt("count exceeds blob length"));
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Record {
        Record::new("cn=a,ou=people")
            .attr(Attribute::new(
                "mail",
                vec![b"a@example.com".to_vec(), b"b@example.com".to_vec()],
            ))
            .attr(Attribute::single("uid", "1"))
            .attr(Attribute::new("emptyOk", vec![]))
    }

    #[test]
    fn round_trip_preserves_name_and_attributes() {
        let rec = sample();
        let back = unpack(&pack(&rec)).expect("unpack");
        assert_eq!(back, rec);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = pack(&sample());
        for cut in [0, 3, 7, blob.len() / 2, blob.len() - 1] {
            assert!(unpack(&blob[..cut]).is_err(), "cut at {cut} accepted");
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut blob = pack(&sample());
        blob[0] ^= 0xff;
        assert!(unpack(&blob).is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut blob = pack(&sample());
        blob.push(0);
        assert!(unpack(&blob).is_err());
    }

    #[test]
    fn oversized_count_is_rejected_without_allocating() {
        let mut blob = Vec::new();
        blob.extend_from_slice(BLOB_MAGIC);
        blob.extend_from_slice(&BLOB_VERSION.to_le_bytes());
        blob.extend_from_slice(&4u32.to_le_bytes());
        blob.extend_from_slice(b"cn=a");
        blob.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(unpack(&blob).is_err());
    }

    #[test]
    fn ordinary_keys_fold_and_specials_do_not() {
        assert_eq!(key_for(&Name::new("CN=Alice")), b"REC=cn=alice".to_vec());
        assert_eq!(key_for(&Name::new("@META")), b"@META".to_vec());
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_attribute_sets(
            name in "[a-zA-Z0-9=,]{1,24}",
            attrs in prop::collection::vec(
                (
                    "[a-zA-Z][a-zA-Z0-9]{0,11}",
                    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..24), 0..4),
                ),
                0..6,
            ),
        ) {
            let record = Record::with_attributes(
                Name::new(name),
                attrs
                    .into_iter()
                    .map(|(n, vs)| Attribute::new(n, vs))
                    .collect(),
            );
            let back = unpack(&pack(&record)).expect("unpack");
            prop_assert_eq!(back, record);
        }
    }
}
