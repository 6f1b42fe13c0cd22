//! Composite key encoding for the LMDB tables.
//!
//! # Binary Format
//!
//! Every string component is written as `[len: u32 BE][utf-8 bytes]`, so a
//! scope prefix can never match a longer sibling (`"ab"` does not start with
//! the encoding of `"a"`). Record and snapshot keys end with a version
//! suffix:
//!
//! - `N` for unversioned rows
//! - `E` followed by the raw ETag bytes
//! - `T` followed by 8 bytes of sign-flipped big-endian microseconds
//!
//! Sign flipping makes the byte order of timestamps match their numeric
//! order, so the rows of one path sort chronologically and "latest as of
//! `at`" becomes a reverse range scan.

use std::ops::Bound;

use vellum_core::{Etag, Timestamp};

const TAG_UNVERSIONED: u8 = b'N';
const TAG_ETAG: u8 = b'E';
const TAG_TIMESTAMP: u8 = b'T';

const SIGN_BIT: u64 = 1 << 63;

/// Version component of a record or snapshot key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKey<'a> {
    Unversioned,
    Etag(&'a Etag),
    At(Timestamp),
}

/// Builder for length-prefixed composite keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBuf(Vec<u8>);

impl KeyBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one string component.
    pub fn component(mut self, part: &str) -> Self {
        self.0.extend_from_slice(&(part.len() as u32).to_be_bytes());
        self.0.extend_from_slice(part.as_bytes());
        self
    }

    /// Append a version suffix.
    pub fn version(mut self, version: VersionKey<'_>) -> Self {
        match version {
            VersionKey::Unversioned => self.0.push(TAG_UNVERSIONED),
            VersionKey::Etag(etag) => {
                self.0.push(TAG_ETAG);
                self.0.extend_from_slice(etag.as_bytes());
            }
            VersionKey::At(ts) => {
                self.0.push(TAG_TIMESTAMP);
                self.0.extend_from_slice(&encode_timestamp(ts));
            }
        }
        self
    }

    /// Append only the timestamp tag, producing the prefix of every
    /// timestamp-versioned row in the current scope.
    pub fn timestamp_tag(mut self) -> Self {
        self.0.push(TAG_TIMESTAMP);
        self
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Prefix shared by every row of one `(type, namespace)`.
pub fn scope_prefix(type_name: &str, namespace: &str) -> KeyBuf {
    KeyBuf::new().component(type_name).component(namespace)
}

/// Prefix shared by every version of one `(type, namespace, path)`.
pub fn path_prefix(type_name: &str, namespace: &str, path: &str) -> KeyBuf {
    scope_prefix(type_name, namespace).component(path)
}

/// Encode a timestamp so that byte order equals chronological order.
pub fn encode_timestamp(ts: Timestamp) -> [u8; 8] {
    ((ts.timestamp_micros() as u64) ^ SIGN_BIT).to_be_bytes()
}

/// Inclusive key range over the timestamp-versioned rows of `prefix`
/// whose instant lies in `[from, to]`; an unbounded side is `None`.
pub struct TimeRange {
    lower: Vec<u8>,
    upper: Vec<u8>,
}

impl TimeRange {
    pub fn new(prefix: &KeyBuf, from: Option<Timestamp>, to: Option<Timestamp>) -> Self {
        let tagged = prefix.clone().timestamp_tag();
        let bound = |ts: Option<Timestamp>, fill: u8| {
            let mut key = tagged.as_slice().to_vec();
            match ts {
                Some(ts) => key.extend_from_slice(&encode_timestamp(ts)),
                None => key.extend_from_slice(&[fill; 8]),
            }
            key
        };
        Self {
            lower: bound(from, 0x00),
            upper: bound(to, 0xFF),
        }
    }

    /// Bounds in the shape heed's `range` / `rev_range` expect.
    pub fn bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (
            Bound::Included(self.lower.as_slice()),
            Bound::Included(self.upper.as_slice()),
        )
    }
}
