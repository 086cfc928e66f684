//! Cache keys: portable object identifiers derived from sub-FSAL handles.
//!
//! A key is the sub-FSAL's opaque handle bytes plus the sub-FSAL
//! identifier. The hash is computed once at construction with a keyed
//! SipHash so it is stable for the life of the process, and is compared
//! before the byte payload on every equality check.

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

use siphasher::sip::SipHasher13;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{CacheError, CacheResult};

// Fixed SipHash keys. Table placement must not move between calls, so the
// usual per-process random seeding is not an option here.
const KEY_HASH_K0: u64 = 0x7ac6_53d5_85ce_1f3b;
const KEY_HASH_K1: u64 = 0x2f1f_9a23_6bb3_0d4e;

const NAME_HASH_K0: u64 = 0x9b3c_0f41_c37d_9a6d;
const NAME_HASH_K1: u64 = 0x54d1_e2b8_7f08_3c55;

/// A portable, hashed identifier for a cached object.
#[derive(Clone, Eq)]
pub struct CacheKey {
    fsal_id: u16,
    bytes: Box<[u8]>,
    hash: u64,
}

impl CacheKey {
    /// Build a key from a sub-FSAL identifier and opaque handle bytes.
    ///
    /// # Errors
    /// Returns [`CacheError::Inval`] for an empty byte payload.
    pub fn new(fsal_id: u16, bytes: impl Into<Box<[u8]>>) -> CacheResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CacheError::Inval("empty cache key"));
        }
        let mut hasher = SipHasher13::new_with_keys(KEY_HASH_K0, KEY_HASH_K1);
        hasher.write_u16(fsal_id);
        hasher.write(&bytes);
        let hash = hasher.finish();
        Ok(CacheKey {
            fsal_id,
            bytes,
            hash,
        })
    }

    /// Identifier of the sub-FSAL the key belongs to.
    pub fn fsal_id(&self) -> u16 {
        self.fsal_id
    }

    /// The opaque handle bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The precomputed stable hash.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Serialize the key for export to a protocol layer.
    pub fn to_wire(&self) -> Vec<u8> {
        let header = WireKeyHeader {
            fsal_id: U16::new(self.fsal_id),
            key_len: U16::new(self.bytes.len() as u16),
        };
        let mut out = Vec::with_capacity(size_of::<WireKeyHeader>() + self.bytes.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }

    /// Rebuild a key from its wire form.
    ///
    /// # Errors
    /// Returns [`CacheError::Inval`] for truncated or oversized input.
    pub fn from_wire(wire: &[u8]) -> CacheResult<Self> {
        let (header, rest) = WireKeyHeader::read_from_prefix(wire)
            .map_err(|_| CacheError::Inval("truncated wire key"))?;
        let len = header.key_len.get() as usize;
        if rest.len() != len {
            return Err(CacheError::Inval("wire key length mismatch"));
        }
        CacheKey::new(header.fsal_id.get(), rest)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        // Hash first; the byte payload only decides ties.
        self.hash == other.hash
            && self.fsal_id == other.fsal_id
            && self.bytes == other.bytes
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey(fsal={}, hash={:#018x}, ", self.fsal_id, self.hash)?;
        for byte in self.bytes.iter().take(8) {
            write!(f, "{:02x}", byte)?;
        }
        if self.bytes.len() > 8 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

/// Fixed-size prefix of a wire-encoded key.
#[derive(Debug, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct WireKeyHeader {
    fsal_id: U16,
    key_len: U16,
}

/// Stable hash of a dirent name, used as the by-name index key.
pub(crate) fn hash_name(name: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(NAME_HASH_K0, NAME_HASH_K1);
    hasher.write(name.as_bytes());
    hasher.finish()
}
