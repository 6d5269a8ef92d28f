//! 128-bit protocol hashes.
//!
//! Every identity in the protocol (per-instance properties, schema layouts,
//! component types) is the high 128 bits of a SHA-256 digest over a canonical
//! big-endian byte layout. The layout is part of the wire contract: any
//! change to it is a protocol break.

use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A 128-bit hash split into two 64-bit halves. The null hash (both halves
/// zero) is reserved to mean "unset".
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Hash128 {
    pub high: u64,
    pub low: u64,
}

/// Identifies a single property on a single entity instance.
pub type PropertyHash = Hash128;

/// Identifies a component type by nominal identity and structure.
pub type ComponentTypeHash = Hash128;

impl Hash128 {
    pub const NULL: Hash128 = Hash128 { high: 0, low: 0 };

    #[inline]
    pub fn new(high: u64, low: u64) -> Hash128 {
        Hash128 { high, low }
    }

    /// True if both halves are zero.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.high == 0 && self.low == 0
    }

    /// Interprets the first 16 digest bytes as two big-endian u64 halves.
    #[inline]
    pub fn from_digest_prefix(bytes: &[u8]) -> Hash128 {
        Hash128 {
            high: BigEndian::read_u64(&bytes[0..8]),
            low: BigEndian::read_u64(&bytes[8..16]),
        }
    }

    /// The canonical 16-byte big-endian rendering, used as hash input when
    /// one hash feeds another.
    #[inline]
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        BigEndian::write_u64(&mut out[0..8], self.high);
        BigEndian::write_u64(&mut out[8..16], self.low);
        out
    }
}

impl fmt::Display for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}:{:016x}", self.high, self.low)
    }
}

/// SplitMix64 finalizer. Mixes the combined halves so small input changes
/// avalanche across the full 64-bit output.
#[inline]
pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl Hash for Hash128 {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Golden-ratio combine of the halves, then the SplitMix64 finalizer.
        let combined = self.high
            ^ self
                .low
                .wrapping_add(0x9e37_79b9_7f4a_7c15)
                .wrapping_add(self.high << 6)
                .wrapping_add(self.high >> 2);
        state.write_u64(splitmix64(combined));
    }
}

/// SHA-256 over `input`, truncated to the high 128 bits.
pub(crate) fn sha256_high128(input: &[u8]) -> Hash128 {
    let digest = Sha256::digest(input);
    Hash128::from_digest_prefix(digest.as_slice())
}

/// Computes the per-instance property hash:
/// `SHA-256(entity_id BE8 || component_type || property_name)` truncated to
/// the high 128 bits.
///
/// The hash is computed once at registration and reused; it is a stable
/// identifier for the property instance.
pub fn compute_property_hash(entity_id: u64, component_type: &str, property_name: &str) -> PropertyHash {
    let mut input = Vec::with_capacity(8 + component_type.len() + property_name.len());
    let mut entity = [0u8; 8];
    BigEndian::write_u64(&mut entity, entity_id);
    input.extend_from_slice(&entity);
    input.extend_from_slice(component_type.as_bytes());
    input.extend_from_slice(property_name.as_bytes());
    sha256_high128(&input)
}
