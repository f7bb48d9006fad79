//! Key hashing for the map.
//!
//! The table splits one 64-bit hash into a bucket index (low bits) and an
//! info fingerprint (top bits), so the hash must avalanche into its upper
//! bits. Hashers that cannot promise this are post-mixed with a fixed
//! multiplier before the split.

use bytemuck::Pod;

/// Multiplier applied to the output of hashers that do not declare
/// themselves avalanching. A single odd multiply is enough to spread
/// identity-style hashes into the top bits used for info fingerprints.
pub const BAD_HASH_PREVENTION: u64 = 0xb372_7c1f_779b_8d8b;

/// Hash function plugged into [`PMap`](crate::PMap).
///
/// Implementations are stateless marker types; the map never constructs a
/// hasher value.
pub trait MapHasher<K>: 'static {
    /// True when the hash already avalanches its input into the top bits.
    ///
    /// When false, the map multiplies the result by [`BAD_HASH_PREVENTION`]
    /// before splitting it into index and info bits.
    const AVALANCHING: bool = false;

    /// Hash a key to a 64-bit value.
    fn hash(key: &K) -> u64;
}

/// MurmurHash3 finalizer (64-bit)
#[inline]
pub const fn murmur3_finalize(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Multiply-shift mix for 32-bit keys
#[inline]
pub const fn mix32(h: u32) -> u64 {
    0xca4b_caa7_5ec3_f625u64.wrapping_mul(h as u64) >> 32
}

/// Hash an arbitrary byte sequence (Murmur2-style, little-endian blocks).
///
/// Deterministic across runs and platforms; suitable for hashing the raw
/// bytes of any `Pod` key.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const SEED: u64 = 0xe17a_1465;
    const R: u32 = 47;

    let mut h = SEED ^ (bytes.len() as u64).wrapping_mul(M);

    let mut blocks = bytes.chunks_exact(8);
    for block in &mut blocks {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(block);
        let mut k = u64::from_le_bytes(buf);

        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u64;
        for (i, &b) in tail.iter().enumerate() {
            k |= u64::from(b) << (8 * i);
        }
        h ^= k;
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// The library default: finalizer mixes for machine integers.
pub struct MixHasher;

impl MapHasher<u64> for MixHasher {
    const AVALANCHING: bool = true;

    #[inline]
    fn hash(key: &u64) -> u64 {
        murmur3_finalize(*key)
    }
}

impl MapHasher<i64> for MixHasher {
    const AVALANCHING: bool = true;

    #[inline]
    fn hash(key: &i64) -> u64 {
        murmur3_finalize(*key as u64)
    }
}

impl MapHasher<u32> for MixHasher {
    const AVALANCHING: bool = true;

    #[inline]
    fn hash(key: &u32) -> u64 {
        mix32(*key)
    }
}

impl MapHasher<i32> for MixHasher {
    const AVALANCHING: bool = true;

    #[inline]
    fn hash(key: &i32) -> u64 {
        mix32(*key as u32)
    }
}

/// Byte-sequence hasher usable with any `Pod` key.
///
/// Hashes the key's raw bytes with [`hash_bytes`]. This is the hasher to
/// reach for when the key is a packed struct or a fixed-size handle rather
/// than a machine integer.
pub struct BytesHasher;

impl<K: Pod> MapHasher<K> for BytesHasher {
    const AVALANCHING: bool = true;

    #[inline]
    fn hash(key: &K) -> u64 {
        hash_bytes(bytemuck::bytes_of(key))
    }
}
