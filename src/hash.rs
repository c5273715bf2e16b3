//! String hashing and tag-bloom primitives shared bit-for-bit with the peer implementation.
//!
//! Both [`hash32`] and [`bloom64`] are part of the wire protocol: sender and receiver must
//! agree on every bit, so neither function may be "improved" independently of the other side.

/// MurmurHash2 was written by Austin Appleby, and is placed in the public
/// domain. The author hereby disclaims copyright to this source code.
///
/// Note - This code makes a few assumptions about how your machine behaves -
///
/// 1. We can read a 4-byte value from any address without crashing
/// 2. sizeof(int) == 4
///
/// And it has a few limitations -
///
/// 1. It will not work incrementally.
/// 2. It will not produce the same results on little-endian and big-endian
///    machines.
fn murmur_hash2(key: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    // Initialize the hash to a 'random' value
    let mut h = seed ^ (key.len() as u32);

    // Mix 4 bytes at a time into the hash
    key.chunks_exact(4).for_each(|data| {
        let mut k = u32::from_ne_bytes(data.try_into().unwrap_or([0u8; 4]));

        k = k.saturating_mul(M);
        k ^= k >> R;
        k = k.saturating_mul(M);

        h = h.saturating_mul(M);
        h ^= k;
    });

    let key_len = key.len();
    let mod_len = key_len % 4;

    // Handle the last few bytes of the input array
    match mod_len {
        3 => {
            h ^= (key[key_len - 1] as u32) << 16;
            h ^= (key[key_len - 2] as u32) << 8;
            h ^= key[key_len - 3] as u32;
        }
        2 => {
            h ^= (key[key_len - 1] as u32) << 8;
            h ^= key[key_len - 2] as u32;
        }
        1 => h ^= key[key_len - 1] as u32,
        _ => (),
    }

    h = h.saturating_mul(M);

    // Do a few final mixes of the hash to ensure the last few
    // bytes are well-incorporated.
    h ^= h >> 13;
    h = h.saturating_mul(M);
    h ^= h >> 15;

    h
}

/// Computes the 32-bit wire hash of a string. Used for `subsystem`/`devtype` matching both in
/// the BPF filter and in the wire header.
pub fn hash32(s: &str) -> u32 {
    murmur_hash2(s.as_bytes(), 0)
}

/// Computes the 64-bit tag bloom word for a string.
///
/// Takes three disjoint 6-bit slices of [`hash32`] (bits 0..6, 6..12, 12..18) and returns a
/// 64-bit word with exactly those three bits set.
pub fn bloom64(s: &str) -> u64 {
    let hash = hash32(s);

    (1u64 << (hash & 63)) | (1u64 << ((hash >> 6) & 63)) | (1u64 << ((hash >> 12) & 63))
}

/// Tests whether a device's accumulated tag bloom carries every bit set in `bloom64(tag)`.
///
/// False positives are expected (that is the whole point of a bloom filter); false negatives
/// must never occur for a device that actually carries `tag`.
pub const fn bloom_matches(device_bloom: u64, tag_bloom: u64) -> bool {
    device_bloom & tag_bloom == tag_bloom
}
