//! # Key Hash Functions
//!
//! Purpose: Map key bytes to a 32-bit value for server selection.
//!
//! Every function matches the values libmemcached-compatible clients compute,
//! so a fleet shared with other clients routes the same key to the same
//! server.

use md5::{Digest, Md5};
use memc_common::{HashKind, MemcError, MemcResult};

const FNV_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV_32_INIT: u32 = 0x811c_9dc5;
const FNV_32_PRIME: u32 = 0x0100_0193;

/// Hashes `key` with the selected function.
///
/// # Errors
/// - `NotSupported` for recognised but unimplemented functions.
pub fn hash(kind: HashKind, key: &[u8]) -> MemcResult<u32> {
    let value = match kind {
        HashKind::Default => one_at_a_time(key),
        HashKind::Md5 => md5_u32(key),
        HashKind::Crc => crc(key),
        HashKind::Fnv1_64 => fnv1_64(key),
        HashKind::Fnv1a_64 => fnv1a_64(key),
        HashKind::Fnv1_32 => fnv1_32(key),
        HashKind::Fnv1a_32 => fnv1a_32(key),
        HashKind::Murmur => murmur2(key),
        HashKind::Hsieh | HashKind::Jenkins => {
            return Err(MemcError::NotSupported(format!("{kind:?} hash")))
        }
    };
    Ok(value)
}

/// Raw MD5 digest; the ring derives four points from each.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(data));
    out
}

/// First four MD5 digest bytes, little endian.
pub fn md5_u32(key: &[u8]) -> u32 {
    let digest = md5_digest(key);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn one_at_a_time(key: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for &b in key {
        value = value.wrapping_add(u32::from(b));
        value = value.wrapping_add(value << 10);
        value ^= value >> 6;
    }
    value = value.wrapping_add(value << 3);
    value ^= value >> 11;
    value.wrapping_add(value << 15)
}

fn crc(key: &[u8]) -> u32 {
    let value = (crc32fast::hash(key) >> 16) & 0x7fff;
    if value == 0 {
        1
    } else {
        value
    }
}

fn fnv1_64(key: &[u8]) -> u32 {
    let mut h = FNV_64_INIT;
    for &b in key {
        h = h.wrapping_mul(FNV_64_PRIME);
        h ^= u64::from(b);
    }
    h as u32
}

fn fnv1a_64(key: &[u8]) -> u32 {
    let mut h = FNV_64_INIT;
    for &b in key {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_64_PRIME);
    }
    h as u32
}

fn fnv1_32(key: &[u8]) -> u32 {
    let mut h = FNV_32_INIT;
    for &b in key {
        h = h.wrapping_mul(FNV_32_PRIME);
        h ^= u32::from(b);
    }
    h
}

fn fnv1a_32(key: &[u8]) -> u32 {
    let mut h = FNV_32_INIT;
    for &b in key {
        h ^= u32::from(b);
        h = h.wrapping_mul(FNV_32_PRIME);
    }
    h
}

/// MurmurHash2 with the seed derived from the key length.
fn murmur2(key: &[u8]) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let len = key.len() as u32;
    let seed = 0xdead_beef_u32.wrapping_mul(len);
    let mut h = seed ^ len;

    let mut chunks = key.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        if tail.len() >= 3 {
            h ^= u32::from(tail[2]) << 16;
        }
        if tail.len() >= 2 {
            h ^= u32::from(tail[1]) << 8;
        }
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}
