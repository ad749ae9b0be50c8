use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::divisor::Divisor;

/// Where a key lands in the table, derived from one 64-bit hash.
///
/// The three fields come from independent bit ranges of a well-mixed hash:
/// the set index from the low bits (mod the odd set count), the 7-bit mark
/// from bits 51..58, the starting slot offset from the top 6 bits.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeySlot {
    pub set: u64,
    pub mark: u8,
    pub shift: u8,
}

#[inline]
pub(crate) fn hash_key(key: &[u8], seed: u64) -> u64 {
    xxh3_64_with_seed(key, seed)
}

#[inline]
pub(crate) fn key_slot(key: &[u8], seed: u64, set_cnt: &Divisor) -> KeySlot {
    let h = hash_key(key, seed);
    KeySlot {
        set: set_cnt.rem(h),
        mark: ((h >> 51) & 0x7f) as u8,
        shift: (h >> 58) as u8,
    }
}

/// Fresh per-build seed: wall clock in nanoseconds pushed through splitmix64
/// so back-to-back builds never share one.
pub(crate) fn clock_seed() -> u64 {
    let ns = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    splitmix64(ns)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
