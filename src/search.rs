//! Single-key probe path.
//!
//! The guide is scanned eight bytes at a time: one 64-bit load, then a SWAR
//! "hint" word whose byte lanes are non-zero exactly where the guide byte
//! either equals the query's mark or has its high bit set (empty). Hint bits
//! are drained with count-trailing-zeros; each candidate gets the full
//! per-slot check. The first empty byte on the probe chain proves a miss.

use crate::hash::key_slot;
use crate::index::Pack;
use crate::layout::SET_SLOTS;

const VEC_ONES: u64 = 0x0101_0101_0101_0101;
const VEC_SIGN: u64 = 0x8080_8080_8080_8080;

/// Byte lane `j` of the result is non-zero iff guide byte `j` matches `mark`
/// or has its high bit set.
#[inline]
pub(crate) fn calc_hint(vec: u64, mark: u8) -> u64 {
    let vmark = !(VEC_ONES.wrapping_mul(mark as u64));
    let matched =
        (vec ^ VEC_SIGN) & VEC_SIGN & (((vec ^ vmark) & !VEC_SIGN).wrapping_add(VEC_ONES));
    (vec & VEC_SIGN) | matched
}

/// Unaligned 8-byte load from the guide window.
#[inline]
pub(crate) fn load_group(g: &[u8], pos: usize) -> u64 {
    debug_assert!(pos + 8 <= g.len());
    // SAFETY: bounds asserted above; unaligned reads are fine on the
    // little-endian targets this crate supports.
    unsafe { (g.as_ptr().add(pos) as *const u64).read_unaligned() }
}

enum Probe<'a> {
    Hit(&'a [u8]),
    Terminator,
    Skip,
}

#[inline]
fn check_slot<'a>(pack: &Pack<'a>, g: &[u8], set: u64, pos: usize, mark: u8, key: &[u8]) -> Probe<'a> {
    let b = g[pos];
    if b == mark {
        let row = ((set * SET_SLOTS) as usize + pos) * pack.line_size;
        let line = &pack.content[row..][..pack.line_size];
        if &line[..pack.key_len] == key {
            return Probe::Hit(&line[pack.key_len..]);
        }
    } else if b & 0x80 != 0 {
        return Probe::Terminator;
    }
    Probe::Skip
}

/// Probes for `key` and returns the row's value field (the inline value, or
/// the 6-byte extend offset, or an empty slice for key sets).
pub(crate) fn search_pack<'a>(pack: &Pack<'a>, key: &[u8]) -> Option<&'a [u8]> {
    let ks = key_slot(key, pack.seed, pack.set_cnt);
    let sft = ks.shift as u32;
    let mut set = ks.set;
    loop {
        let g = &pack.guide[(set * SET_SLOTS) as usize..][..SET_SLOTS as usize];
        let mut j = sft;
        while j < sft + SET_SLOTS as u32 {
            let off = (j & 63) as usize;
            if j <= sft + 56 && off <= 56 {
                let mut hint = calc_hint(load_group(g, off), ks.mark);
                while hint != 0 {
                    let skip = ((hint.trailing_zeros() + 1) >> 3) - 1;
                    match check_slot(pack, g, set, off + skip as usize, ks.mark, key) {
                        Probe::Hit(val) => return Some(val),
                        Probe::Terminator => return None,
                        Probe::Skip => {}
                    }
                    hint &= hint - 1;
                }
                j += 8;
                continue;
            }
            match check_slot(pack, g, set, off, ks.mark, key) {
                Probe::Hit(val) => return Some(val),
                Probe::Terminator => return None,
                Probe::Skip => {}
            }
            j += 1;
        }
        set += 1;
        if set >= pack.set_cnt.value() {
            set = 0;
        }
    }
}
