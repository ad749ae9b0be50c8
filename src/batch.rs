//! Windowed, pipelined batch lookup.
//!
//! Memory latency dominates point lookups, so up to 16 probes stay in
//! flight at once. Each lane walks its own probe chain; touching a guide
//! group or a row always happens one round after prefetching it, which is
//! the entire trick: by the time a lane comes around again, the line is in
//! cache. A lane that settles (hit or terminator miss) reloads the next
//! unstarted query until the batch drains.

use crate::hash::key_slot;
use crate::index::Pack;
use crate::layout::SET_SLOTS;
use crate::search::{calc_hint, load_group};

/// Prefetch granularity. Rows that straddle a block boundary get the next
/// block prefetched too.
pub(crate) const CACHE_BLOCK_SIZE: usize = 64;
const _: () = assert!(CACHE_BLOCK_SIZE >= 64 && CACHE_BLOCK_SIZE.is_power_of_two());

const WINDOW_SIZE: usize = 16;

#[inline(always)]
fn prefetch_near(p: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch is a hint without memory effects.
    unsafe {
        use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(p as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = p;
}

#[inline(always)]
fn prefetch_far(p: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch is a hint without memory effects.
    unsafe {
        use core::arch::x86_64::{_mm_prefetch, _MM_HINT_NTA};
        _mm_prefetch::<_MM_HINT_NTA>(p as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = p;
}

/// Row prefetch: the head with high temporal locality, plus the next block
/// when the row crosses into it (eagerly if the key itself does, weakly if
/// only the value trails over).
#[inline]
fn prefetch_line(line: *const u8, key_len: usize, line_size: usize) {
    prefetch_near(line);
    let off = line as usize & (CACHE_BLOCK_SIZE - 1);
    let next = ((line as usize & !(CACHE_BLOCK_SIZE - 1)) + CACHE_BLOCK_SIZE) as *const u8;
    if off + key_len > CACHE_BLOCK_SIZE {
        prefetch_near(next);
    } else if off + line_size > CACHE_BLOCK_SIZE {
        prefetch_far(next);
    }
}

/// One in-flight probe.
struct Lane<'a> {
    idx: usize,
    set: u64,
    sft: u32,
    cur: u32,
    mark: u8,
    in_patch: bool,
    /// Staged row awaiting its key compare on the next visit.
    line: Option<&'a [u8]>,
}

fn bind<'a>(lane: &mut Lane<'a>, pack: &Pack<'a>, in_patch: bool, key: &[u8]) {
    let ks = key_slot(key, pack.seed, pack.set_cnt);
    lane.set = ks.set;
    lane.mark = ks.mark;
    lane.sft = ks.shift as u32;
    lane.cur = ks.shift as u32;
    lane.in_patch = in_patch;
    lane.line = None;
    prefetch_near(pack.guide[(lane.set * SET_SLOTS) as usize..].as_ptr());
}

/// Drives the window until every query has settled. `fill` receives the hit
/// value, or `dft_val` on a miss; the return value counts real hits only.
pub(crate) fn batch_process<'a, 'k>(
    batch: usize,
    base: &Pack<'a>,
    patch: Option<&Pack<'a>>,
    get_key: impl Fn(usize) -> &'k [u8],
    mut fill: impl FnMut(usize, Option<&'a [u8]>),
    dft_val: Option<&'a [u8]>,
) -> usize {
    let key_len = base.key_len;
    let line_size = base.line_size;
    let window = batch.min(WINDOW_SIZE);
    let mut hit = 0usize;

    let new_lane = |idx: usize| {
        let (pack, in_patch) = match patch {
            Some(p) => (p, true),
            None => (base, false),
        };
        let mut lane = Lane {
            idx,
            set: 0,
            sft: 0,
            cur: 0,
            mark: 0,
            in_patch,
            line: None,
        };
        bind(&mut lane, pack, in_patch, get_key(idx));
        lane
    };
    let mut lanes: Vec<Lane<'a>> = (0..window).map(&new_lane).collect();
    let mut next = window;

    while !lanes.is_empty() {
        let mut i = 0;
        while i < lanes.len() {
            let lane = &mut lanes[i];
            let settled = if let Some(line) = lane.line {
                if &line[..key_len] == get_key(lane.idx) {
                    hit += 1;
                    fill(lane.idx, Some(&line[key_len..]));
                    true
                } else {
                    lane.line = None;
                    false
                }
            } else {
                step_scan(lane, base, patch, &get_key, &mut fill, dft_val, key_len, line_size)
            };
            if settled {
                if next < batch {
                    lanes[i] = new_lane(next);
                    next += 1;
                    i += 1;
                } else {
                    lanes.swap_remove(i);
                    // The swapped-in lane gets processed at this index now.
                }
            } else {
                i += 1;
            }
        }
    }
    hit
}

/// Advances one lane through its guide scan. Returns true when the query
/// settled (miss delivered); staging a row, rebinding to the base, or
/// spilling to the next set all leave the lane pending.
#[allow(clippy::too_many_arguments)]
fn step_scan<'a, 'k>(
    lane: &mut Lane<'a>,
    base: &Pack<'a>,
    patch: Option<&Pack<'a>>,
    get_key: &impl Fn(usize) -> &'k [u8],
    fill: &mut impl FnMut(usize, Option<&'a [u8]>),
    dft_val: Option<&'a [u8]>,
    key_len: usize,
    line_size: usize,
) -> bool {
    let pack = if lane.in_patch { patch.unwrap() } else { base };
    let g = &pack.guide[(lane.set * SET_SLOTS) as usize..][..SET_SLOTS as usize];
    while lane.cur < lane.sft + SET_SLOTS as u32 {
        let mut off = (lane.cur & 63) as usize;
        if lane.cur <= lane.sft + 56 && off <= 56 {
            let hint = calc_hint(load_group(g, off), lane.mark);
            if hint == 0 {
                lane.cur += 8;
                continue;
            }
            let step = (hint.trailing_zeros() + 1) >> 3;
            off += step as usize - 1;
            lane.cur += step;
        } else {
            lane.cur += 1;
        }
        let b = g[off];
        if b == lane.mark {
            let row = ((lane.set * SET_SLOTS) as usize + off) * line_size;
            let line = &pack.content[row..][..line_size];
            prefetch_line(line.as_ptr(), key_len, line_size);
            lane.line = Some(line);
            return false;
        } else if b & 0x80 != 0 {
            if lane.in_patch {
                bind(lane, base, false, get_key(lane.idx));
                return false;
            }
            fill(lane.idx, dft_val);
            return true;
        }
    }
    // Set exhausted without a terminator: spill into the next set.
    lane.cur = lane.sft;
    lane.set += 1;
    if lane.set >= pack.set_cnt.value() {
        lane.set = 0;
    }
    prefetch_near(pack.guide[(lane.set * SET_SLOTS) as usize..].as_ptr());
    false
}
