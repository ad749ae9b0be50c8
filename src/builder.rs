//! Offline artifact construction.
//!
//! All build flavors funnel into one mapping protocol over a shared table:
//! probe the key's set from its start offset, reserve an empty slot with a
//! `0xFF -> 0x80` CAS, copy the row, then release-store the 7-bit mark.
//! Fixed-size builds run one mapping task per input stream against the same
//! table; varied-value builds run serially because extend offsets are
//! assigned in stream order.

use std::cell::UnsafeCell;
use std::io::{self, Write};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::divisor::Divisor;
use crate::hash::{clock_seed, key_slot};
use crate::layout::{
    set_count_for, varint_size, write_offset_field, write_varint, Header, TableKind, EMPTY_SLOT,
    MAX_INLINE_VALUE_LEN, MAX_KEY_LEN, MAX_OFFSET, MAX_VALUE_LEN, OFFSET_FIELD_SIZE, RESERVED_SLOT,
    SET_SLOTS,
};
use crate::stream::{Readers, Record, RecordReader};

#[derive(Debug, Error)]
pub enum BuildError {
    /// A record failed validation, a stream lied about its length, or the
    /// reader list cannot produce an artifact.
    #[error("malformed build input")]
    BadInput,
    /// The sink rejected a write.
    #[error("failed to write artifact: {0}")]
    Output(#[from] io::Error),
}

/// Build parameters.
#[derive(Clone, Debug, Default)]
pub struct BuildConfig {
    /// Hash seed recorded in the artifact header. `None` draws a fresh seed
    /// from the clock, so repeated builds of the same input differ on disk.
    pub seed: Option<u64>,
}

pub struct Builder {
    cfg: BuildConfig,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            cfg: BuildConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: BuildConfig) -> Self {
        self.cfg = cfg;
        self
    }

    fn seed(&self) -> u64 {
        self.cfg.seed.unwrap_or_else(clock_seed)
    }

    /// Membership-only artifact: keys, no value bytes.
    pub fn build_set<W: Write>(
        &self,
        readers: &mut Readers<'_>,
        out: &mut W,
    ) -> Result<(), BuildError> {
        let (key_len, _) = detect_lens(readers, false)?;
        build_fixed(TableKind::KeySet, key_len, 0, self.seed(), readers, out)
    }

    /// Fixed-length values stored inline next to their keys.
    pub fn build_dict<W: Write>(
        &self,
        readers: &mut Readers<'_>,
        out: &mut W,
    ) -> Result<(), BuildError> {
        let (key_len, val_len) = detect_lens(readers, true)?;
        build_fixed(TableKind::KvInline, key_len, val_len, self.seed(), readers, out)
    }

    /// Variable-length values in a separate blob; rows store 6-byte offsets.
    pub fn build_varied_dict<W: Write>(
        &self,
        readers: &mut Readers<'_>,
        out: &mut W,
    ) -> Result<(), BuildError> {
        let (key_len, _) = detect_lens(readers, false)?;
        build_varied(key_len, self.seed(), readers, out)
    }
}

/// Key (and optionally value) length, taken from the first record of the
/// first stream; the stream is rewound afterwards.
fn detect_lens(readers: &mut Readers<'_>, want_val: bool) -> Result<(u8, u16), BuildError> {
    let first = readers.first_mut().ok_or(BuildError::BadInput)?;
    let rec = first.read(!want_val).ok_or(BuildError::BadInput)?;
    if rec.key.is_empty() || rec.key.len() > MAX_KEY_LEN {
        return Err(BuildError::BadInput);
    }
    let key_len = rec.key.len() as u8;
    let mut val_len = 0u16;
    if want_val {
        if rec.val.is_empty() || rec.val.len() > MAX_INLINE_VALUE_LEN {
            return Err(BuildError::BadInput);
        }
        val_len = rec.val.len() as u16;
    }
    first.reset();
    Ok((key_len, val_len))
}

pub(crate) fn sum_total(readers: &Readers<'_>) -> u64 {
    readers.iter().map(|r| r.total()).sum()
}

fn build_fixed<W: Write>(
    kind: TableKind,
    key_len: u8,
    val_len: u16,
    seed: u64,
    readers: &mut Readers<'_>,
    out: &mut W,
) -> Result<(), BuildError> {
    let total = sum_total(readers);
    if total == 0 {
        return Err(BuildError::BadInput);
    }
    let mut header = Header {
        kind,
        key_len,
        val_len,
        seed,
        item: 0,
        set_cnt: set_count_for(total),
    };
    let table = BuildTable::new(&header);

    let item = AtomicU64::new(0);
    let failed = AtomicBool::new(false);
    readers.par_iter_mut().for_each(|reader| {
        reader.reset();
        match map_stream(&table, reader.as_mut()) {
            Ok(cnt) => {
                item.fetch_add(cnt, Ordering::Relaxed);
            }
            Err(_) => failed.store(true, Ordering::Relaxed),
        }
    });
    if failed.load(Ordering::Relaxed) {
        return Err(BuildError::BadInput);
    }
    header.item = item.into_inner();
    debug!(
        items = header.item,
        sets = header.set_cnt,
        records = total,
        "fixed-size table mapped"
    );

    table.write_to(&header, out)?;
    out.flush()?;
    Ok(())
}

fn build_varied<W: Write>(
    key_len: u8,
    seed: u64,
    readers: &mut Readers<'_>,
    out: &mut W,
) -> Result<(), BuildError> {
    let total = sum_total(readers);
    if total == 0 {
        return Err(BuildError::BadInput);
    }
    let mut header = Header {
        kind: TableKind::KvSeparated,
        key_len,
        val_len: OFFSET_FIELD_SIZE as u16,
        seed,
        item: 0,
        set_cnt: set_count_for(total),
    };
    let table = BuildTable::new(&header);

    let mut offset = 0u64;
    for reader in readers.iter_mut() {
        reader.reset();
        let mut wrapped = KeyOffReader::new(reader.as_mut(), offset);
        header.item += map_stream(&table, &mut wrapped)?;
        offset = wrapped.offset();
    }
    // Extend offsets were assigned one per record; a duplicate key would
    // leave an orphaned value in the blob.
    if header.item != total {
        return Err(BuildError::BadInput);
    }
    debug!(
        items = header.item,
        sets = header.set_cnt,
        extend_bytes = offset,
        "varied-value table mapped"
    );

    table.write_to(&header, out)?;
    drop(table);

    for reader in readers.iter_mut() {
        reader.reset();
        for _ in 0..reader.total() {
            let rec = reader.read(false).ok_or(BuildError::BadInput)?;
            dump_varied_value(rec.val, out)?;
        }
    }
    out.flush()?;
    Ok(())
}

pub(crate) fn dump_varied_value<W: Write>(val: &[u8], out: &mut W) -> Result<(), BuildError> {
    write_varint(val.len() as u64, out)?;
    if !val.is_empty() {
        out.write_all(val)?;
    }
    Ok(())
}

/// Maps every record of one stream into the shared table. Returns the number
/// of records actually installed (duplicates are not).
pub(crate) fn map_stream<R: RecordReader + ?Sized>(
    table: &BuildTable,
    reader: &mut R,
) -> Result<u64, BuildError> {
    let total = reader.total();
    let mut cnt = total;
    for _ in 0..total {
        let rec = reader.read(false).ok_or(BuildError::BadInput)?;
        if rec.key.len() != table.key_len
            || (table.val_len != 0 && rec.val.len() != table.val_len)
        {
            return Err(BuildError::BadInput);
        }
        let (key, val) = (rec.key, rec.val);
        let installed = table.insert(key, |line| {
            line[..key.len()].copy_from_slice(key);
            if !val.is_empty() {
                line[key.len()..].copy_from_slice(val);
            }
        });
        if !installed {
            cnt -= 1;
        }
    }
    Ok(cnt)
}

/// The in-construction table: atomic guide bytes plus row storage shared by
/// every mapping task.
///
/// Slot ownership is mediated entirely by the guide byte. A row is written
/// only between a successful reservation CAS and the release-store of its
/// mark, so at most one task ever writes a given row, and any task that
/// observes the mark also observes the finished row.
pub(crate) struct BuildTable {
    guide: Box<[AtomicU8]>,
    rows: Box<[UnsafeCell<u8>]>,
    key_len: usize,
    val_len: usize,
    line_size: usize,
    seed: u64,
    set_cnt: Divisor,
}

// SAFETY: rows are only touched under the guide-byte protocol above.
unsafe impl Sync for BuildTable {}

impl BuildTable {
    pub fn new(header: &Header) -> Self {
        let slots = header.slots() as usize;
        let line_size = header.line_size();
        let guide = {
            let raw = Box::into_raw(vec![EMPTY_SLOT; slots].into_boxed_slice());
            // SAFETY: AtomicU8 has the same size and alignment as u8.
            unsafe { Box::from_raw(raw as *mut [AtomicU8]) }
        };
        let rows = {
            let raw = Box::into_raw(vec![0u8; slots * line_size].into_boxed_slice());
            // SAFETY: UnsafeCell<u8> has the same size and alignment as u8.
            unsafe { Box::from_raw(raw as *mut [UnsafeCell<u8>]) }
        };
        Self {
            guide,
            rows,
            key_len: header.key_len as usize,
            val_len: header.val_len as usize,
            line_size,
            seed: header.seed,
            set_cnt: Divisor::new(header.set_cnt),
        }
    }

    /// Installs `key` unless an equal key is already present. `fill` runs
    /// exactly once, on the reserved row, before the mark is published.
    pub fn insert(&self, key: &[u8], fill: impl FnOnce(&mut [u8])) -> bool {
        let ks = key_slot(key, self.seed, &self.set_cnt);
        let mut set = ks.set;
        let sft = ks.shift as u32;
        loop {
            let base = (set * SET_SLOTS) as usize;
            for j in sft..sft + SET_SLOTS as u32 {
                let slot = base + (j & 63) as usize;
                let g = &self.guide[slot];
                let mut m = g.load(Ordering::Relaxed);
                if m == EMPTY_SLOT {
                    match g.compare_exchange(
                        EMPTY_SLOT,
                        RESERVED_SLOT,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // SAFETY: the CAS made this task the slot's only
                            // writer until the mark below is published.
                            fill(unsafe { self.row_mut(slot) });
                            g.store(ks.mark, Ordering::Release);
                            return true;
                        }
                        Err(cur) => m = cur,
                    }
                }
                // Another task holds the reservation; its mark is imminent.
                while m & 0x80 != 0 {
                    std::hint::spin_loop();
                    m = g.load(Ordering::Relaxed);
                }
                if m == ks.mark && &self.row(slot)[..self.key_len] == key {
                    return false;
                }
            }
            set += 1;
            if set >= self.set_cnt.value() {
                set = 0;
            }
        }
    }

    /// Row of a slot whose mark has been observed; no writer can touch it.
    #[inline]
    pub fn row(&self, slot: usize) -> &[u8] {
        let start = slot * self.line_size;
        // SAFETY: published rows are never written again; see `insert`.
        unsafe { slice::from_raw_parts(self.rows[start].get() as *const u8, self.line_size) }
    }

    /// # Safety
    /// The caller must hold the slot's reservation.
    #[inline]
    unsafe fn row_mut(&self, slot: usize) -> &mut [u8] {
        let start = slot * self.line_size;
        slice::from_raw_parts_mut(self.rows[start].get(), self.line_size)
    }

    pub fn write_to<W: Write>(&self, header: &Header, out: &mut W) -> io::Result<()> {
        out.write_all(&header.to_bytes())?;
        // SAFETY: all mapping tasks have joined; both arrays are quiescent
        // and layout-identical to plain bytes.
        let guide =
            unsafe { slice::from_raw_parts(self.guide.as_ptr() as *const u8, self.guide.len()) };
        let rows =
            unsafe { slice::from_raw_parts(self.rows.as_ptr() as *const u8, self.rows.len()) };
        out.write_all(guide)?;
        out.write_all(rows)
    }
}

/// Wraps a stream for varied-value mapping: each record's value is replaced
/// by the 6-byte offset it will occupy in the extend blob, so the table can
/// be filled before any value byte is written.
pub(crate) struct KeyOffReader<'r> {
    core: &'r mut (dyn RecordReader + Send),
    base: u64,
    offset: u64,
    field: [u8; OFFSET_FIELD_SIZE],
}

impl<'r> KeyOffReader<'r> {
    pub fn new(core: &'r mut (dyn RecordReader + Send), offset: u64) -> Self {
        Self {
            core,
            base: offset,
            offset,
            field: [0; OFFSET_FIELD_SIZE],
        }
    }

    /// Running offset: where the next value will land in the extend blob.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl RecordReader for KeyOffReader<'_> {
    fn reset(&mut self) {
        self.core.reset();
        self.offset = self.base;
    }

    fn total(&self) -> u64 {
        self.core.total()
    }

    fn read(&mut self, _key_only: bool) -> Option<Record<'_>> {
        let rec = self.core.read(false)?;
        if self.offset > MAX_OFFSET || rec.val.len() as u64 > MAX_VALUE_LEN {
            return None;
        }
        write_offset_field(&mut self.field, self.offset);
        self.offset += varint_size(rec.val.len() as u64) + rec.val.len() as u64;
        Some(Record {
            key: rec.key,
            val: &self.field,
        })
    }
}
