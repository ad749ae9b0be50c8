//! Rebuilding an artifact from a base plus new record streams.
//!
//! New records are inserted first, so on overlap the new value wins and the
//! surviving base rows slot in around them. Fixed-size rebuilds parallelize
//! every pass; the varied-value rebuild is serial because extend offsets
//! must be assigned in a deterministic order.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rayon::prelude::*;
use tracing::debug;

use crate::builder::{
    dump_varied_value, map_stream, sum_total, BuildError, BuildTable, KeyOffReader,
};
use crate::hash::clock_seed;
use crate::index::{Hashtable, Pack};
use crate::layout::{
    read_offset_field, separated_value, set_count_for, varint_size, write_offset_field, BitSet,
    Header, TableKind, MAX_OFFSET, OFFSET_FIELD_SIZE,
};
use crate::stream::{Readers, RecordReader};

/// Counts how many of the stream's keys are already present in `pack`,
/// rewinding the stream afterwards.
fn count_hits<R: RecordReader + ?Sized>(pack: &Pack<'_>, reader: &mut R) -> Result<u64, BuildError> {
    let total = reader.total();
    let mut hit = 0;
    for _ in 0..total {
        let rec = reader.read(true).ok_or(BuildError::BadInput)?;
        if rec.key.len() != pack.key_len {
            return Err(BuildError::BadInput);
        }
        if crate::search::search_pack(pack, rec.key).is_some() {
            hit += 1;
        }
    }
    reader.reset();
    Ok(hit)
}

pub(crate) fn derive_fixed<W: Write>(
    base: &Hashtable,
    readers: &mut Readers<'_>,
    out: &mut W,
) -> Result<(), BuildError> {
    let pack = base.pack();

    let dirty = AtomicU64::new(0);
    let failed = AtomicBool::new(false);
    readers.par_iter_mut().for_each(|reader| {
        reader.reset();
        match count_hits(&pack, reader.as_mut()) {
            Ok(h) => {
                dirty.fetch_add(h, Ordering::Relaxed);
            }
            Err(_) => failed.store(true, Ordering::Relaxed),
        }
    });
    if failed.load(Ordering::Relaxed) {
        return Err(BuildError::BadInput);
    }
    let dirty = dirty.into_inner();

    // Every dirty hit is also one of the new records, so this never wraps.
    let total = sum_total(readers) + pack.item - dirty;
    let mut header = Header {
        kind: pack.kind,
        key_len: pack.key_len as u8,
        val_len: pack.val_len as u16,
        seed: clock_seed(),
        item: 0,
        set_cnt: set_count_for(total),
    };
    let table = BuildTable::new(&header);

    let item = AtomicU64::new(0);
    let failed = AtomicBool::new(false);
    readers.par_iter_mut().for_each(|reader| {
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

    // Surviving base rows, the slot range split one piece per input stream.
    let base_slots = pack.guide.len();
    let pieces = readers.len();
    let chunk = base_slots / pieces;
    let remain = base_slots % pieces;
    let mut ranges = Vec::with_capacity(pieces);
    let mut begin = 0;
    for i in 0..pieces {
        let end = begin + chunk + usize::from(i < remain);
        ranges.push(begin..end);
        begin = end;
    }
    ranges.into_par_iter().for_each(|range| {
        let mut cnt = 0u64;
        for slot in range {
            if pack.guide[slot] & 0x80 != 0 {
                continue;
            }
            let line = &pack.content[slot * pack.line_size..][..pack.line_size];
            if table.insert(&line[..pack.key_len], |row| row.copy_from_slice(line)) {
                cnt += 1;
            }
        }
        item.fetch_add(cnt, Ordering::Relaxed);
    });
    header.item = item.into_inner();
    debug!(
        items = header.item,
        dirty,
        sets = header.set_cnt,
        "fixed-size rebuild mapped"
    );

    table.write_to(&header, out)?;
    out.flush()?;
    Ok(())
}

pub(crate) fn derive_varied<W: Write>(
    base: &Hashtable,
    readers: &mut Readers<'_>,
    out: &mut W,
) -> Result<(), BuildError> {
    let pack = base.pack();

    let mut dirty = 0u64;
    for reader in readers.iter_mut() {
        reader.reset();
        dirty += count_hits(&pack, reader.as_mut())?;
    }

    let neo = sum_total(readers);
    let total = neo + pack.item - dirty;
    let mut header = Header {
        kind: TableKind::KvSeparated,
        key_len: pack.key_len as u8,
        val_len: OFFSET_FIELD_SIZE as u16,
        seed: clock_seed(),
        item: 0,
        set_cnt: set_count_for(total),
    };
    let table = BuildTable::new(&header);

    let mut offset = 0u64;
    for reader in readers.iter_mut() {
        let mut wrapped = KeyOffReader::new(reader.as_mut(), offset);
        header.item += map_stream(&table, &mut wrapped)?;
        offset = wrapped.offset();
    }
    if header.item != neo {
        return Err(BuildError::BadInput);
    }

    // Base rows insert after all new records, so a duplicate here means the
    // new value already won; the bitmap remembers which rows survived.
    let base_slots = pack.guide.len();
    let mut bitmap = BitSet::new(base_slots);
    for slot in 0..base_slots {
        if pack.guide[slot] & 0x80 != 0 {
            continue;
        }
        let line = &pack.content[slot * pack.line_size..][..pack.line_size];
        let val_off = read_offset_field(&line[pack.key_len..]);
        let val = pack
            .extend
            .get(val_off as usize..)
            .and_then(separated_value)
            .ok_or(BuildError::BadInput)?;
        if offset > MAX_OFFSET {
            return Err(BuildError::BadInput);
        }
        let installed = table.insert(&line[..pack.key_len], |row| {
            row[..pack.key_len].copy_from_slice(&line[..pack.key_len]);
            write_offset_field(&mut row[pack.key_len..], offset);
        });
        if installed {
            header.item += 1;
            bitmap.set(slot);
            offset += varint_size(val.len() as u64) + val.len() as u64;
        }
    }
    debug!(
        items = header.item,
        dirty,
        extend_bytes = offset,
        "varied-value rebuild mapped"
    );

    table.write_to(&header, out)?;
    drop(table);

    // Extend blob: all new values in stream order, then surviving base rows.
    for reader in readers.iter_mut() {
        reader.reset();
        for _ in 0..reader.total() {
            let rec = reader.read(false).ok_or(BuildError::BadInput)?;
            dump_varied_value(rec.val, out)?;
        }
    }
    for slot in 0..base_slots {
        if !bitmap.test(slot) {
            continue;
        }
        let line = &pack.content[slot * pack.line_size..][..pack.line_size];
        let val_off = read_offset_field(&line[pack.key_len..]);
        let val = pack
            .extend
            .get(val_off as usize..)
            .and_then(separated_value)
            .ok_or(BuildError::BadInput)?;
        dump_varied_value(val, out)?;
    }
    out.flush()?;
    Ok(())
}
