//! The loaded artifact: validation, accessors and the public lookup surface.

use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::batch::batch_process;
use crate::builder::BuildError;
use crate::derive::{derive_fixed, derive_varied};
use crate::divisor::Divisor;
use crate::layout::{read_offset_field, separated_value, Header, TableKind, HEADER_SIZE, SET_SLOTS};
use crate::mem::{Backing, LoadPolicy};
use crate::search::search_pack;
use crate::stream::Readers;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid artifact: {0}")]
    Invalid(&'static str),
}

/// A read-only static hash index, memory-mapped or copied into memory.
///
/// Built offline by [`crate::Builder`]; every query is lock-free and
/// allocation-free. Dropping the handle releases the mapping or buffer.
pub struct Hashtable {
    data: Backing,
    kind: TableKind,
    key_len: u8,
    val_len: u16,
    line_size: usize,
    seed: u64,
    item: u64,
    set_cnt: Divisor,
    content_off: usize,
    extend_off: usize,
}

/// Borrowed probe view over one artifact; cheap to build per call and to
/// hand to the batch pipeline alongside a patch view.
#[derive(Clone, Copy)]
pub(crate) struct Pack<'a> {
    pub kind: TableKind,
    pub key_len: usize,
    pub val_len: usize,
    pub line_size: usize,
    pub seed: u64,
    pub item: u64,
    pub set_cnt: &'a Divisor,
    pub guide: &'a [u8],
    pub content: &'a [u8],
    pub extend: &'a [u8],
}

impl Hashtable {
    /// Maps (or copies) the artifact at `path` and validates its layout.
    pub fn load(path: impl AsRef<Path>, policy: LoadPolicy) -> Result<Self, LoadError> {
        Self::from_backing(Backing::open(path.as_ref(), policy)?)
    }

    /// Takes ownership of artifact bytes already in memory.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, LoadError> {
        Self::from_backing(Backing::Heap(data))
    }

    fn from_backing(data: Backing) -> Result<Self, LoadError> {
        let bytes = data.as_slice();
        let header = Header::parse(bytes).ok_or(LoadError::Invalid("header"))?;
        if header.set_cnt == 0 {
            return Err(LoadError::Invalid("zero set count"));
        }
        if header.key_len == 0 {
            return Err(LoadError::Invalid("zero key length"));
        }
        let val_ok = match header.kind {
            TableKind::KeySet => header.val_len == 0,
            TableKind::KvInline => header.val_len != 0,
            TableKind::KvSeparated => header.val_len as usize == crate::layout::OFFSET_FIELD_SIZE,
        };
        if !val_ok {
            return Err(LoadError::Invalid("value length inconsistent with kind"));
        }

        let slots = header
            .set_cnt
            .checked_mul(SET_SLOTS)
            .ok_or(LoadError::Invalid("set count overflow"))?;
        let line_size = header.line_size() as u64;
        let content_off = HEADER_SIZE as u64 + slots;
        let extend_off = slots
            .checked_mul(line_size)
            .and_then(|c| c.checked_add(content_off))
            .ok_or(LoadError::Invalid("table size overflow"))?;
        let len = bytes.len() as u64;
        if len < extend_off {
            return Err(LoadError::Invalid("truncated table"));
        }
        if header.kind == TableKind::KvSeparated
            && extend_off.checked_add(slots).map_or(true, |end| len < end)
        {
            return Err(LoadError::Invalid("truncated extend blob"));
        }

        debug!(
            kind = ?header.kind,
            items = header.item,
            sets = header.set_cnt,
            bytes = len,
            "artifact loaded"
        );
        Ok(Self {
            kind: header.kind,
            key_len: header.key_len,
            val_len: header.val_len,
            line_size: header.line_size(),
            seed: header.seed,
            item: header.item,
            set_cnt: Divisor::new(header.set_cnt),
            content_off: content_off as usize,
            extend_off: extend_off as usize,
            data,
        })
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn key_len(&self) -> u8 {
        self.key_len
    }

    pub fn val_len(&self) -> u16 {
        self.val_len
    }

    /// Number of distinct keys stored.
    pub fn item(&self) -> u64 {
        self.item
    }

    pub(crate) fn pack(&self) -> Pack<'_> {
        let bytes = self.data.as_slice();
        Pack {
            kind: self.kind,
            key_len: self.key_len as usize,
            val_len: self.val_len as usize,
            line_size: self.line_size,
            seed: self.seed,
            item: self.item,
            set_cnt: &self.set_cnt,
            guide: &bytes[HEADER_SIZE..self.content_off],
            content: &bytes[self.content_off..self.extend_off],
            extend: &bytes[self.extend_off..],
        }
    }

    /// Point lookup. `Some` carries the value bytes: empty for a key set,
    /// the inline value, or the payload parsed out of the extend blob.
    pub fn search(&self, key: &[u8]) -> Option<&[u8]> {
        if key.len() != self.key_len as usize {
            return None;
        }
        let pack = self.pack();
        let field = search_pack(&pack, key)?;
        if self.kind != TableKind::KvSeparated {
            return Some(field);
        }
        let off = read_offset_field(field);
        pack.extend.get(off as usize..).and_then(separated_value)
    }

    /// Pipelined lookup of up to `keys.len()` keys; `out[i]` receives the
    /// value slice or `None`. With a `patch`, its entries win over `self`.
    /// Returns the hit count. Key sets and inline dictionaries only.
    pub fn batch_search<'a>(
        &'a self,
        keys: &[&[u8]],
        out: &mut [Option<&'a [u8]>],
        patch: Option<&'a Hashtable>,
    ) -> usize {
        let batch = keys.len().min(out.len());
        if batch == 0 || self.kind == TableKind::KvSeparated {
            return 0;
        }
        let key_len = self.key_len as usize;
        if keys[..batch].iter().any(|k| k.len() != key_len) {
            return 0;
        }
        let patch = match self.check_patch(patch) {
            Ok(p) => p,
            Err(()) => return 0,
        };
        let base = self.pack();
        let patch_pack = patch.map(|p| p.pack());
        batch_process(
            batch,
            &base,
            patch_pack.as_ref(),
            |i| keys[i],
            |i, val| out[i] = val,
            None,
        )
    }

    /// Pipelined lookup over packed arrays: key `i` is
    /// `keys[i*key_len..][..key_len]`, its value lands at
    /// `out[i*val_len..][..val_len]`. On a miss the row gets `dft_val` if
    /// given, else stays untouched. Inline dictionaries only.
    pub fn batch_fetch(
        &self,
        batch: usize,
        keys: &[u8],
        out: &mut [u8],
        dft_val: Option<&[u8]>,
        patch: Option<&Hashtable>,
    ) -> usize {
        if batch == 0 || self.kind != TableKind::KvInline {
            return 0;
        }
        let key_len = self.key_len as usize;
        let val_len = self.val_len as usize;
        if keys.len() < batch * key_len || out.len() < batch * val_len {
            return 0;
        }
        if dft_val.map_or(false, |d| d.len() != val_len) {
            return 0;
        }
        let patch = match self.check_patch(patch) {
            Ok(p) => p,
            Err(()) => return 0,
        };
        let base = self.pack();
        let patch_pack = patch.map(|p| p.pack());
        batch_process(
            batch,
            &base,
            patch_pack.as_ref(),
            |i| &keys[i * key_len..][..key_len],
            |i, val| {
                if let Some(val) = val {
                    out[i * val_len..][..val_len].copy_from_slice(val);
                }
            },
            dft_val,
        )
    }

    /// A self-referential patch is ignored; an incompatible one rejects the
    /// whole batch.
    fn check_patch<'a>(&self, patch: Option<&'a Hashtable>) -> Result<Option<&'a Hashtable>, ()> {
        let Some(p) = patch else { return Ok(None) };
        if std::ptr::eq(p, self) {
            return Ok(None);
        }
        if p.kind != self.kind || p.key_len != self.key_len || p.val_len != self.val_len {
            return Err(());
        }
        Ok(Some(p))
    }

    /// Produces a new artifact whose key set is this table's plus the new
    /// streams', new values winning on overlap.
    pub fn derive<W: Write>(
        &self,
        readers: &mut Readers<'_>,
        out: &mut W,
    ) -> Result<(), BuildError> {
        if readers.is_empty() {
            return Err(BuildError::BadInput);
        }
        match self.kind {
            TableKind::KeySet | TableKind::KvInline => derive_fixed(self, readers, out),
            TableKind::KvSeparated => derive_varied(self, readers, out),
        }
    }
}
