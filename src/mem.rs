use std::fs::{self, File};
use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

/// How a loaded artifact is brought into memory.
///
/// The choice affects warm-up latency and residency, never semantics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LoadPolicy {
    /// Map lazily; pages fault in on first touch.
    #[default]
    MapOnly,
    /// Map and advise the kernel to read ahead.
    MapFetch,
    /// Map with forced residency (populate).
    MapOccupy,
    /// Read the whole file into an anonymous heap buffer.
    CopyData,
}

/// Owns the artifact bytes for the lifetime of the handle.
pub(crate) enum Backing {
    Map(Mmap),
    Heap(Vec<u8>),
}

impl Backing {
    pub fn open(path: &Path, policy: LoadPolicy) -> io::Result<Self> {
        if policy == LoadPolicy::CopyData {
            return Ok(Backing::Heap(fs::read(path)?));
        }
        let file = File::open(path)?;
        // SAFETY: the artifact is immutable by contract once written; the
        // map is dropped with the handle.
        let map = unsafe {
            match policy {
                #[cfg(unix)]
                LoadPolicy::MapOccupy => MmapOptions::new().populate().map(&file)?,
                _ => MmapOptions::new().map(&file)?,
            }
        };
        #[cfg(unix)]
        if policy == LoadPolicy::MapFetch {
            map.advise(memmap2::Advice::WillNeed)?;
        }
        Ok(Backing::Map(map))
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Map(m) => m,
            Backing::Heap(v) => v,
        }
    }
}
