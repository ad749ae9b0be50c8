//! Input record streams.
//!
//! A build consumes each stream by calling `reset()` and then `read()`
//! exactly `total()` times; `None` from `read` signals a stream error and
//! fails the build. Output goes to any `std::io::Write`.

/// One input record. Borrows from the reader until the next `read`.
#[derive(Clone, Copy, Debug)]
pub struct Record<'a> {
    pub key: &'a [u8],
    pub val: &'a [u8],
}

/// A re-iterable stream of records with a known length.
pub trait RecordReader {
    /// Rewinds to the first record. Readers must be re-entrant across resets.
    fn reset(&mut self);

    /// Number of records this stream will yield after a reset.
    fn total(&self) -> u64;

    /// Next record; `key_only` lets the reader skip materializing the value.
    fn read(&mut self, key_only: bool) -> Option<Record<'_>>;
}

/// The builder's input: one boxed reader per parallel stream.
pub type Readers<'a> = Vec<Box<dyn RecordReader + Send + 'a>>;

/// Reader over an in-memory slice of `(key, value)` pairs.
pub struct SliceReader<'a> {
    records: &'a [(Vec<u8>, Vec<u8>)],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(records: &'a [(Vec<u8>, Vec<u8>)]) -> Self {
        Self { records, pos: 0 }
    }
}

impl RecordReader for SliceReader<'_> {
    fn reset(&mut self) {
        self.pos = 0;
    }

    fn total(&self) -> u64 {
        self.records.len() as u64
    }

    fn read(&mut self, _key_only: bool) -> Option<Record<'_>> {
        let (key, val) = self.records.get(self.pos)?;
        self.pos += 1;
        Some(Record { key, val })
    }
}
