//! sshtable — static set-associative on-disk hash index.
//!
//! - Build once, offline, from one or more record streams (parallel across
//!   streams, lock-free slot reservation).
//! - Load memory-mapped (or copied) and probe: single-key `search`, or
//!   pipelined `batch_search`/`batch_fetch` with explicit prefetching and
//!   SIMD-within-a-register guide scanning.
//! - Update by deriving a fresh artifact from a base plus delta streams;
//!   new values win on overlap.
//!
//! Three artifact kinds: key sets (membership only), inline dictionaries
//! (fixed-length values next to their keys) and separated dictionaries
//! (variable-length values in a trailing blob).

#[cfg(target_endian = "big")]
compile_error!("sshtable artifacts are little-endian; big-endian targets are unsupported");

mod batch;
mod builder;
mod derive;
mod divisor;
mod hash;
mod index;
mod layout;
mod mem;
mod search;
mod stream;

pub use builder::{BuildConfig, BuildError, Builder};
pub use divisor::Divisor;
pub use index::{Hashtable, LoadError};
pub use layout::{TableKind, MAX_INLINE_VALUE_LEN, MAX_KEY_LEN, MAX_VALUE_LEN};
pub use mem::LoadPolicy;
pub use stream::{Readers, Record, RecordReader, SliceReader};
