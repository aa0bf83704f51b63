#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! An embedded, file-backed, in-memory key-value dictionary for read-mostly
//! workloads.
//!
//! The whole dictionary is one contiguous memory-mapped region that is also
//! the on-disk format: a header, a control block, an open-addressed entry
//! table, and a slab of 8-byte data blocks. Readers never take a lock; a
//! single writer at a time mutates the region in place and publishes every
//! record with one atomic store of its mark word, so a reader observes either
//! the old or the new state of a record, never a torn mix.
//!
//! Two engines share this design:
//!
//! - [`Dict`]: the variable engine, for keys of 1 to 255 bytes and values of
//!   up to 16 MiB less one, with in-place slab compaction and periodic
//!   probe-run sweeps.
//! - [`FixedDict`]: the fixed engine, for keys and values of fixed length in
//!   chained nodes, with time-delayed node recycling and a software-pipelined
//!   batch lookup.
//!
//! # Example
//!
//! ```
//! use shoal::{Config, Dict, LoadPolicy};
//!
//! # fn main() -> shoal::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("example.dict");
//!
//! Dict::create(&path, &Config::default(), None)?;
//! let dict = Dict::load(&path, LoadPolicy::Monopoly)?;
//!
//! dict.update(b"answer", b"42")?;
//! assert_eq!(dict.fetch(b"answer").as_deref(), Some(&b"42"[..]));
//!
//! dict.erase(b"answer")?;
//! assert!(dict.fetch(b"answer").is_none());
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! Many threads (or processes, through a [`LoadPolicy::Shared`] mapping) may
//! read concurrently with one writer. Writes serialize on a mutex inside the
//! control block. A successful lookup returns a value that was, at some point
//! during the call, bound to the key; lookups that race a sweep of the entry
//! table retry and keep a documented, very low probability of a false miss.
//!
//! # Portability
//!
//! The file format is little-endian, 64-bit aligned, and relies on unaligned
//! word loads; it is pinned to 64-bit little-endian CPUs with cheap unaligned
//! access (x86-64, aarch64).

mod divisor;
mod error;
mod hash;
mod layout;
mod lock;
mod mmap;

pub mod dict;
pub mod fixed;

pub use dict::{Config, Dict};
pub use error::{Error, Result};
pub use fixed::{FixedConfig, FixedDict};

/// One key-value pair handed out by a [`Source`].
pub struct Record<'a> {
    pub key: &'a [u8],
    pub val: &'a [u8],
}

/// A resettable stream of records for bulk loading.
///
/// [`Dict::create`] may run a source twice: once optimistically and once more
/// with a corrected slab estimate if the first pass ran out of room, so
/// `reset` must rewind to the first record.
pub trait Source {
    /// Rewinds to the first record.
    fn reset(&mut self);

    /// Number of records a full iteration yields.
    fn total(&self) -> usize;

    /// Reads the next record; the borrow ends at the next call.
    fn read(&mut self) -> Record<'_>;
}

/// How [`Dict::load`] and [`FixedDict::load`] attach to a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Map the file shared. Cooperating processes may open it at the same
    /// time; writer exclusion uses the control block inside the file and each
    /// opener is counted there.
    Shared,
    /// Take the file exclusively and reinitialize lock state on the heap.
    /// Refuses files whose writing flag is still set from a crashed writer.
    Monopoly,
    /// Read the file into an anonymous private mapping (hugepages preferred)
    /// and detach; mutations never reach the file.
    CopyData,
}
