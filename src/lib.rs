//! dense-table: open-addressing hash containers with a byte-sized control
//! plane and densely packed values.
//!
//! Four shapes over one engine:
//!
//! - [`DenseMap`]: unique key to value
//! - [`DenseSet`]: unique keys
//! - [`DenseMultiMap`]: key to an ordered chain of values
//! - [`DenseMultiSet`]: counted, ordered duplicates of equal keys
//!
//! Probing walks a one-byte-per-bucket control array; a matching byte
//! redirects through a cached-hash slot into dense storage, so misses cost a
//! byte compare and hits stay cache-friendly. Erasure swaps the victim with
//! the last dense entry and repairs the probe window by backward-shifting
//! displaced occupants; the table never carries tombstones. Rehashing rebuilds only the
//! control plane from the cached hashes; dense storage and the positions
//! handed out by `find` survive it.
//!
//! Lookups accept any probe type implementing [`Equivalent`] against the
//! stored key (so `&str` probes a `String`-keyed table), hashing is pluggable
//! through `BuildHasher` (default [`ahash::RandomState`]), and the per-bucket
//! index width is selectable: `u32` for nine-byte buckets, `u64` to lift the
//! entry cap for huge tables.
//!
//! Tables are single-threaded values: `&mut self` guards every mutation, and
//! detached cursors (rather than borrowing iterators) carry positions across
//! mutations, getting re-validated or re-derived when redeemed.

mod raw;

pub mod map;
pub mod multi_map;
pub mod multi_set;
pub mod set;

pub use equivalent::Equivalent;

pub use map::{Cursor, DenseMap};
pub use multi_map::{DenseMultiMap, MultiCursor};
pub use multi_set::DenseMultiSet;
pub use raw::IndexWidth;
pub use set::DenseSet;
