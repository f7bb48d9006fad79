//! pmap - A persistent, memory-mapped Robin Hood hash map
//!
//! `PMap` stores its entire state - header, occupancy info bytes, and the
//! flat key/value slot array - in a single memory-mapped region, optionally
//! backed by a file. The backing file survives process restarts, so a map
//! reopened with the same `(directory, name)` pair sees its previous
//! contents.
//!
//! # Features
//!
//! - Robin Hood open addressing with branchless, sentinel-terminated iteration
//! - Lazy file creation and transparent reload after region reclamation
//! - Cooperative reclamation: a process-global region manager can unmap the
//!   backing region between operations and the map reattaches on demand
//! - Pointer-stable value access bracketed by scoped read-locks
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pmap::PMap;
//!
//! // Open (or create) a file-backed map
//! let map: PMap<u64, u64> = PMap::open("/tmp/pmap-demo", "squares")?;
//!
//! map.set(3, 9);
//! assert_eq!(map.get(&3), 9);
//!
//! for (k, v) in map.iter() {
//!     println!("{k} -> {v}");
//! }
//! ```

#![warn(missing_docs)]

pub mod gc;
pub mod hash;
pub mod layout;
mod lock;
pub mod map;

// Re-exports for convenience
pub use hash::{BytesHasher, MapHasher, MixHasher};
pub use map::iter::MapIter;
pub use map::{PMap, RefGuard};

/// Constants used throughout the library
pub mod constants {
    /// Slot count of the first allocation; every table size is a power of
    /// two at least this large.
    pub const INITIAL_SLOTS: usize = 1024;

    /// Number of hash bits initially folded into each info byte.
    pub const INITIAL_INFO_NUM_BITS: u32 = 5;

    /// Initial displacement step encoded in info bytes.
    pub const INITIAL_INFO_INC: u32 = 1 << INITIAL_INFO_NUM_BITS;

    /// Initial right-shift applied to the hash when extracting info bits.
    pub const INITIAL_INFO_HASH_SHIFT: u32 = 64 - INITIAL_INFO_NUM_BITS;

    /// Value of the trailing info byte that terminates iteration.
    pub const INFO_SENTINEL: u8 = 1;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::hash::{BytesHasher, MapHasher, MixHasher};
    pub use crate::map::iter::MapIter;
    pub use crate::map::{PMap, RefGuard};
}
