#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod arena;
mod buckets;
mod compact;
mod config;
mod entry;
mod error;
mod free_list;
mod rehash;

/// A HashMap over the chunked-arena table.
///
/// This module provides a `HashMap` that wraps the `HashTable` and provides
/// a standard key-value map interface with configurable hashers, plus the
/// arena controls (`erase`, `emplace`, `rearrange`, `shrink_to_fit`).
pub mod hash_map;

/// The raw chained table: hash codes and equality predicates are supplied
/// by the caller, storage lives in a chunked entry arena.
pub mod hash_table;

/// A hash set over the chunked-arena table.
///
/// This module provides a `HashSet` that wraps the `HashTable` and provides
/// a standard set interface with configurable hashers.
pub mod hash_set;

pub mod hashers;

pub use buckets::MAX_BUCKET_CAPACITY;
pub use buckets::MIN_BUCKET_CAPACITY;
pub use config::Config;
pub use config::DEFAULT_MAX_CHUNK_BYTES;
pub use config::DEFAULT_MAX_LOAD_FACTOR;
pub use entry::EntryRef;
pub use error::TryReserveError;
pub use hash_map::Entry;
pub use hash_map::HashMap;
pub use hash_set::HashSet;
#[cfg(feature = "stats")]
pub use hash_table::DebugStats;
pub use hash_table::HashTable;

cfg_if::cfg_if! {
    if #[cfg(feature = "foldhash")] {
        /// The hasher builder used when none is named.
        pub type DefaultHashBuilder = foldhash::fast::RandomState;
    } else if #[cfg(feature = "std")] {
        /// The hasher builder used when none is named.
        pub type DefaultHashBuilder = std::hash::RandomState;
    } else {
        /// The hasher builder used when none is named.
        pub type DefaultHashBuilder = hashers::Base31;
    }
}
