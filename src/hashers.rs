//! Hash builders and the fold from 64-bit hasher output to the 32-bit hash
//! the table caches per entry.

use core::hash::BuildHasher;
use core::hash::Hasher;

/// Folds a 64-bit hash into the 32 bits the table stores, keeping entropy
/// from both halves.
#[inline(always)]
pub(crate) fn fold_hash(hash: u64) -> u32 {
    (hash ^ (hash >> 32)) as u32
}

/// Polynomial base-31 string hash, `h = h * 31 + byte`.
///
/// Deterministic and unkeyed, so it offers no protection against crafted
/// collisions. It is the fallback hasher for builds without `std` or
/// `foldhash`, and a reproducible choice for tests.
///
/// # Examples
///
/// ```rust
/// use chunk_dict::HashMap;
/// use chunk_dict::hashers::Base31;
///
/// let mut map: HashMap<&str, u32, Base31> = HashMap::with_hasher(Base31);
/// map.insert("answer", 42);
/// assert_eq!(map.get("answer"), Some(&42));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Base31;

impl BuildHasher for Base31 {
    type Hasher = Base31Hasher;

    fn build_hasher(&self) -> Self::Hasher {
        Base31Hasher { state: 0 }
    }
}

/// The [`Hasher`] built by [`Base31`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Base31Hasher {
    state: u64,
}

impl Hasher for Base31Hasher {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state = self.state.wrapping_mul(31).wrapping_add(byte as u64);
        }
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }
}
