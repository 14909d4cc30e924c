use alloc::vec::Vec;
use core::fmt::Debug;
use core::iter::FusedIterator;
use core::mem::size_of;

use crate::arena::Arena;
use crate::arena::Chunk;
use crate::buckets::BucketTable;
use crate::compact;
use crate::compact::Goal;
use crate::config::Config;
use crate::entry::Entry as Slot;
use crate::entry::EntryRef;
use crate::entry::EntryState;
use crate::error::TryReserveError;
use crate::error::infallible;
use crate::error::try_reserve_exact;
use crate::free_list::EntryLinks;
use crate::rehash;
use crate::rehash::RehashStrategy;

/// Erasing below `1 / LOW_WATER_DIVISOR` of the entry capacity triggers an
/// automatic rearrange when the table spans more than one chunk.
pub(crate) const LOW_WATER_DIVISOR: usize = 8;

/// Arena and bucket statistics for a table.
///
/// Available in tests and with the `stats` feature.
#[cfg(any(test, feature = "stats"))]
#[derive(Debug, Clone)]
pub struct DebugStats {
    /// Number of live entries.
    pub populated: usize,
    /// Number of buckets.
    pub bucket_count: usize,
    /// Buckets with a non-empty chain.
    pub occupied_buckets: usize,
    /// Length of the longest chain.
    pub longest_chain: usize,
    /// Number of chunks in the arena.
    pub chunk_count: usize,
    /// Entry slots across all chunks.
    pub entry_capacity: usize,
    /// Slots handed out by bump allocation.
    pub allocated_slots: usize,
    /// Slots on the free list.
    pub free_slots: usize,
    /// Live entries per bucket.
    pub load_factor: f64,
    /// Bytes held by chunks.
    pub chunk_bytes: usize,
    /// Bytes held by the bucket array.
    pub bucket_bytes: usize,
}

#[cfg(any(test, feature = "stats"))]
impl DebugStats {
    /// Pretty-print the statistics.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        println!("=== Chunked Table Statistics ===");
        println!(
            "Population: {} entries over {} buckets ({:.2} load factor)",
            self.populated, self.bucket_count, self.load_factor
        );
        println!(
            "Chains: {} occupied, longest {}",
            self.occupied_buckets, self.longest_chain
        );
        println!(
            "Arena: {} chunks, {}/{} slots handed out, {} on the free list",
            self.chunk_count, self.allocated_slots, self.entry_capacity, self.free_slots
        );
        let total = self.chunk_bytes + self.bucket_bytes;
        let slot_bytes = self.chunk_bytes / self.entry_capacity.max(1);
        let wasted = (self.entry_capacity - self.populated) * slot_bytes;
        println!(
            "Memory: {} bytes ({} bytes in unused slots, {:.02}%)",
            total,
            wasted,
            if total == 0 {
                0.0
            } else {
                (wasted as f64 / total as f64) * 100.0
            }
        );
    }
}

/// A separately chained hash table whose entries live in a chunked arena.
///
/// `HashTable<V>` stores values of type `V`. Like the other raw tables it
/// does not hash anything itself: every operation takes the value's 32-bit
/// hash and an equality predicate. The predicate only runs on entries whose
/// cached hash matches.
///
/// Entries are allocated from fixed-capacity chunks that never move while a
/// table grows, and erased slots are reused through a free list before any
/// new chunk is allocated. [`shrink_to_fit`](Self::shrink_to_fit) and
/// [`rearrange`](Self::rearrange) consolidate live entries into fewer chunks.
///
/// ## Example
///
/// ```rust
/// # use core::hash::Hash;
/// # use core::hash::Hasher;
/// #
/// # use chunk_dict::hash_table::Entry;
/// # use chunk_dict::hash_table::HashTable;
/// # use siphasher::sip::SipHasher;
/// #
/// # #[derive(Debug, PartialEq)]
/// # struct Person {
/// #     id: u64,
/// #     name: String,
/// # }
/// #
/// # fn hash_id(id: u64) -> u32 {
/// #     let mut hasher = SipHasher::new();
/// #     id.hash(&mut hasher);
/// #     hasher.finish() as u32
/// # }
///
/// let mut table = HashTable::with_capacity(100);
/// let hash = hash_id(123);
///
/// match table.entry(hash, |p: &Person| p.id == 123) {
///     Entry::Vacant(entry) => {
///         entry.insert(Person {
///             id: 123,
///             name: "Alice".to_string(),
///         });
///     }
///     Entry::Occupied(_) => {
///         println!("Person already exists");
///     }
/// }
/// assert_eq!(table.len(), 1);
/// ```
pub struct HashTable<V> {
    buckets: BucketTable,
    arena: Arena<V>,
    populated: usize,
    config: Config,
    version: u64,
}

impl<V> Debug for HashTable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HashTable")
            .field("populated", &self.populated)
            .field("buckets", &self.buckets.len())
            .field("chunks", &self.arena.chunks.len())
            .field("capacity", &self.arena.capacity())
            .field("free", &self.arena.free.len())
            .field("version", &self.version)
            .finish()
    }
}

impl<V> Clone for HashTable<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        let mut table = Self::with_config(self.config.initial_capacity(0));
        infallible(table.try_reserve(self.populated));
        let buckets = self.buckets.len().max(table.buckets.len());
        infallible(table.try_rehash_to(buckets, None));

        // Tail of each destination chain, so appends stay O(1).
        let mut tails: Vec<Option<EntryRef>> = Vec::new();
        infallible(try_reserve_exact(&mut tails, table.buckets.len()));
        tails.resize(table.buckets.len(), None);

        for index in 0..self.buckets.len() {
            let mut cur = self.buckets.head(index);
            while let Some(at) = cur {
                let entry = self.arena.slot(at);
                let Some(slot) = table.arena.acquire() else {
                    unreachable!("reserved slots cover every cloned entry");
                };
                table.arena.occupy(slot, entry.hash(), entry.value().clone());
                let bucket = table.buckets.index_for(entry.hash());
                match tails[bucket] {
                    Some(prev) => table.arena.chunks[..].set_next(prev, Some(slot)),
                    None => table.buckets.set_head(bucket, Some(slot)),
                }
                tails[bucket] = Some(slot);
                table.populated += 1;
                cur = entry.next();
            }
        }

        debug_assert_eq!(table.populated, self.populated);
        table
    }
}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HashTable<V> {
    /// Creates an empty table with the default [`Config`]. No chunk is
    /// allocated until the first insertion.
    pub fn new() -> Self {
        Self::with_config(Config::new())
    }

    /// Creates a table whose first chunk holds at least `capacity` entries.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chunk_dict::hash_table::HashTable;
    /// #
    /// let table: HashTable<String> = HashTable::with_capacity(100);
    /// assert!(table.capacity() >= 100);
    /// assert_eq!(table.chunk_count(), 1);
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_config(Config::new().initial_capacity(capacity))
    }

    /// Creates a table from a full [`Config`].
    pub fn with_config(config: Config) -> Self {
        infallible(Self::try_with_config(config))
    }

    /// Fallible version of [`with_config`](Self::with_config).
    pub fn try_with_config(config: Config) -> Result<Self, TryReserveError> {
        let arena = Arena::new(config.initial_chunk_entries(), config.get_max_chunk_bytes());
        let buckets = BucketTable::normalize(config.buckets_for(arena.initial_chunk_entries()));
        let mut table = HashTable {
            buckets: BucketTable::try_with_capacity(buckets)?,
            arena,
            populated: 0,
            config,
            version: 0,
        };
        if config.get_initial_capacity() > 0 {
            let capacity = table.arena.next_chunk_capacity();
            let chunk = table.arena.try_prepare_chunk(capacity)?;
            table.arena.push_chunk(chunk);
        }
        Ok(table)
    }

    /// The configuration the table was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns `true` if the table contains no elements.
    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    /// Returns the number of elements in the table.
    pub fn len(&self) -> usize {
        self.populated
    }

    /// Number of entry slots across all chunks, live or not.
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Number of buckets. Always a power of two.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of chunks in the arena.
    pub fn chunk_count(&self) -> usize {
        self.arena.chunks.len()
    }

    /// A counter bumped by every structural mutation: insertion, removal,
    /// rehash, compaction and clearing.
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    fn touch(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Walks the chain for `hash`, returning the predecessor and the matching
    /// entry.
    #[inline]
    fn search(
        &self,
        hash: u32,
        eq: impl Fn(&V) -> bool,
    ) -> Option<(Option<EntryRef>, EntryRef)> {
        search_chain(&self.buckets, &self.arena, hash, eq)
    }

    /// Returns a handle to the entry matching `hash` and `eq`.
    pub fn find(&self, hash: u32, eq: impl Fn(&V) -> bool) -> Option<EntryRef> {
        self.search(hash, eq).map(|(_, at)| at)
    }

    /// Returns a reference to the value matching `hash` and `eq`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chunk_dict::hash_table::HashTable;
    /// #
    /// let mut table = HashTable::new();
    /// table.insert(7, 70u64, |&v| v == 70);
    /// assert_eq!(table.get(7, |&v| v == 70), Some(&70));
    /// assert_eq!(table.get(7, |&v| v == 71), None);
    /// ```
    pub fn get(&self, hash: u32, eq: impl Fn(&V) -> bool) -> Option<&V> {
        self.search(hash, eq)
            .map(|(_, at)| self.arena.slot(at).value())
    }

    /// Returns a mutable reference to the value matching `hash` and `eq`.
    pub fn get_mut(&mut self, hash: u32, eq: impl Fn(&V) -> bool) -> Option<&mut V> {
        let (_, at) = self.search(hash, eq)?;
        Some(self.arena.slot_mut(at).value_mut())
    }

    /// Resolves a handle returned by [`find`](Self::find).
    ///
    /// Returns `None` when the handle no longer names a live entry. A handle
    /// kept across a capacity-changing operation may name a different entry.
    pub fn get_by_ref(&self, at: EntryRef) -> Option<&V> {
        let entry = self
            .arena
            .chunks
            .get(at.chunk().index())?
            .entries
            .get(at.slot())?;
        (entry.is_live() && entry.chunk() == at.chunk()).then(|| entry.value())
    }

    /// Mutable counterpart of [`get_by_ref`](Self::get_by_ref).
    pub fn get_by_ref_mut(&mut self, at: EntryRef) -> Option<&mut V> {
        let entry = self
            .arena
            .chunks
            .get_mut(at.chunk().index())?
            .entries
            .get_mut(at.slot())?;
        if entry.is_live() && entry.chunk() == at.chunk() {
            Some(entry.value_mut())
        } else {
            None
        }
    }

    /// Inserts `value`, replacing and returning an existing value that
    /// matches `eq`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chunk_dict::hash_table::HashTable;
    /// #
    /// let mut table = HashTable::new();
    /// assert_eq!(table.insert(1, (1, "a"), |v| v.0 == 1), None);
    /// assert_eq!(table.insert(1, (1, "b"), |v| v.0 == 1), Some((1, "a")));
    /// assert_eq!(table.len(), 1);
    /// ```
    pub fn insert(&mut self, hash: u32, value: V, eq: impl Fn(&V) -> bool) -> Option<V> {
        infallible(self.try_insert(hash, value, eq))
    }

    /// Fallible version of [`insert`](Self::insert). On error the table is
    /// unchanged and `value` is dropped.
    pub fn try_insert(
        &mut self,
        hash: u32,
        value: V,
        eq: impl Fn(&V) -> bool,
    ) -> Result<Option<V>, TryReserveError> {
        if let Some((_, at)) = self.search(hash, &eq) {
            let old = core::mem::replace(self.arena.slot_mut(at).value_mut(), value);
            self.touch();
            return Ok(Some(old));
        }
        self.try_link_new(hash, value)?;
        Ok(None)
    }

    /// Inserts `value` unless a value matching `eq` is already present, in
    /// which case the table is left alone and `value` is dropped. Returns
    /// whether `value` was inserted.
    pub fn insert_if_absent(&mut self, hash: u32, value: V, eq: impl Fn(&V) -> bool) -> bool {
        if self.search(hash, &eq).is_some() {
            return false;
        }
        infallible(self.try_link_new(hash, value));
        true
    }

    /// Builds a value and inserts it unless an equal one already exists.
    ///
    /// The value is constructed exactly once and moved straight into a newly
    /// acquired slot; only then is the chain searched. On a collision the
    /// provisional entry goes back to the free list and the existing value
    /// is returned untouched. The flag is `true` when the new value was
    /// kept.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chunk_dict::hash_table::HashTable;
    /// #
    /// let mut table: HashTable<(u32, &str)> = HashTable::new();
    /// let hash = |v: &(u32, &str)| v.0;
    /// let same = |a: &(u32, &str), b: &(u32, &str)| a.0 == b.0;
    ///
    /// let (value, inserted) = table.emplace(|| (5, "first"), hash, same);
    /// assert!(inserted);
    /// assert_eq!(value.1, "first");
    ///
    /// let (value, inserted) = table.emplace(|| (5, "second"), hash, same);
    /// assert!(!inserted);
    /// assert_eq!(value.1, "first");
    /// ```
    pub fn emplace(
        &mut self,
        make: impl FnOnce() -> V,
        hasher: impl Fn(&V) -> u32,
        eq: impl Fn(&V, &V) -> bool,
    ) -> (&mut V, bool) {
        infallible(self.try_emplace(make, hasher, eq))
    }

    /// Fallible version of [`emplace`](Self::emplace). `make` is not called
    /// when no slot can be acquired.
    pub fn try_emplace(
        &mut self,
        make: impl FnOnce() -> V,
        hasher: impl Fn(&V) -> u32,
        eq: impl Fn(&V, &V) -> bool,
    ) -> Result<(&mut V, bool), TryReserveError> {
        let at = self.try_acquire()?;
        let mut provisional = Provisional {
            arena: &mut self.arena,
            at,
        };
        let value = make();
        let hash = hasher(&value);
        provisional.arena.occupy(at, hash, value);

        let existing = {
            let arena = &*provisional.arena;
            let new_value = arena.slot(at).value();
            search_chain(&self.buckets, arena, hash, |v| eq(v, new_value))
        };
        if let Some((_, found)) = existing {
            drop(provisional);
            return Ok((self.arena.slot_mut(found).value_mut(), false));
        }
        core::mem::forget(provisional);

        let bucket = self.buckets.index_for(hash);
        self.buckets.push_front(&mut self.arena.chunks[..], bucket, at);
        self.populated += 1;
        self.touch();
        Ok((self.arena.slot_mut(at).value_mut(), true))
    }

    /// Erases the value matching `hash` and `eq`, returning whether one was
    /// found.
    ///
    /// The value's destructor is deferred until its slot is reused or its
    /// chunk is released. Use [`remove`](Self::remove) to get the value
    /// back instead.
    pub fn erase(&mut self, hash: u32, eq: impl Fn(&V) -> bool) -> bool {
        let Some((prev, at)) = self.search(hash, eq) else {
            return false;
        };
        self.unlink(hash, prev, at);
        self.arena.discard(at);
        self.after_release();
        true
    }

    /// Removes and returns the value matching `hash` and `eq`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chunk_dict::hash_table::HashTable;
    /// #
    /// let mut table = HashTable::new();
    /// table.insert(42, 42u64, |&n| n == 42);
    ///
    /// assert_eq!(table.remove(42, |&n| n == 42), Some(42));
    /// assert!(table.is_empty());
    /// assert_eq!(table.remove(99, |&n| n == 99), None);
    /// ```
    pub fn remove(&mut self, hash: u32, eq: impl Fn(&V) -> bool) -> Option<V> {
        let (prev, at) = self.search(hash, eq)?;
        self.unlink(hash, prev, at);
        let value = self.arena.take(at);
        self.after_release();
        Some(value)
    }

    /// Gets the entry for `hash` and `eq` for in-place manipulation.
    pub fn entry(&mut self, hash: u32, eq: impl Fn(&V) -> bool) -> Entry<'_, V> {
        match self.search(hash, eq) {
            Some((prev, at)) => Entry::Occupied(OccupiedEntry {
                table: self,
                hash,
                prev,
                at,
            }),
            None => Entry::Vacant(VacantEntry { table: self, hash }),
        }
    }

    fn unlink(&mut self, hash: u32, prev: Option<EntryRef>, at: EntryRef) {
        let bucket = self.buckets.index_for(hash);
        self.buckets
            .unlink(&mut self.arena.chunks[..], bucket, prev, at);
        self.populated -= 1;
        self.touch();
    }

    /// Releases an emptied tail chunk and, once the population falls below
    /// the low-water mark, consolidates the remaining chunks.
    fn after_release(&mut self) {
        self.arena.release_empty_tail();

        if !self.config.get_auto_shrink() || self.arena.chunks.len() < 2 {
            return;
        }
        if self.populated.saturating_mul(LOW_WATER_DIVISOR) >= self.arena.capacity() {
            return;
        }
        if let Err(error) = self.try_rearrange() {
            tracing::debug!(%error, populated = self.populated, "skipping automatic rearrange");
        }
    }

    /// Acquires a slot, appending a chunk (and growing the bucket array to
    /// match) when neither the free list nor the newest chunk has room.
    fn try_acquire(&mut self) -> Result<EntryRef, TryReserveError> {
        if let Some(at) = self.arena.acquire() {
            return Ok(at);
        }

        let capacity = self.arena.next_chunk_capacity();
        let chunk = self.arena.try_prepare_chunk(capacity)?;
        let total = self
            .arena
            .capacity()
            .checked_add(capacity)
            .ok_or(TryReserveError::CapacityOverflow)?;
        self.try_grow_buckets_for(total)?;
        self.arena.push_chunk(chunk);

        let Some(at) = self.arena.acquire() else {
            unreachable!("a freshly appended chunk has room");
        };
        Ok(at)
    }

    fn try_link_new(&mut self, hash: u32, value: V) -> Result<EntryRef, TryReserveError> {
        let at = self.try_acquire()?;
        self.arena.occupy(at, hash, value);
        let bucket = self.buckets.index_for(hash);
        self.buckets
            .push_front(&mut self.arena.chunks[..], bucket, at);
        self.populated += 1;
        self.touch();
        Ok(at)
    }

    fn try_grow_buckets_for(&mut self, entries: usize) -> Result<(), TryReserveError> {
        let wanted = BucketTable::normalize(self.config.buckets_for(entries));
        if wanted > self.buckets.len() {
            self.try_rehash_to(wanted, None)?;
        }
        Ok(())
    }

    /// Rebuilds the bucket array with `capacity` buckets (already
    /// normalized), choosing a strategy from the table shape unless one is
    /// forced.
    fn try_rehash_to(
        &mut self,
        capacity: usize,
        strategy: Option<RehashStrategy>,
    ) -> Result<(), TryReserveError> {
        let old = self.buckets.len();
        if capacity == old {
            return Ok(());
        }
        let strategy = strategy.unwrap_or_else(|| {
            RehashStrategy::select(
                old,
                capacity,
                self.populated,
                self.arena.max_chunk_entries(),
            )
        });
        let moved = rehash::rehash(
            &mut self.buckets,
            &mut self.arena.chunks[..],
            capacity,
            strategy,
        )?;
        debug_assert_eq!(moved, self.populated, "rehash lost track of entries");
        tracing::debug!(
            old_buckets = old,
            new_buckets = capacity,
            ?strategy,
            moved,
            "rehashed buckets"
        );
        self.touch();
        Ok(())
    }

    /// Rebuilds the bucket array with at least `buckets` buckets, and never
    /// fewer than the population needs at the configured load factor.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chunk_dict::hash_table::HashTable;
    /// #
    /// let mut table: HashTable<u32> = HashTable::new();
    /// table.rehash(100);
    /// assert_eq!(table.bucket_count(), 128);
    /// ```
    pub fn rehash(&mut self, buckets: usize) {
        infallible(self.try_rehash(buckets))
    }

    /// Fallible version of [`rehash`](Self::rehash).
    pub fn try_rehash(&mut self, buckets: usize) -> Result<(), TryReserveError> {
        let floor = self.config.buckets_for(self.populated);
        let capacity = BucketTable::normalize(buckets.max(floor));
        self.try_rehash_to(capacity, None)
    }

    /// Reserves room for at least `additional` more elements without
    /// allocating again.
    pub fn reserve(&mut self, additional: usize) {
        infallible(self.try_reserve(additional))
    }

    /// Fallible version of [`reserve`](Self::reserve).
    ///
    /// Chunks covering the shortfall are allocated up front and the bucket
    /// array is grown for the new entry capacity.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        let spare = self.arena.spare();
        if additional <= spare {
            return Ok(());
        }
        let needed = additional - spare;
        if needed > isize::MAX as usize / size_of::<Slot<V>>().max(1) {
            return Err(TryReserveError::CapacityOverflow);
        }

        let chunks = self.arena.try_prepare_chunks(needed)?;
        let total = chunks
            .iter()
            .map(Chunk::capacity)
            .fold(self.arena.capacity(), usize::saturating_add);
        self.try_grow_buckets_for(total)?;

        for chunk in chunks {
            self.arena.seal_tail();
            self.arena.push_chunk(chunk);
        }
        self.touch();
        Ok(())
    }

    /// Releases as much memory as possible.
    ///
    /// Live entries are consolidated into a single chunk (or right-sized
    /// fresh chunks), erased payloads in released chunks are dropped, and
    /// the bucket array shrinks to fit the remaining entry capacity.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chunk_dict::hash_table::HashTable;
    /// #
    /// let mut table = HashTable::new();
    /// for i in 0..1000u32 {
    ///     table.insert(i, i, |&v| v == i);
    /// }
    /// for i in 0..990u32 {
    ///     table.erase(i, |&v| v == i);
    /// }
    /// let before = table.capacity();
    ///
    /// table.shrink_to_fit();
    /// assert!(table.capacity() < before);
    /// assert_eq!(table.chunk_count(), 1);
    /// assert_eq!(table.len(), 10);
    /// ```
    pub fn shrink_to_fit(&mut self) {
        infallible(self.try_shrink_to_fit())
    }

    /// Fallible version of [`shrink_to_fit`](Self::shrink_to_fit).
    pub fn try_shrink_to_fit(&mut self) -> Result<(), TryReserveError> {
        compact::compact(
            &mut self.buckets,
            &mut self.arena,
            self.populated,
            Goal::Shrink,
        )?;
        self.touch();

        // The compaction above has already committed; a bucket array that
        // cannot be shrunk is still a valid, merely oversized, index.
        let wanted = BucketTable::normalize(self.config.buckets_for(self.arena.capacity()));
        if wanted < self.buckets.len()
            && let Err(error) = self.try_rehash_to(wanted, Some(RehashStrategy::Partition))
        {
            tracing::debug!(
                %error,
                buckets = self.buckets.len(),
                wanted,
                "keeping oversized bucket array"
            );
        }
        Ok(())
    }

    /// Consolidates live entries into the smallest chunk that holds them
    /// all and releases the rest. The bucket array is left alone and a lone
    /// chunk is never reallocated.
    pub fn rearrange(&mut self) {
        infallible(self.try_rearrange())
    }

    /// Fallible version of [`rearrange`](Self::rearrange).
    pub fn try_rearrange(&mut self) -> Result<(), TryReserveError> {
        compact::compact(
            &mut self.buckets,
            &mut self.arena,
            self.populated,
            Goal::Rearrange,
        )?;
        self.touch();
        Ok(())
    }

    /// Removes all elements and releases every chunk. The bucket array keeps
    /// its size.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.arena.release_all();
        self.populated = 0;
        self.touch();
    }

    /// Iterates in bucket order, then chain order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chunk_dict::hash_table::HashTable;
    /// #
    /// let mut table = HashTable::new();
    /// table.insert(3, 'c', |&c| c == 'c');
    /// table.insert(1, 'a', |&c| c == 'a');
    /// table.insert(2, 'b', |&c| c == 'b');
    ///
    /// let values: String = table.iter().collect();
    /// assert_eq!(values, "abc");
    /// ```
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            table: self,
            bucket: 0,
            cur: None,
            remaining: self.populated,
        }
    }

    /// Iterates mutably over the values in storage order.
    pub fn iter_mut(&mut self) -> IterMut<'_, V> {
        IterMut {
            chunks: self.arena.chunks.iter_mut(),
            entries: Default::default(),
            remaining: self.populated,
        }
    }

    /// Keeps only the values for which `f` returns `true`. Rejected values
    /// are dropped immediately.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use chunk_dict::hash_table::HashTable;
    /// #
    /// let mut table = HashTable::new();
    /// for i in 0..10u32 {
    ///     table.insert(i, i, |&v| v == i);
    /// }
    /// table.retain(|v| *v % 3 == 0);
    /// assert_eq!(table.len(), 4);
    /// ```
    pub fn retain(&mut self, mut f: impl FnMut(&mut V) -> bool) {
        let mut removed = false;
        for index in 0..self.buckets.len() {
            let mut prev = None;
            let mut cur = self.buckets.head(index);
            while let Some(at) = cur {
                let entry = self.arena.slot_mut(at);
                cur = entry.next();
                if f(entry.value_mut()) {
                    prev = Some(at);
                    continue;
                }
                self.buckets
                    .unlink(&mut self.arena.chunks[..], index, prev, at);
                self.populated -= 1;
                drop(self.arena.take(at));
                removed = true;
            }
        }
        if removed {
            self.touch();
            self.after_release();
        }
    }

    /// Removes and yields every value in bucket order. The chunks stay
    /// allocated, with every slot back on the free list.
    pub fn drain(&mut self) -> Drain<'_, V> {
        self.touch();
        Drain {
            table: self,
            bucket: 0,
        }
    }

    /// Collects chain and arena statistics.
    #[cfg(any(test, feature = "stats"))]
    pub fn debug_stats(&self) -> DebugStats {
        let mut longest_chain = 0;
        for index in 0..self.buckets.len() {
            let mut length = 0;
            let mut cur = self.buckets.head(index);
            while let Some(at) = cur {
                length += 1;
                cur = self.arena.chunks[..].next(at);
            }
            longest_chain = longest_chain.max(length);
        }

        DebugStats {
            populated: self.populated,
            bucket_count: self.buckets.len(),
            occupied_buckets: self.buckets.occupied(),
            longest_chain,
            chunk_count: self.arena.chunks.len(),
            entry_capacity: self.arena.capacity(),
            allocated_slots: self.arena.allocated(),
            free_slots: self.arena.free.len(),
            load_factor: self.populated as f64 / self.buckets.len() as f64,
            chunk_bytes: self.arena.chunks.iter().map(Chunk::bytes).sum(),
            bucket_bytes: self.buckets.len() * size_of::<Option<EntryRef>>(),
        }
    }

    /// Checks every structural invariant of the table.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut chained = 0;
        for index in 0..self.buckets.len() {
            let mut cur = self.buckets.head(index);
            while let Some(at) = cur {
                let entry = self.arena.slot(at);
                assert_eq!(entry.state(), EntryState::InUse, "chain reaches {at:?}");
                assert_eq!(self.buckets.index_for(entry.hash()), index);
                chained += 1;
                cur = entry.next();
            }
        }
        assert_eq!(chained, self.populated, "chains disagree with len");

        let mut freed = 0;
        let mut cur = self.arena.free.head();
        while let Some(at) = cur {
            let entry = self.arena.slot(at);
            assert!(
                matches!(entry.state(), EntryState::Free | EntryState::Reusable),
                "free list reaches {at:?} in state {:?}",
                entry.state()
            );
            freed += 1;
            cur = entry.next();
        }
        assert_eq!(freed, self.arena.free.len(), "free list count drifted");
        assert_eq!(self.arena.allocated() - self.arena.free.len(), self.populated);

        let mut live = 0;
        for (index, chunk) in self.arena.chunks.iter().enumerate() {
            assert_eq!(chunk.id().index(), index, "chunk ids are dense");
            for entry in &chunk.entries {
                assert_eq!(entry.chunk(), chunk.id());
                assert_ne!(entry.state(), EntryState::Redirect);
            }
            live += chunk.live;
        }
        assert_eq!(live, self.populated);
    }
}

/// Walks the chain for `hash`, returning the matching entry and its
/// predecessor.
fn search_chain<V>(
    buckets: &BucketTable,
    arena: &Arena<V>,
    hash: u32,
    eq: impl Fn(&V) -> bool,
) -> Option<(Option<EntryRef>, EntryRef)> {
    let mut prev = None;
    let mut cur = buckets.head(buckets.index_for(hash));
    while let Some(at) = cur {
        let entry = arena.slot(at);
        if entry.hash() == hash && eq(entry.value()) {
            return Some((prev, at));
        }
        prev = Some(at);
        cur = entry.next();
    }
    None
}

/// A slot acquired for `emplace` but not yet linked. Dropping it hands the
/// slot back to the free list, dropping any payload constructed in it, so a
/// panic in the caller's closures leaves the table consistent.
struct Provisional<'a, V> {
    arena: &'a mut Arena<V>,
    at: EntryRef,
}

impl<V> Drop for Provisional<'_, V> {
    fn drop(&mut self) {
        if self.arena.slot(self.at).state() == EntryState::InUse {
            drop(self.arena.take(self.at));
        } else {
            self.arena.free.push_front(&mut self.arena.chunks[..], self.at);
        }
    }
}

/// A view into a single entry in a table, which may either be vacant or
/// occupied.
///
/// This enum is constructed from the [`entry`] method on [`HashTable`].
///
/// [`entry`]: HashTable::entry
///
/// # Examples
///
/// ```rust
/// # use chunk_dict::hash_table::Entry;
/// # use chunk_dict::hash_table::HashTable;
/// #
/// let mut table = HashTable::new();
/// *table.entry(9, |v: &(u8, u32)| v.0 == 9).or_insert((9, 0)) = (9, 1);
///
/// match table.entry(9, |v: &(u8, u32)| v.0 == 9) {
///     Entry::Occupied(entry) => assert_eq!(entry.get().1, 1),
///     Entry::Vacant(_) => unreachable!(),
/// }
/// ```
pub enum Entry<'a, V> {
    /// The value is not present in the table.
    Vacant(VacantEntry<'a, V>),
    /// The value is present in the table.
    Occupied(OccupiedEntry<'a, V>),
}

impl<'a, V> Entry<'a, V> {
    /// Inserts `default` if the entry is vacant and returns a mutable
    /// reference to the value in the entry.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Inserts the result of `default` if the entry is vacant.
    pub fn or_insert_with(self, default: impl FnOnce() -> V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Runs `f` on an occupied entry's value.
    pub fn and_modify(self, f: impl FnOnce(&mut V)) -> Self {
        match self {
            Entry::Occupied(mut entry) => {
                f(entry.get_mut());
                Entry::Occupied(entry)
            }
            Entry::Vacant(entry) => Entry::Vacant(entry),
        }
    }
}

impl<'a, V> Entry<'a, V>
where
    V: Default,
{
    /// Inserts `V::default()` if the entry is vacant.
    pub fn or_default(self) -> &'a mut V {
        self.or_insert_with(Default::default)
    }
}

/// A view into a vacant entry in the table.
///
/// The slot is only acquired once a value is inserted, so dropping a
/// vacant entry leaves the table untouched.
pub struct VacantEntry<'a, V> {
    table: &'a mut HashTable<V>,
    hash: u32,
}

impl<'a, V> VacantEntry<'a, V> {
    /// The hash the value will be filed under.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Inserts `value` and returns a mutable reference to it.
    pub fn insert(self, value: V) -> &'a mut V {
        infallible(self.try_insert(value))
    }

    /// Fallible version of [`insert`](Self::insert).
    pub fn try_insert(self, value: V) -> Result<&'a mut V, TryReserveError> {
        let at = self.table.try_link_new(self.hash, value)?;
        Ok(self.table.arena.slot_mut(at).value_mut())
    }
}

/// A view into an occupied entry in the table.
pub struct OccupiedEntry<'a, V> {
    table: &'a mut HashTable<V>,
    hash: u32,
    prev: Option<EntryRef>,
    at: EntryRef,
}

impl<'a, V> OccupiedEntry<'a, V> {
    /// Handle to the entry's slot.
    pub fn entry_ref(&self) -> EntryRef {
        self.at
    }

    /// Gets a reference to the value in the entry.
    pub fn get(&self) -> &V {
        self.table.arena.slot(self.at).value()
    }

    /// Gets a mutable reference to the value in the entry.
    pub fn get_mut(&mut self) -> &mut V {
        self.table.arena.slot_mut(self.at).value_mut()
    }

    /// Converts the entry into a mutable reference with the table's
    /// lifetime.
    pub fn into_mut(self) -> &'a mut V {
        self.table.arena.slot_mut(self.at).value_mut()
    }

    /// Removes the entry and returns its value.
    pub fn remove(self) -> V {
        self.table.unlink(self.hash, self.prev, self.at);
        let value = self.table.arena.take(self.at);
        self.table.after_release();
        value
    }
}

/// An iterator over the values in a [`HashTable`], in bucket order.
///
/// This struct is created by the [`iter`] method on [`HashTable`].
///
/// [`iter`]: HashTable::iter
pub struct Iter<'a, V> {
    table: &'a HashTable<V>,
    bucket: usize,
    cur: Option<EntryRef>,
    remaining: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(at) = self.cur {
                let entry = self.table.arena.slot(at);
                self.cur = entry.next();
                self.remaining -= 1;
                return Some(entry.value());
            }
            if self.remaining == 0 || self.bucket >= self.table.buckets.len() {
                return None;
            }
            self.cur = self.table.buckets.head(self.bucket);
            self.bucket += 1;
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<V> ExactSizeIterator for Iter<'_, V> {}

impl<V> FusedIterator for Iter<'_, V> {}

impl<V> Clone for Iter<'_, V> {
    fn clone(&self) -> Self {
        Iter {
            table: self.table,
            bucket: self.bucket,
            cur: self.cur,
            remaining: self.remaining,
        }
    }
}

/// A mutable iterator over the values in a [`HashTable`], in storage order.
///
/// This struct is created by the [`iter_mut`] method on [`HashTable`].
///
/// [`iter_mut`]: HashTable::iter_mut
pub struct IterMut<'a, V> {
    chunks: core::slice::IterMut<'a, Chunk<V>>,
    entries: core::slice::IterMut<'a, Slot<V>>,
    remaining: usize,
}

impl<'a, V> Iterator for IterMut<'a, V> {
    type Item = &'a mut V;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for entry in self.entries.by_ref() {
                if entry.is_live() {
                    self.remaining -= 1;
                    return Some(entry.value_mut());
                }
            }
            if self.remaining == 0 {
                return None;
            }
            self.entries = self.chunks.next()?.entries.iter_mut();
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<V> ExactSizeIterator for IterMut<'_, V> {}

impl<V> FusedIterator for IterMut<'_, V> {}

/// A draining iterator over the values in a [`HashTable`].
///
/// This struct is created by the [`drain`] method on [`HashTable`]. Values
/// left when it is dropped are dropped with it.
///
/// [`drain`]: HashTable::drain
pub struct Drain<'a, V> {
    table: &'a mut HashTable<V>,
    bucket: usize,
}

impl<V> Drop for Drain<'_, V> {
    fn drop(&mut self) {
        for _ in &mut *self {}
    }
}

impl<V> Iterator for Drain<'_, V> {
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        let table = &mut *self.table;
        while table.populated > 0 && self.bucket < table.buckets.len() {
            let Some(at) = table.buckets.head(self.bucket) else {
                self.bucket += 1;
                continue;
            };
            let next = table.arena.slot(at).next();
            table.buckets.set_head(self.bucket, next);
            table.populated -= 1;
            return Some(table.arena.take(at));
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.table.populated, Some(self.table.populated))
    }
}

impl<V> ExactSizeIterator for Drain<'_, V> {}

impl<V> FusedIterator for Drain<'_, V> {}

/// An owning iterator over the values of a [`HashTable`], in bucket order.
pub struct IntoIter<V> {
    table: HashTable<V>,
    bucket: usize,
}

impl<V> Iterator for IntoIter<V> {
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        let table = &mut self.table;
        while table.populated > 0 && self.bucket < table.buckets.len() {
            let Some(at) = table.buckets.head(self.bucket) else {
                self.bucket += 1;
                continue;
            };
            let next = table.arena.slot(at).next();
            table.buckets.set_head(self.bucket, next);
            table.populated -= 1;
            return Some(table.arena.take(at));
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.table.populated, Some(self.table.populated))
    }
}

impl<V> ExactSizeIterator for IntoIter<V> {}

impl<V> FusedIterator for IntoIter<V> {}

impl<V> IntoIterator for HashTable<V> {
    type IntoIter = IntoIter<V>;
    type Item = V;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            table: self,
            bucket: 0,
        }
    }
}

impl<'a, V> IntoIterator for &'a HashTable<V> {
    type IntoIter = Iter<'a, V>;
    type Item = &'a V;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::hash::Hasher;

    use rand::Rng;
    use rand::SeedableRng;
    use rand::TryRngCore;
    use rand::rngs::OsRng;
    use rand::rngs::SmallRng;
    use siphasher::sip::SipHasher;

    use super::*;
    use crate::hashers::fold_hash;

    struct HashState {
        k0: u64,
        k1: u64,
    }

    impl HashState {
        fn default() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }

        fn build_hasher(&self) -> SipHasher {
            SipHasher::new_with_keys(self.k0, self.k1)
        }
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Item {
        key: u64,
        value: i32,
    }

    fn hash_key(state: &HashState, key: u64) -> u32 {
        let mut h = state.build_hasher();
        h.write_u64(key);
        fold_hash(h.finish())
    }

    fn hash_str(state: &HashState, key: &str) -> u32 {
        let mut h = state.build_hasher();
        h.write(key.as_bytes());
        fold_hash(h.finish())
    }

    fn item(key: u64) -> Item {
        Item {
            key,
            value: key as i32 * 2,
        }
    }

    fn fill(table: &mut HashTable<Item>, state: &HashState, keys: impl Iterator<Item = u64>) {
        for k in keys {
            assert!(table.insert_if_absent(hash_key(state, k), item(k), |v| v.key == k));
        }
    }

    #[test]
    fn insert_and_find() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..200u64 {
            let hash = hash_key(&state, k);
            match table.entry(hash, |v: &Item| v.key == k) {
                Entry::Vacant(v) => {
                    v.insert(item(k));
                }
                Entry::Occupied(_) => panic!("duplicate key {k}"),
            }
            assert_eq!(table.get(hash, |v| v.key == k), Some(&item(k)), "{table:#?}");
        }
        assert_eq!(table.len(), 200);
        for k in 0..200u64 {
            let at = table.find(hash_key(&state, k), |v| v.key == k).unwrap();
            assert_eq!(table.get_by_ref(at), Some(&item(k)));
        }
        table.assert_invariants();
    }

    #[test]
    fn insert_overwrites_and_if_absent_keeps() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        let hash = hash_key(&state, 5);

        assert_eq!(table.insert(hash, item(5), |v| v.key == 5), None);
        let replaced = table.insert(hash, Item { key: 5, value: -1 }, |v| v.key == 5);
        assert_eq!(replaced, Some(item(5)));
        assert!(!table.insert_if_absent(hash, item(5), |v| v.key == 5));
        assert_eq!(table.get(hash, |v| v.key == 5).unwrap().value, -1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn colliding_hashes_share_a_chain() {
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..20u64 {
            table.insert(0xdead_beef, item(k), |v| v.key == k);
        }
        assert_eq!(table.len(), 20);
        assert_eq!(table.debug_stats().longest_chain, 20);
        for k in 0..20u64 {
            assert_eq!(table.get(0xdead_beef, |v| v.key == k), Some(&item(k)));
        }
        assert!(table.erase(0xdead_beef, |v| v.key == 10));
        assert_eq!(table.get(0xdead_beef, |v| v.key == 10), None);
        assert_eq!(table.get(0xdead_beef, |v| v.key == 11), Some(&item(11)));
        table.assert_invariants();
    }

    #[test]
    fn erase_then_insert_reuses_slots() {
        let state = HashState::default();
        let mut table: HashTable<Item> =
            HashTable::with_config(Config::new().initial_capacity(64).auto_shrink(false));
        fill(&mut table, &state, 0..64);
        assert_eq!(table.chunk_count(), 1);
        let allocated = table.debug_stats().allocated_slots;

        for k in 0..32u64 {
            assert!(table.erase(hash_key(&state, k), |v| v.key == k));
        }
        assert_eq!(table.debug_stats().free_slots, 32);
        fill(&mut table, &state, 100..132);

        let stats = table.debug_stats();
        assert_eq!(stats.chunk_count, 1, "reuse must not append a chunk");
        assert_eq!(stats.allocated_slots, allocated);
        assert_eq!(stats.free_slots, 0);
        table.assert_invariants();
    }

    #[test]
    fn erase_defers_drop_and_remove_returns_value() {
        let tracker = Rc::new(());
        let mut table: HashTable<(u32, Rc<()>)> =
            HashTable::with_config(Config::new().auto_shrink(false));
        for k in 0..4u32 {
            table.insert(k, (k, tracker.clone()), |v| v.0 == k);
        }
        assert_eq!(Rc::strong_count(&tracker), 5);

        assert!(table.erase(1, |v| v.0 == 1));
        assert_eq!(Rc::strong_count(&tracker), 5, "erase is lazy");

        let (_, removed) = table.remove(2, |v| v.0 == 2).unwrap();
        drop(removed);
        assert_eq!(Rc::strong_count(&tracker), 4);

        // Reusing the erased slot finally drops its payload.
        table.insert(9, (9, Rc::new(())), |v| v.0 == 9);
        table.insert(8, (8, Rc::new(())), |v| v.0 == 8);
        assert_eq!(Rc::strong_count(&tracker), 3);

        drop(table);
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn emplace_constructs_once_and_discards_on_collision() {
        let mut table: HashTable<(u32, String)> = HashTable::new();
        let hash = |v: &(u32, String)| v.0.wrapping_mul(0x9E37_79B9);
        let same = |a: &(u32, String), b: &(u32, String)| a.0 == b.0;

        let mut built = 0;
        let (value, inserted) = table.emplace(
            || {
                built += 1;
                (1, "one".to_string())
            },
            hash,
            same,
        );
        assert!(inserted);
        value.1.push('!');

        let (value, inserted) = table.emplace(
            || {
                built += 1;
                (1, "uno".to_string())
            },
            hash,
            same,
        );
        assert!(!inserted);
        assert_eq!(value.1, "one!");
        assert_eq!(built, 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.debug_stats().free_slots, 1, "provisional slot is recycled");
        table.assert_invariants();

        let (_, inserted) = table.emplace(|| (2, "two".to_string()), hash, same);
        assert!(inserted);
        assert_eq!(table.debug_stats().free_slots, 0);
    }

    #[test]
    fn scenario_a_rehash_keeps_survivors() {
        let state = HashState::default();
        let mut table: HashTable<(String, i32)> =
            HashTable::with_config(Config::new().initial_capacity(8));
        for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
            table.insert(hash_str(&state, key), (key.to_string(), value), |v| {
                v.0 == key
            });
        }
        assert_eq!(table.len(), 3);
        assert_eq!(table.bucket_count(), 8);

        assert!(table.erase(hash_str(&state, "b"), |v| v.0 == "b"));
        table.rehash(32);
        assert_eq!(table.bucket_count(), 32);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(hash_str(&state, "a"), |v| v.0 == "a").unwrap().1, 1);
        assert_eq!(table.get(hash_str(&state, "c"), |v| v.0 == "c").unwrap().1, 3);
        assert_eq!(table.get(hash_str(&state, "b"), |v| v.0 == "b"), None);
        table.assert_invariants();
    }

    #[test]
    fn scenario_b_shrink_after_erasing_half() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        fill(&mut table, &state, 0..1000);
        let before = table.capacity();
        let buckets_before = table.bucket_count();

        for k in (1..1000u64).step_by(2) {
            assert!(table.erase(hash_key(&state, k), |v| v.key == k));
        }
        assert_eq!(table.len(), 500);

        table.shrink_to_fit();
        assert_eq!(table.len(), 500);
        assert!(table.capacity() < before, "{} >= {before}", table.capacity());
        assert!(table.bucket_count() < buckets_before);
        assert_eq!(table.chunk_count(), 1);
        for k in 0..1000u64 {
            let found = table.get(hash_key(&state, k), |v| v.key == k);
            if k % 2 == 0 {
                assert_eq!(found, Some(&item(k)));
            } else {
                assert_eq!(found, None);
            }
        }
        table.assert_invariants();
    }

    #[test]
    fn growth_keeps_load_factor() {
        let state = HashState::default();
        let mut table: HashTable<Item> =
            HashTable::with_config(Config::new().max_load_factor(2.0));
        fill(&mut table, &state, 0..5000);
        let stats = table.debug_stats();
        assert!(stats.load_factor <= 2.0, "{stats:?}");
        assert!(table.bucket_count() * 2 >= table.capacity());
        table.assert_invariants();
    }

    #[test]
    fn chunks_are_capped_by_byte_budget() {
        let state = HashState::default();
        let budget = 64 * size_of::<Slot<Item>>();
        let mut table: HashTable<Item> =
            HashTable::with_config(Config::new().max_chunk_bytes(budget));
        fill(&mut table, &state, 0..1000);
        assert!(table.arena.chunks.iter().all(|c| c.capacity() <= 64));
        assert!(table.chunk_count() >= 1000 / 64);
        table.assert_invariants();
    }

    #[test]
    fn rehash_invariance_across_strategies() {
        let state = HashState::default();
        let mut table: HashTable<Item> =
            HashTable::with_config(Config::new().max_load_factor(16.0));
        fill(&mut table, &state, 0..600);

        // Doubling, scatter and partition, growing and shrinking.
        for buckets in [64, 128, 1024, 512, 64, 8, 4096] {
            table.rehash(buckets);
            table.assert_invariants();
            for k in 0..600u64 {
                assert_eq!(
                    table.get(hash_key(&state, k), |v| v.key == k),
                    Some(&item(k)),
                    "lost {k} at {buckets} buckets"
                );
            }
        }
        assert_eq!(table.bucket_count(), 4096);

        // The population floor wins over a smaller request.
        let mut dense: HashTable<Item> = HashTable::new();
        fill(&mut dense, &state, 0..600);
        dense.rehash(8);
        assert!(dense.bucket_count() >= 600);
    }

    #[test]
    fn rearrange_consolidates_into_one_chunk() {
        let state = HashState::default();
        let mut table: HashTable<Item> =
            HashTable::with_config(Config::new().auto_shrink(false));
        fill(&mut table, &state, 0..100);
        assert!(table.chunk_count() > 1);

        for k in 20..100u64 {
            table.erase(hash_key(&state, k), |v| v.key == k);
        }
        let buckets = table.bucket_count();
        let version = table.version();
        table.rearrange();

        assert_eq!(table.chunk_count(), 1);
        assert_eq!(table.bucket_count(), buckets, "rearrange leaves buckets alone");
        assert!(table.version() > version);
        assert_eq!(table.len(), 20);
        for k in 0..20u64 {
            assert_eq!(table.get(hash_key(&state, k), |v| v.key == k), Some(&item(k)));
        }
        table.assert_invariants();

        // A lone chunk is left as is.
        let capacity = table.capacity();
        table.rearrange();
        assert_eq!(table.capacity(), capacity);
    }

    #[test]
    fn auto_shrink_runs_below_low_water_mark() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        fill(&mut table, &state, 0..512);
        assert!(table.chunk_count() > 1);

        for k in 0..500u64 {
            table.erase(hash_key(&state, k), |v| v.key == k);
            table.assert_invariants();
        }
        assert_eq!(table.len(), 12);
        assert_eq!(table.chunk_count(), 1);
        for k in 500..512u64 {
            assert_eq!(table.get(hash_key(&state, k), |v| v.key == k), Some(&item(k)));
        }
    }

    #[test]
    fn empty_tail_chunk_is_released_on_erase() {
        let mut table: HashTable<u64> =
            HashTable::with_config(Config::new().auto_shrink(false));
        for k in 0..9u64 {
            table.insert(k as u32, k, |&v| v == k);
        }
        assert_eq!(table.chunk_count(), 2);
        assert!(table.erase(8, |&v| v == 8));
        assert_eq!(table.chunk_count(), 1);
        table.assert_invariants();
    }

    #[test]
    fn shrink_to_fit_on_empty_table_releases_everything() {
        let state = HashState::default();
        let mut table: HashTable<Item> =
            HashTable::with_config(Config::new().auto_shrink(false));
        fill(&mut table, &state, 0..300);
        for k in 0..300u64 {
            table.erase(hash_key(&state, k), |v| v.key == k);
        }
        table.shrink_to_fit();
        assert_eq!(table.chunk_count(), 0);
        assert_eq!(table.capacity(), 0);
        assert_eq!(table.bucket_count(), 8);
        table.assert_invariants();

        fill(&mut table, &state, 0..10);
        assert_eq!(table.len(), 10);
        table.assert_invariants();
    }

    #[test]
    fn reserve_avoids_further_allocation() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        fill(&mut table, &state, 0..3);
        table.reserve(1000);
        let chunks = table.chunk_count();
        let buckets = table.bucket_count();
        assert!(table.capacity() >= 1003);

        fill(&mut table, &state, 3..1003);
        assert_eq!(table.chunk_count(), chunks);
        assert_eq!(table.bucket_count(), buckets);
        table.assert_invariants();

        assert_eq!(
            table.try_reserve(usize::MAX),
            Err(TryReserveError::CapacityOverflow)
        );
    }

    #[test]
    fn clear_releases_chunks_and_keeps_buckets() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        fill(&mut table, &state, 0..100);
        let buckets = table.bucket_count();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.chunk_count(), 0);
        assert_eq!(table.bucket_count(), buckets);
        assert_eq!(table.iter().count(), 0);
        fill(&mut table, &state, 0..10);
        table.assert_invariants();
    }

    #[test]
    fn iteration_follows_buckets_then_chains() {
        let mut table: HashTable<u32> = HashTable::with_capacity(8);
        // Buckets 1, 1, 3 and 0 of 8; chains are pushed to the front.
        for (hash, value) in [(1u32, 10u32), (9, 11), (3, 30), (0, 0)] {
            table.insert(hash, value, |&v| v == value);
        }
        let order: Vec<u32> = table.iter().copied().collect();
        assert_eq!(order, vec![0, 11, 10, 30]);
        assert_eq!(table.iter().len(), 4);

        for value in table.iter_mut() {
            *value += 1;
        }
        let mut bumped: Vec<u32> = table.iter().copied().collect();
        bumped.sort();
        assert_eq!(bumped, vec![1, 11, 12, 31]);
    }

    #[test]
    fn drain_empties_table_in_bucket_order() {
        let mut table: HashTable<u32> = HashTable::with_capacity(8);
        for (hash, value) in [(2u32, 2u32), (1, 1), (5, 5)] {
            table.insert(hash, value, |&v| v == value);
        }
        let drained: Vec<u32> = table.drain().collect();
        assert_eq!(drained, vec![1, 2, 5]);
        assert!(table.is_empty());
        assert_eq!(table.debug_stats().free_slots, 3);
        table.assert_invariants();

        table.insert(4, 4, |&v| v == 4);
        {
            let mut drain = table.drain();
            assert_eq!(drain.len(), 1);
            drain.next();
        }
        assert!(table.is_empty());
    }

    #[test]
    fn dropping_partial_drain_drops_rest() {
        let tracker = Rc::new(());
        let mut table: HashTable<(u32, Rc<()>)> = HashTable::new();
        for k in 0..10u32 {
            table.insert(k, (k, tracker.clone()), |v| v.0 == k);
        }
        {
            let mut drain = table.drain();
            drain.next();
        }
        assert!(table.is_empty());
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn retain_and_into_iter() {
        let tracker = Rc::new(());
        let mut table: HashTable<(u32, Rc<()>)> = HashTable::new();
        for k in 0..50u32 {
            table.insert(k, (k, tracker.clone()), |v| v.0 == k);
        }
        table.retain(|v| v.0 % 5 == 0);
        assert_eq!(table.len(), 10);
        assert_eq!(Rc::strong_count(&tracker), 11, "retain drops eagerly");
        table.assert_invariants();

        let mut keys: Vec<u32> = table.into_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec![0, 5, 10, 15, 20, 25, 30, 35, 40, 45]);
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn occupied_entry_remove_and_modify() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        fill(&mut table, &state, 0..10);

        let hash = hash_key(&state, 4);
        table
            .entry(hash, |v| v.key == 4)
            .and_modify(|v| v.value = 99)
            .or_insert(item(4));
        assert_eq!(table.get(hash, |v| v.key == 4).unwrap().value, 99);

        match table.entry(hash, |v| v.key == 4) {
            Entry::Occupied(entry) => {
                assert_eq!(entry.remove().value, 99);
            }
            Entry::Vacant(_) => unreachable!(),
        }
        assert_eq!(table.len(), 9);
        assert!(matches!(table.entry(hash, |v| v.key == 4), Entry::Vacant(_)));
        table.assert_invariants();
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut table: HashTable<u64> =
            HashTable::with_config(Config::new().auto_shrink(false));
        table.insert(1, 1, |&v| v == 1);
        let at = table.find(1, |&v| v == 1).unwrap();
        *table.get_by_ref_mut(at).unwrap() = 1;
        assert!(table.erase(1, |&v| v == 1));
        assert_eq!(table.get_by_ref(at), None);
        table.clear();
        assert_eq!(table.get_by_ref(at), None);
    }

    #[test]
    fn version_tracks_mutations() {
        let mut table: HashTable<u64> = HashTable::new();
        let v0 = table.version();
        table.insert(1, 1, |&v| v == 1);
        let v1 = table.version();
        assert!(v1 > v0);
        assert_eq!(table.get(1, |&v| v == 1), Some(&1));
        assert_eq!(table.version(), v1, "lookups do not bump the version");
        table.erase(1, |&v| v == 1);
        assert!(table.version() > v1);
    }

    #[test]
    fn clone_is_deep_and_independent() {
        let state = HashState::default();
        let mut table: HashTable<Item> =
            HashTable::with_config(Config::new().auto_shrink(false));
        fill(&mut table, &state, 0..300);
        for k in (0..300u64).step_by(3) {
            table.erase(hash_key(&state, k), |v| v.key == k);
        }

        let copy = table.clone();
        copy.assert_invariants();
        assert_eq!(copy.len(), table.len());
        assert_eq!(copy.bucket_count(), table.bucket_count());
        let mut left: Vec<&Item> = table.iter().collect();
        let mut right: Vec<&Item> = copy.iter().collect();
        left.sort_by_key(|v| v.key);
        right.sort_by_key(|v| v.key);
        assert_eq!(left, right);

        table.clear();
        assert_eq!(copy.len(), 200);
    }

    #[test]
    fn clone_keeps_long_chains_in_order() {
        let mut table: HashTable<u32> =
            HashTable::with_config(Config::new().auto_shrink(false));
        for v in 0..2000u32 {
            table.insert(v % 4, v, |&x| x == v);
        }
        assert_eq!(table.debug_stats().longest_chain, 500);

        let copy = table.clone();
        copy.assert_invariants();
        assert_eq!(copy.bucket_count(), table.bucket_count());
        assert!(copy.iter().eq(table.iter()), "chains are copied in order");
    }

    #[test]
    fn reserved_chunk_survives_erase() {
        let state = HashState::default();
        let mut table: HashTable<Item> =
            HashTable::with_config(Config::new().auto_shrink(false));
        fill(&mut table, &state, 0..3);
        table.reserve(1000);
        let chunks = table.chunk_count();
        let capacity = table.capacity();
        assert_eq!(chunks, 2);

        assert!(table.erase(hash_key(&state, 1), |v| v.key == 1));
        assert_eq!(table.chunk_count(), chunks);
        assert_eq!(table.capacity(), capacity);
        table.assert_invariants();

        fill(&mut table, &state, 3..1003);
        assert_eq!(table.chunk_count(), chunks);
        table.assert_invariants();
    }

    #[cfg(feature = "std")]
    #[test]
    fn panicking_emplace_leaves_table_consistent() {
        use std::panic::AssertUnwindSafe;
        use std::panic::catch_unwind;

        let mut table: HashTable<u32> = HashTable::new();
        for v in 0..5u32 {
            table.insert(v, v, |&x| x == v);
        }
        let allocated = table.debug_stats().allocated_slots;

        let built = catch_unwind(AssertUnwindSafe(|| {
            table.emplace(|| -> u32 { panic!("construction failed") }, |&v| v, |a, b| a == b);
        }));
        assert!(built.is_err());
        table.assert_invariants();
        assert_eq!(table.len(), 5);

        let compared = catch_unwind(AssertUnwindSafe(|| {
            table.emplace(|| 3, |&v| v, |_, _| panic!("comparison failed"));
        }));
        assert!(compared.is_err());
        table.assert_invariants();
        assert_eq!(table.len(), 5);
        assert_eq!(table.debug_stats().allocated_slots, allocated + 1);

        for v in 5..100u32 {
            table.insert(v, v, |&x| x == v);
        }
        assert_eq!(table.len(), 100);
        table.assert_invariants();
    }

    #[test]
    fn try_shrink_to_fit_compacts_and_shrinks_buckets() {
        let state = HashState::default();
        let mut table: HashTable<Item> =
            HashTable::with_config(Config::new().auto_shrink(false));
        fill(&mut table, &state, 0..2000);
        for k in 16..2000u64 {
            table.erase(hash_key(&state, k), |v| v.key == k);
        }
        let buckets = table.bucket_count();

        assert_eq!(table.try_shrink_to_fit(), Ok(()));
        assert_eq!(table.chunk_count(), 1);
        assert!(table.bucket_count() < buckets);
        assert_eq!(table.len(), 16);
        for k in 0..16u64 {
            assert_eq!(table.get(hash_key(&state, k), |v| v.key == k), Some(&item(k)));
        }
        table.assert_invariants();
    }

    #[test]
    fn randomized_against_std_hashmap() {
        let state = HashState::default();
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut table: HashTable<Item> =
            HashTable::with_config(Config::new().max_chunk_bytes(256 * size_of::<Slot<Item>>()));
        let mut model = std::collections::HashMap::<u64, i32>::new();

        for step in 0..20_000u32 {
            let key = rng.random_range(0..2_000u64);
            let hash = hash_key(&state, key);
            match rng.random_range(0..10u32) {
                0..=3 => {
                    let value = rng.random::<i32>();
                    let old = table.insert(hash, Item { key, value }, |v| v.key == key);
                    assert_eq!(old.map(|v| v.value), model.insert(key, value));
                }
                4..=5 => {
                    assert_eq!(table.erase(hash, |v| v.key == key), model.remove(&key).is_some());
                }
                6 => {
                    assert_eq!(
                        table.remove(hash, |v| v.key == key).map(|v| v.value),
                        model.remove(&key)
                    );
                }
                7 => {
                    let (value, inserted) = table.emplace(
                        || Item { key, value: 7 },
                        |v| hash_key(&state, v.key),
                        |a, b| a.key == b.key,
                    );
                    assert_eq!(inserted, !model.contains_key(&key));
                    let expected = *model.entry(key).or_insert(7);
                    assert_eq!(value.value, expected);
                }
                8 => {
                    assert_eq!(
                        table.get(hash, |v| v.key == key).map(|v| v.value),
                        model.get(&key).copied()
                    );
                }
                _ => match step % 3 {
                    0 => table.shrink_to_fit(),
                    1 => table.rearrange(),
                    _ => table.rehash(rng.random_range(8..4096)),
                },
            }
            assert_eq!(table.len(), model.len());
            if step % 997 == 0 {
                table.assert_invariants();
            }
        }

        table.assert_invariants();
        for (key, value) in &model {
            let found = table.get(hash_key(&state, *key), |v| v.key == *key);
            assert_eq!(found.map(|v| v.value), Some(*value));
        }
    }
}
