use core::borrow::Borrow;
use core::fmt::Debug;
use core::hash::BuildHasher;
use core::hash::Hash;
use core::iter::FusedIterator;
use core::ops::Index;

use crate::DefaultHashBuilder;
use crate::config::Config;
use crate::entry::EntryRef;
use crate::error::TryReserveError;
use crate::hash_table::Entry as TableEntry;
use crate::hash_table::HashTable;
use crate::hashers::fold_hash;

/// A hash map backed by the chunked-arena [`HashTable`].
///
/// `HashMap<K, V, S>` stores key-value pairs where keys implement `Hash + Eq`
/// and uses a configurable hasher builder `S` to hash keys. The 64-bit hash
/// is folded to the 32 bits the table caches per entry.
///
/// Entry memory grows in chunks that are never reallocated, erased slots are
/// recycled through a free list, and [`shrink_to_fit`](Self::shrink_to_fit)
/// compacts live entries into as few chunks as possible.
///
/// # Examples
///
/// ```rust
/// use chunk_dict::HashMap;
///
/// let mut scores: HashMap<String, u32> = HashMap::new();
/// scores.insert("alice".to_string(), 10);
/// scores.insert("bob".to_string(), 7);
///
/// *scores.entry("bob".to_string()).or_insert(0) += 1;
/// assert_eq!(scores.get("bob"), Some(&8));
///
/// assert!(scores.erase("alice"));
/// assert_eq!(scores.len(), 1);
/// ```
#[derive(Clone)]
pub struct HashMap<K, V, S = DefaultHashBuilder> {
    table: HashTable<(K, V)>,
    hash_builder: S,
}

impl<K, V, S> Debug for HashMap<K, V, S>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.iter()
            .all(|(key, value)| other.get(key).is_some_and(|v| *value == *v))
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty map with the given hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use core::hash::BuildHasher;
    /// # use siphasher::sip::SipHasher;
    /// #
    /// # use chunk_dict::HashMap;
    /// #
    /// # struct SimpleHasher;
    /// # impl BuildHasher for SimpleHasher {
    /// #     type Hasher = SipHasher;
    /// #
    /// #     fn build_hasher(&self) -> Self::Hasher {
    /// #         SipHasher::new()
    /// #     }
    /// # }
    /// #
    /// let map: HashMap<i32, String, _> = HashMap::with_hasher(SimpleHasher);
    /// assert!(map.is_empty());
    /// ```
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_config_and_hasher(Config::new(), hash_builder)
    }

    /// Creates an empty map whose first chunk holds at least `capacity`
    /// entries.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self::with_config_and_hasher(Config::new().initial_capacity(capacity), hash_builder)
    }

    /// Creates an empty map from a full [`Config`].
    pub fn with_config_and_hasher(config: Config, hash_builder: S) -> Self {
        HashMap {
            table: HashTable::with_config(config),
            hash_builder,
        }
    }

    /// Returns a reference to the map's hasher builder.
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// The configuration the map was built with.
    pub fn config(&self) -> &Config {
        self.table.config()
    }

    /// Returns the number of elements in the map.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the map contains no elements.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Number of entry slots across all chunks, live or not.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chunk_dict::HashMap;
    ///
    /// let map: HashMap<i32, String> = HashMap::with_capacity(100);
    /// assert!(map.capacity() >= 100);
    /// ```
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    /// Number of chunks in the arena.
    pub fn chunk_count(&self) -> usize {
        self.table.chunk_count()
    }

    /// A counter bumped by every structural mutation.
    pub fn version(&self) -> u64 {
        self.table.version()
    }

    /// Removes all elements and releases every chunk.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Releases as much memory as possible: live entries are consolidated
    /// into a single chunk and the bucket array shrinks to fit.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chunk_dict::HashMap;
    ///
    /// let mut map: HashMap<u64, u64> = (0..1000).map(|i| (i, i)).collect();
    /// map.retain(|&k, _| k % 10 == 0);
    /// let before = map.capacity();
    ///
    /// map.shrink_to_fit();
    /// assert!(map.capacity() < before);
    /// assert_eq!(map.len(), 100);
    /// ```
    pub fn shrink_to_fit(&mut self) {
        self.table.shrink_to_fit();
    }

    /// Fallible version of [`shrink_to_fit`](Self::shrink_to_fit).
    pub fn try_shrink_to_fit(&mut self) -> Result<(), TryReserveError> {
        self.table.try_shrink_to_fit()
    }

    /// Consolidates live entries into the smallest chunk that holds them.
    pub fn rearrange(&mut self) {
        self.table.rearrange();
    }

    /// Fallible version of [`rearrange`](Self::rearrange).
    pub fn try_rearrange(&mut self) -> Result<(), TryReserveError> {
        self.table.try_rearrange()
    }

    /// Reserves room for at least `additional` more elements.
    pub fn reserve(&mut self, additional: usize) {
        self.table.reserve(additional);
    }

    /// Fallible version of [`reserve`](Self::reserve).
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        self.table.try_reserve(additional)
    }

    /// Rebuilds the bucket array with at least `buckets` buckets.
    pub fn rehash(&mut self, buckets: usize) {
        self.table.rehash(buckets);
    }

    /// Fallible version of [`rehash`](Self::rehash).
    pub fn try_rehash(&mut self, buckets: usize) -> Result<(), TryReserveError> {
        self.table.try_rehash(buckets)
    }

    /// Resolves a handle returned by [`find`](Self::find).
    pub fn get_by_ref(&self, at: EntryRef) -> Option<(&K, &V)> {
        self.table.get_by_ref(at).map(|(k, v)| (k, v))
    }

    /// Keeps only the pairs for which `f` returns `true`.
    pub fn retain(&mut self, mut f: impl FnMut(&K, &mut V) -> bool) {
        self.table.retain(|(k, v)| f(k, v));
    }

    /// Iterates in bucket order, then chain order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chunk_dict::HashMap;
    ///
    /// let map: HashMap<&str, i32> = [("a", 1), ("b", 2)].into_iter().collect();
    /// let mut pairs: Vec<_> = map.iter().collect();
    /// pairs.sort();
    /// assert_eq!(pairs, [(&"a", &1), (&"b", &2)]);
    /// ```
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            inner: self.table.iter(),
        }
    }

    /// Iterates with mutable values, in storage order.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        IterMut {
            inner: self.table.iter_mut(),
        }
    }

    /// Iterates over the keys.
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys { inner: self.iter() }
    }

    /// Iterates over the values.
    pub fn values(&self) -> Values<'_, K, V> {
        Values { inner: self.iter() }
    }

    /// Iterates over mutable values.
    pub fn values_mut(&mut self) -> ValuesMut<'_, K, V> {
        ValuesMut {
            inner: self.iter_mut(),
        }
    }

    /// Removes and yields every pair.
    pub fn drain(&mut self) -> Drain<'_, K, V> {
        Drain {
            inner: self.table.drain(),
        }
    }

    /// Arena and bucket statistics.
    #[cfg(any(test, feature = "stats"))]
    pub fn debug_stats(&self) -> crate::hash_table::DebugStats {
        self.table.debug_stats()
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    #[inline]
    fn make_hash<Q: Hash + ?Sized>(&self, key: &Q) -> u32 {
        fold_hash(self.hash_builder.hash_one(key))
    }

    /// Inserts a pair, replacing and returning the value of an existing key.
    /// The stored key is kept.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chunk_dict::HashMap;
    ///
    /// let mut map: HashMap<_, _> = HashMap::new();
    /// assert_eq!(map.insert(37, "a"), None);
    /// assert_eq!(map.insert(37, "b"), Some("a"));
    /// assert_eq!(map.get(&37), Some(&"b"));
    /// ```
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self.entry(key) {
            Entry::Occupied(mut entry) => Some(entry.insert(value)),
            Entry::Vacant(entry) => {
                entry.insert(value);
                None
            }
        }
    }

    /// Fallible version of [`insert`](Self::insert). On error the map is
    /// unchanged and the pair is dropped.
    pub fn try_insert(&mut self, key: K, value: V) -> Result<Option<V>, TryReserveError> {
        match self.entry(key) {
            Entry::Occupied(mut entry) => Ok(Some(entry.insert(value))),
            Entry::Vacant(entry) => {
                entry.try_insert(value)?;
                Ok(None)
            }
        }
    }

    /// Inserts a pair only if the key is absent. Returns whether it was
    /// inserted; an existing value is never touched.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chunk_dict::HashMap;
    ///
    /// let mut map: HashMap<_, _> = HashMap::new();
    /// assert!(map.insert_if_absent("k", 1));
    /// assert!(!map.insert_if_absent("k", 2));
    /// assert_eq!(map["k"], 1);
    /// ```
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        match self.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(value);
                true
            }
        }
    }

    /// Builds a pair with `make` and inserts it unless its key is already
    /// present.
    ///
    /// The pair is constructed exactly once, directly before it is moved
    /// into a freshly acquired slot. If the key turns out to exist, the new
    /// pair is dropped, its slot goes back to the free list and the existing
    /// value is returned untouched. The flag reports whether the new pair
    /// was kept.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chunk_dict::HashMap;
    ///
    /// let mut map: HashMap<_, _> = HashMap::new();
    /// let (value, inserted) = map.emplace(|| ("k", vec![1, 2]));
    /// assert!(inserted);
    /// value.push(3);
    ///
    /// let (value, inserted) = map.emplace(|| ("k", Vec::new()));
    /// assert!(!inserted);
    /// assert_eq!(value, &[1, 2, 3]);
    /// ```
    pub fn emplace(&mut self, make: impl FnOnce() -> (K, V)) -> (&mut V, bool) {
        let hash_builder = &self.hash_builder;
        let (pair, inserted) = self.table.emplace(
            make,
            |(k, _)| fold_hash(hash_builder.hash_one(k)),
            |(a, _), (b, _)| a == b,
        );
        (&mut pair.1, inserted)
    }

    /// Fallible version of [`emplace`](Self::emplace).
    pub fn try_emplace(
        &mut self,
        make: impl FnOnce() -> (K, V),
    ) -> Result<(&mut V, bool), TryReserveError> {
        let hash_builder = &self.hash_builder;
        let (pair, inserted) = self.table.try_emplace(
            make,
            |(k, _)| fold_hash(hash_builder.hash_one(k)),
            |(a, _), (b, _)| a == b,
        )?;
        Ok((&mut pair.1, inserted))
    }

    /// Returns a handle to the entry for `key`.
    pub fn find<Q>(&self, key: &Q) -> Option<EntryRef>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.make_hash(key);
        self.table.find(hash, |(k, _)| Borrow::<Q>::borrow(k) == key)
    }

    /// Returns a reference to the value for `key`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chunk_dict::HashMap;
    ///
    /// let mut map: HashMap<_, _> = HashMap::new();
    /// map.insert(1, "a");
    /// assert_eq!(map.get(&1), Some(&"a"));
    /// assert_eq!(map.get(&2), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.make_hash(key);
        self.table
            .get(hash, |(k, _)| Borrow::<Q>::borrow(k) == key)
            .map(|(_, v)| v)
    }

    /// Returns the stored key and value for `key`.
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.make_hash(key);
        self.table
            .get(hash, |(k, _)| Borrow::<Q>::borrow(k) == key)
            .map(|(k, v)| (k, v))
    }

    /// Returns a mutable reference to the value for `key`.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.make_hash(key);
        self.table
            .get_mut(hash, |(k, _)| Borrow::<Q>::borrow(k) == key)
            .map(|(_, v)| v)
    }

    /// Returns `true` if the map contains `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Erases `key`, returning whether it was present.
    ///
    /// The pair's destructor is deferred until its slot is reused or its
    /// chunk is released; [`remove`](Self::remove) hands the value back
    /// instead.
    pub fn erase<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.make_hash(key);
        self.table.erase(hash, |(k, _)| Borrow::<Q>::borrow(k) == key)
    }

    /// Removes `key` and returns its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove_entry(key).map(|(_, v)| v)
    }

    /// Removes `key` and returns the stored key and value.
    pub fn remove_entry<Q>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.make_hash(key);
        self.table.remove(hash, |(k, _)| Borrow::<Q>::borrow(k) == key)
    }

    /// Gets the entry for `key` for in-place manipulation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chunk_dict::HashMap;
    ///
    /// let mut letters: HashMap<_, _> = HashMap::new();
    /// for ch in "a short treatise on fungi".chars() {
    ///     *letters.entry(ch).or_insert(0) += 1;
    /// }
    /// assert_eq!(letters[&'s'], 2);
    /// assert_eq!(letters[&'t'], 3);
    /// ```
    pub fn entry(&mut self, key: K) -> Entry<'_, K, V> {
        let hash = self.make_hash(&key);
        match self.table.entry(hash, |(k, _)| *k == key) {
            TableEntry::Occupied(entry) => Entry::Occupied(OccupiedEntry { entry }),
            TableEntry::Vacant(entry) => Entry::Vacant(VacantEntry { entry, key }),
        }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    S: Default,
{
    /// Creates an empty map using the default hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chunk_dict::HashMap;
    ///
    /// let map: HashMap<i32, String> = HashMap::new();
    /// assert!(map.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::with_hasher(S::default())
    }

    /// Creates an empty map with room for `capacity` entries in its first
    /// chunk, using the default hasher builder.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, S::default())
    }

    /// Creates an empty map from a full [`Config`], using the default
    /// hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chunk_dict::Config;
    /// use chunk_dict::HashMap;
    ///
    /// let config = Config::new().max_load_factor(4.0).auto_shrink(false);
    /// let map: HashMap<u64, u64> = HashMap::with_config(config);
    /// assert_eq!(map.config().get_max_load_factor(), 4.0);
    /// ```
    pub fn with_config(config: Config) -> Self {
        Self::with_config_and_hasher(config, S::default())
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, Q, V, S> Index<&Q> for HashMap<K, V, S>
where
    K: Hash + Eq + Borrow<Q>,
    Q: Hash + Eq + ?Sized,
    S: BuildHasher,
{
    type Output = V;

    /// # Panics
    ///
    /// Panics if the key is not present.
    fn index(&self, key: &Q) -> &V {
        match self.get(key) {
            Some(value) => value,
            None => panic!("key not found in HashMap"),
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HashMap::new();
        map.extend(iter);
        map
    }
}

impl<K, V, S> Extend<(K, V)> for HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        let iter = iter.into_iter();
        self.reserve(iter.size_hint().0);
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<'a, K, V, S> Extend<(&'a K, &'a V)> for HashMap<K, V, S>
where
    K: Hash + Eq + Copy,
    V: Copy,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (&'a K, &'a V)>>(&mut self, iter: I) {
        self.extend(iter.into_iter().map(|(k, v)| (*k, *v)));
    }
}

impl<K, V, S> IntoIterator for HashMap<K, V, S> {
    type IntoIter = IntoIter<K, V>;
    type Item = (K, V);

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            inner: self.table.into_iter(),
        }
    }
}

impl<'a, K, V, S> IntoIterator for &'a HashMap<K, V, S> {
    type IntoIter = Iter<'a, K, V>;
    type Item = (&'a K, &'a V);

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, S> IntoIterator for &'a mut HashMap<K, V, S> {
    type IntoIter = IterMut<'a, K, V>;
    type Item = (&'a K, &'a mut V);

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

/// A view into a single entry in the map, which may either be vacant or
/// occupied.
///
/// This enum is constructed from the [`entry`] method on [`HashMap`].
///
/// [`entry`]: HashMap::entry
pub enum Entry<'a, K, V> {
    /// A vacant entry.
    Vacant(VacantEntry<'a, K, V>),
    /// An occupied entry.
    Occupied(OccupiedEntry<'a, K, V>),
}

impl<'a, K, V> Entry<'a, K, V> {
    /// Inserts `default` if the entry is vacant and returns a mutable
    /// reference to the value.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Inserts the result of `default` if the entry is vacant.
    pub fn or_insert_with<F>(self, default: F) -> &'a mut V
    where
        F: FnOnce() -> V,
    {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Inserts the result of `default`, given the key, if the entry is
    /// vacant.
    pub fn or_insert_with_key<F>(self, default: F) -> &'a mut V
    where
        F: FnOnce(&K) -> V,
    {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let value = default(entry.key());
                entry.insert(value)
            }
        }
    }

    /// Provides in-place mutable access to an occupied entry before any
    /// potential inserts.
    pub fn and_modify<F>(self, f: F) -> Self
    where
        F: FnOnce(&mut V),
    {
        match self {
            Entry::Occupied(mut entry) => {
                f(entry.get_mut());
                Entry::Occupied(entry)
            }
            Entry::Vacant(entry) => Entry::Vacant(entry),
        }
    }

    /// Returns a reference to this entry's key.
    pub fn key(&self) -> &K {
        match self {
            Entry::Occupied(entry) => entry.key(),
            Entry::Vacant(entry) => entry.key(),
        }
    }
}

impl<'a, K, V> Entry<'a, K, V>
where
    V: Default,
{
    /// Inserts the default value if the entry is vacant.
    pub fn or_default(self) -> &'a mut V {
        self.or_insert_with(Default::default)
    }
}

/// A view into a vacant entry in the map.
pub struct VacantEntry<'a, K, V> {
    entry: crate::hash_table::VacantEntry<'a, (K, V)>,
    key: K,
}

impl<'a, K, V> VacantEntry<'a, K, V> {
    /// Gets a reference to the key that would be used when inserting a value.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Take ownership of the key.
    pub fn into_key(self) -> K {
        self.key
    }

    /// Inserts the value into the map and returns a mutable reference to it.
    pub fn insert(self, value: V) -> &'a mut V {
        &mut self.entry.insert((self.key, value)).1
    }

    /// Fallible version of [`insert`](Self::insert).
    pub fn try_insert(self, value: V) -> Result<&'a mut V, TryReserveError> {
        Ok(&mut self.entry.try_insert((self.key, value))?.1)
    }
}

/// A view into an occupied entry in the map.
pub struct OccupiedEntry<'a, K, V> {
    entry: crate::hash_table::OccupiedEntry<'a, (K, V)>,
}

impl<'a, K, V> OccupiedEntry<'a, K, V> {
    /// Gets a reference to the key in the entry.
    pub fn key(&self) -> &K {
        &self.entry.get().0
    }

    /// Handle to the entry's slot.
    pub fn entry_ref(&self) -> EntryRef {
        self.entry.entry_ref()
    }

    /// Gets a reference to the value in the entry.
    pub fn get(&self) -> &V {
        &self.entry.get().1
    }

    /// Gets a mutable reference to the value in the entry.
    pub fn get_mut(&mut self) -> &mut V {
        &mut self.entry.get_mut().1
    }

    /// Converts the entry into a mutable reference to the value.
    pub fn into_mut(self) -> &'a mut V {
        &mut self.entry.into_mut().1
    }

    /// Replaces the value and returns the old one.
    pub fn insert(&mut self, value: V) -> V {
        core::mem::replace(&mut self.entry.get_mut().1, value)
    }

    /// Removes the entry from the map and returns the value.
    pub fn remove(self) -> V {
        self.entry.remove().1
    }

    /// Removes the entry from the map and returns the key and value.
    pub fn remove_entry(self) -> (K, V) {
        self.entry.remove()
    }
}

/// An iterator over the key-value pairs of a `HashMap`.
pub struct Iter<'a, K, V> {
    inner: crate::hash_table::Iter<'a, (K, V)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| (k, v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

impl<K, V> FusedIterator for Iter<'_, K, V> {}

/// A mutable iterator over the key-value pairs of a `HashMap`.
pub struct IterMut<'a, K, V> {
    inner: crate::hash_table::IterMut<'a, (K, V)>,
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| (&*k, v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K, V> ExactSizeIterator for IterMut<'_, K, V> {}

impl<K, V> FusedIterator for IterMut<'_, K, V> {}

/// An iterator over the keys of a `HashMap`.
pub struct Keys<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K, V> Iterator for Keys<'a, K, V> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K, V> ExactSizeIterator for Keys<'_, K, V> {}

/// An iterator over the values of a `HashMap`.
pub struct Values<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K, V> Iterator for Values<'a, K, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, v)| v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K, V> ExactSizeIterator for Values<'_, K, V> {}

/// A mutable iterator over the values of a `HashMap`.
pub struct ValuesMut<'a, K, V> {
    inner: IterMut<'a, K, V>,
}

impl<'a, K, V> Iterator for ValuesMut<'a, K, V> {
    type Item = &'a mut V;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, v)| v)
    }
}

/// A draining iterator over the key-value pairs of a `HashMap`.
pub struct Drain<'a, K, V> {
    inner: crate::hash_table::Drain<'a, (K, V)>,
}

impl<K, V> Iterator for Drain<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// A consuming iterator over the key-value pairs of a `HashMap`.
pub struct IntoIter<K, V> {
    inner: crate::hash_table::IntoIter<(K, V)>,
}

impl<K, V> Iterator for IntoIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
