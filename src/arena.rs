use alloc::vec::Vec;
use core::mem::size_of;

use crate::entry::ChunkId;
use crate::entry::Entry;
use crate::entry::EntryRef;
use crate::entry::EntryState;
use crate::error::TryReserveError;
use crate::error::try_reserve_exact;
use crate::free_list::EntryLinks;
use crate::free_list::FreeList;

/// One fixed-capacity block of entries.
///
/// `entries.len()` is the bump pointer: slots below it have been handed out
/// at least once, slots above it were never constructed. The vector is
/// reserved with its full capacity up front and never reallocates.
#[derive(Debug)]
pub(crate) struct Chunk<V> {
    pub(crate) entries: Vec<Entry<V>>,
    capacity: usize,
    pub(crate) live: usize,
    id: ChunkId,
}

impl<V> Drop for Chunk<V> {
    fn drop(&mut self) {
        if core::mem::needs_drop::<V>() {
            for entry in self.entries.iter_mut() {
                entry.purge();
            }
        }
    }
}

impl<V> Chunk<V> {
    pub(crate) fn try_new(id: ChunkId, capacity: usize) -> Result<Self, TryReserveError> {
        debug_assert!(capacity > 0);
        let mut entries = Vec::new();
        try_reserve_exact(&mut entries, capacity)?;
        Ok(Chunk {
            entries,
            capacity,
            live: 0,
            id,
        })
    }

    #[inline(always)]
    pub(crate) fn id(&self) -> ChunkId {
        self.id
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots handed out so far.
    #[inline(always)]
    pub(crate) fn used(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    /// Hands out the next never-used slot.
    #[inline]
    pub(crate) fn bump(&mut self) -> Option<EntryRef> {
        if self.is_full() {
            return None;
        }
        let slot = self.entries.len();
        self.entries.push(Entry::vacant(self.id));
        Some(EntryRef::new(self.id, slot))
    }

    /// Gives the chunk a new position in the chunk list and retags every
    /// slot accordingly.
    pub(crate) fn renumber(&mut self, id: ChunkId) {
        self.id = id;
        for entry in self.entries.iter_mut() {
            entry.set_chunk(id);
        }
    }

    #[cfg(any(test, feature = "stats"))]
    pub(crate) fn bytes(&self) -> usize {
        self.capacity * size_of::<Entry<V>>()
    }
}

impl<V> EntryLinks for [Chunk<V>] {
    #[inline(always)]
    fn next(&self, at: EntryRef) -> Option<EntryRef> {
        self[at.chunk().index()].entries[at.slot()].next()
    }

    #[inline(always)]
    fn set_next(&mut self, at: EntryRef, next: Option<EntryRef>) {
        self[at.chunk().index()].entries[at.slot()].set_next(next);
    }

    #[inline(always)]
    fn hash(&self, at: EntryRef) -> u32 {
        self[at.chunk().index()].entries[at.slot()].hash()
    }
}

/// The ordered chunk list plus the free list threaded through it.
#[derive(Debug)]
pub(crate) struct Arena<V> {
    pub(crate) chunks: Vec<Chunk<V>>,
    pub(crate) free: FreeList,
    initial_chunk_entries: usize,
    max_chunk_entries: usize,
}

impl<V> Arena<V> {
    pub(crate) fn new(initial_chunk_entries: usize, max_chunk_bytes: usize) -> Self {
        let max_chunk_entries = (max_chunk_bytes / size_of::<Entry<V>>().max(1))
            .clamp(1, u32::MAX as usize);
        Arena {
            chunks: Vec::new(),
            free: FreeList::new(),
            initial_chunk_entries: initial_chunk_entries.min(max_chunk_entries),
            max_chunk_entries,
        }
    }

    #[inline(always)]
    pub(crate) fn max_chunk_entries(&self) -> usize {
        self.max_chunk_entries
    }

    #[inline(always)]
    pub(crate) fn initial_chunk_entries(&self) -> usize {
        self.initial_chunk_entries
    }

    #[inline(always)]
    pub(crate) fn slot(&self, at: EntryRef) -> &Entry<V> {
        let entry = &self.chunks[at.chunk().index()].entries[at.slot()];
        debug_assert_eq!(entry.chunk(), at.chunk());
        entry
    }

    #[inline(always)]
    pub(crate) fn slot_mut(&mut self, at: EntryRef) -> &mut Entry<V> {
        let entry = &mut self.chunks[at.chunk().index()].entries[at.slot()];
        debug_assert_eq!(entry.chunk(), at.chunk());
        entry
    }

    /// Total entry slots across all chunks, used or not.
    pub(crate) fn capacity(&self) -> usize {
        self.chunks.iter().map(Chunk::capacity).sum()
    }

    /// Slots handed out by bump allocation across all chunks.
    pub(crate) fn allocated(&self) -> usize {
        self.chunks.iter().map(Chunk::used).sum()
    }

    /// Slots that can be acquired without allocating a new chunk.
    pub(crate) fn spare(&self) -> usize {
        self.free.len()
            + self
                .chunks
                .last()
                .map_or(0, |chunk| chunk.capacity() - chunk.used())
    }

    /// Takes a slot from the free list, else from the newest chunk's bump
    /// region. `None` means a new chunk is needed.
    pub(crate) fn acquire(&mut self) -> Option<EntryRef> {
        if let Some(at) = self.free.pop_front(&mut self.chunks[..]) {
            return Some(at);
        }
        self.chunks.last_mut()?.bump()
    }

    /// Capacity of the chunk that would be appended next: the arena doubles,
    /// bounded by the per-chunk entry cap.
    pub(crate) fn next_chunk_capacity(&self) -> usize {
        self.capacity()
            .max(self.initial_chunk_entries)
            .min(self.max_chunk_entries)
    }

    /// Allocates, but does not yet append, the next chunk.
    pub(crate) fn try_prepare_chunk(
        &mut self,
        capacity: usize,
    ) -> Result<Chunk<V>, TryReserveError> {
        if self.chunks.len() >= u32::MAX as usize {
            return Err(TryReserveError::CapacityOverflow);
        }
        try_reserve_exact(&mut self.chunks, 1)?;
        Chunk::try_new(ChunkId::from_index(self.chunks.len()), capacity)
    }

    /// Allocates enough chunks to hold `entries` more slots, continuing the
    /// doubling schedule. Nothing is appended.
    pub(crate) fn try_prepare_chunks(
        &mut self,
        entries: usize,
    ) -> Result<Vec<Chunk<V>>, TryReserveError> {
        let mut prepared: Vec<Chunk<V>> = Vec::new();
        let mut total = self.capacity();
        let mut remaining = entries;
        while remaining > 0 {
            let index = self.chunks.len() + prepared.len();
            if index >= u32::MAX as usize {
                return Err(TryReserveError::CapacityOverflow);
            }
            let capacity = total
                .max(self.initial_chunk_entries)
                .max(remaining)
                .min(self.max_chunk_entries);
            try_reserve_exact(&mut prepared, 1)?;
            prepared.push(Chunk::try_new(ChunkId::from_index(index), capacity)?);
            total = total.saturating_add(capacity);
            remaining -= remaining.min(capacity);
        }
        try_reserve_exact(&mut self.chunks, prepared.len())?;
        Ok(prepared)
    }

    /// Bumps every remaining slot of the newest chunk onto the free list so
    /// a chunk can be appended behind it without stranding them.
    pub(crate) fn seal_tail(&mut self) {
        let Some(index) = self.chunks.len().checked_sub(1) else {
            return;
        };
        while let Some(at) = self.chunks[index].bump() {
            self.free.push_front(&mut self.chunks[..], at);
        }
    }

    /// Appends a chunk produced by [`try_prepare_chunk`](Self::try_prepare_chunk).
    pub(crate) fn push_chunk(&mut self, chunk: Chunk<V>) {
        debug_assert_eq!(chunk.id().index(), self.chunks.len());
        debug_assert!(self.chunks.last().is_none_or(Chunk::is_full));
        tracing::trace!(
            chunk = chunk.id().index(),
            capacity = chunk.capacity(),
            "appending chunk"
        );
        self.chunks.push(chunk);
    }

    /// Marks a live entry erased, deferring its destructor, and pushes it on
    /// the free list.
    pub(crate) fn discard(&mut self, at: EntryRef) {
        self.slot_mut(at).discard();
        self.chunks[at.chunk().index()].live -= 1;
        self.free.push_front(&mut self.chunks[..], at);
    }

    /// Moves a live entry's payload out and pushes the slot on the free list.
    pub(crate) fn take(&mut self, at: EntryRef) -> V {
        let value = self.slot_mut(at).take();
        self.chunks[at.chunk().index()].live -= 1;
        self.free.push_front(&mut self.chunks[..], at);
        value
    }

    /// Constructs a payload in an acquired slot. The slot is left unlinked.
    pub(crate) fn occupy(&mut self, at: EntryRef, hash: u32, value: V) {
        self.slot_mut(at).occupy(hash, value);
        self.chunks[at.chunk().index()].live += 1;
    }

    /// Releases the newest chunk when it no longer holds live entries,
    /// removing its slots from the free list first. The only chunk is kept,
    /// and so is a tail that was never bumped into (reserved headroom).
    pub(crate) fn release_empty_tail(&mut self) -> bool {
        let Some(tail) = self.chunks.last() else {
            return false;
        };
        if self.chunks.len() < 2 || tail.live != 0 || tail.used() == 0 {
            return false;
        }
        let tail_id = tail.id();
        let mut expected = tail.used();

        let mut prev = None;
        let mut cur = self.free.head();
        while let Some(node) = cur {
            if expected == 0 {
                break;
            }
            let next = self.chunks[..].next(node);
            if node.chunk() == tail_id {
                self.free.erase(&mut self.chunks[..], prev, node);
                expected -= 1;
            } else {
                prev = Some(node);
            }
            cur = next;
        }
        debug_assert_eq!(expected, 0, "every slot of an empty chunk is on the free list");

        tracing::trace!(
            chunk = tail_id.index(),
            capacity = self.chunks[tail_id.index()].capacity(),
            "releasing empty tail chunk"
        );
        self.chunks.pop();
        true
    }

    /// Drops every chunk and forgets the free list.
    pub(crate) fn release_all(&mut self) {
        self.free.clear();
        self.chunks.clear();
    }

    /// Rebuilds the free list from every non-live slot below each chunk's
    /// bump pointer.
    pub(crate) fn rebuild_free_list(&mut self) {
        self.free.clear();
        for index in (0..self.chunks.len()).rev() {
            for slot in (0..self.chunks[index].used()).rev() {
                let state = self.chunks[index].entries[slot].state();
                debug_assert!(state != EntryState::Redirect);
                if state != EntryState::InUse {
                    let at = EntryRef::new(ChunkId::from_index(index), slot);
                    self.free.push_front(&mut self.chunks[..], at);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;

    use super::*;

    fn arena<V>(initial: usize, max_entries: usize) -> Arena<V> {
        Arena::new(initial, max_entries * size_of::<Entry<V>>())
    }

    fn grow<V>(arena: &mut Arena<V>) -> EntryRef {
        if let Some(at) = arena.acquire() {
            return at;
        }
        let chunk = arena.try_prepare_chunk(arena.next_chunk_capacity()).unwrap();
        arena.push_chunk(chunk);
        arena.acquire().unwrap()
    }

    #[test]
    fn empty_arena_needs_a_chunk() {
        let mut a: Arena<u64> = arena(8, 64);
        assert!(a.acquire().is_none());
        assert_eq!(a.capacity(), 0);
        assert_eq!(a.spare(), 0);
    }

    #[test]
    fn chunk_capacities_double_up_to_cap() {
        let mut a: Arena<u64> = arena(8, 32);
        let mut capacities = Vec::new();
        for _ in 0..5 {
            let cap = a.next_chunk_capacity();
            capacities.push(cap);
            let chunk = a.try_prepare_chunk(cap).unwrap();
            a.seal_tail();
            a.push_chunk(chunk);
        }
        assert_eq!(capacities, alloc::vec![8, 8, 16, 32, 32]);
        assert_eq!(a.capacity(), 96);
        assert_eq!(a.free.len(), 64, "sealed chunks hand their slots to the free list");
    }

    #[test]
    fn prepared_chunks_cover_request() {
        let mut a: Arena<u64> = arena(8, 64);
        grow(&mut a);
        let prepared = a.try_prepare_chunks(150).unwrap();
        let capacities: Vec<usize> = prepared.iter().map(Chunk::capacity).collect();
        assert_eq!(capacities, alloc::vec![64, 64, 64]);
        for (offset, chunk) in prepared.iter().enumerate() {
            assert_eq!(chunk.id().index(), offset + 1);
        }
        assert!(a.try_prepare_chunks(0).unwrap().is_empty());
    }

    #[test]
    fn sealed_slots_are_acquired_before_new_chunks() {
        let mut a: Arena<u64> = arena(8, 64);
        let first = grow(&mut a);
        a.occupy(first, 0, 0);
        a.seal_tail();
        assert_eq!(a.free.len(), 7);
        assert!(a.chunks[0].is_full());
        for _ in 0..7 {
            let at = a.acquire().unwrap();
            assert_eq!(at.chunk(), ChunkId::FIRST);
        }
        assert!(a.acquire().is_none());
    }

    #[test]
    fn free_list_is_preferred_over_bump() {
        let mut a: Arena<u64> = arena(8, 64);
        let first = grow(&mut a);
        a.occupy(first, 1, 10);
        let second = grow(&mut a);
        a.occupy(second, 2, 20);
        assert_eq!(a.allocated(), 2);

        a.discard(first);
        assert_eq!(a.free.len(), 1);
        assert_eq!(a.acquire(), Some(first));
        assert_eq!(a.allocated(), 2, "reuse does not bump");
    }

    #[test]
    fn take_returns_payload_and_frees_slot() {
        let mut a: Arena<u64> = arena(8, 64);
        let at = grow(&mut a);
        a.occupy(at, 5, 55);
        assert_eq!(a.chunks[0].live, 1);
        assert_eq!(a.take(at), 55);
        assert_eq!(a.chunks[0].live, 0);
        assert_eq!(a.slot(at).state(), EntryState::Free);
        assert_eq!(a.free.len(), 1);
    }

    #[test]
    fn empty_tail_chunk_is_released() {
        let mut a: Arena<u64> = arena(8, 8);
        let mut refs = Vec::new();
        for i in 0..12u64 {
            let at = grow(&mut a);
            a.occupy(at, i as u32, i);
            refs.push(at);
        }
        assert_eq!(a.chunks.len(), 2);

        // Interleave free slots from both chunks.
        a.discard(refs[0]);
        for at in &refs[8..] {
            a.discard(*at);
        }
        a.discard(refs[1]);
        assert_eq!(a.free.len(), 6);

        assert!(a.release_empty_tail());
        assert_eq!(a.chunks.len(), 1);
        assert_eq!(a.free.len(), 2);
        assert_eq!(a.allocated() - a.free.len(), 6);
        assert!(!a.release_empty_tail(), "the last chunk is kept");
    }

    #[test]
    fn untouched_tail_chunk_is_kept() {
        let mut a: Arena<u64> = arena(8, 64);
        let first = grow(&mut a);
        a.occupy(first, 0, 1);
        let reserved = a.try_prepare_chunks(32).unwrap();
        for chunk in reserved {
            a.seal_tail();
            a.push_chunk(chunk);
        }
        let capacity = a.capacity();

        a.discard(first);
        assert!(!a.release_empty_tail());
        assert_eq!(a.chunks.len(), 2);
        assert_eq!(a.capacity(), capacity);
    }

    #[test]
    fn dropping_chunks_drops_live_and_reusable_payloads() {
        let tracker = Rc::new(());
        {
            let mut a: Arena<Rc<()>> = arena(8, 8);
            let live = grow(&mut a);
            a.occupy(live, 0, tracker.clone());
            let erased = grow(&mut a);
            a.occupy(erased, 0, tracker.clone());
            let taken = grow(&mut a);
            a.occupy(taken, 0, tracker.clone());
            a.discard(erased);
            drop(a.take(taken));
            assert_eq!(Rc::strong_count(&tracker), 3);
        }
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn rebuild_free_list_collects_holes() {
        let mut a: Arena<u64> = arena(8, 8);
        let mut refs = Vec::new();
        for i in 0..4u64 {
            let at = grow(&mut a);
            a.occupy(at, 0, i);
            refs.push(at);
        }
        a.discard(refs[1]);
        a.discard(refs[3]);
        a.free.clear();

        a.rebuild_free_list();
        assert_eq!(a.free.len(), 2);
        assert_eq!(a.free.head(), Some(refs[1]));
    }
}
