use core::fmt::Debug;
use core::mem::MaybeUninit;

/// Position of a chunk in the arena's chunk list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ChunkId(u32);

impl ChunkId {
    pub(crate) const FIRST: ChunkId = ChunkId(0);

    #[inline(always)]
    pub(crate) fn from_index(index: usize) -> Self {
        debug_assert!(index <= u32::MAX as usize);
        ChunkId(index as u32)
    }

    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A stable handle to an entry slot: the owning chunk and the slot within
/// it.
///
/// Handles are borrowed views. They stay valid until the next
/// capacity-changing operation (rehash, reserve, shrink_to_fit, rearrange,
/// clear) or until the entry they name is erased.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryRef {
    chunk: ChunkId,
    slot: u32,
}

impl EntryRef {
    #[inline(always)]
    pub(crate) fn new(chunk: ChunkId, slot: usize) -> Self {
        debug_assert!(slot <= u32::MAX as usize);
        EntryRef {
            chunk,
            slot: slot as u32,
        }
    }

    #[inline(always)]
    pub(crate) fn chunk(self) -> ChunkId {
        self.chunk
    }

    #[inline(always)]
    pub(crate) fn slot(self) -> usize {
        self.slot as usize
    }

    #[inline(always)]
    pub(crate) fn in_chunk(self, chunk: ChunkId) -> Self {
        EntryRef { chunk, ..self }
    }
}

/// Lifecycle of one slot.
///
/// ```text
///   Free ──occupy──▶ InUse ──discard──▶ Reusable ──occupy──▶ InUse
///     ▲                │ take                 │ purge
///     └────────────────┴──────────────────────┘
///   InUse ──evacuate──▶ Redirect   (inside one compaction only)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// No payload is constructed.
    Free,
    /// Live payload, linked into exactly one bucket chain.
    InUse,
    /// Erased; the payload is still constructed and dropped on reuse or when
    /// the chunk is released. Linked into the free list.
    Reusable,
    /// Payload moved to the entry `next` points at.
    Redirect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StateTag {
    pub(crate) state: EntryState,
    pub(crate) chunk: ChunkId,
}

/// One slot of a chunk.
///
/// `next` is the bucket-chain link while `InUse`, the free-list link while
/// `Free`/`Reusable` and on the free list, and the forwarding address while
/// `Redirect`.
pub(crate) struct Entry<V> {
    next: Option<EntryRef>,
    hash: u32,
    tag: StateTag,
    value: MaybeUninit<V>,
}

impl<V> Debug for Entry<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Entry")
            .field("next", &self.next)
            .field("hash", &format_args!("{:#010x}", self.hash))
            .field("state", &self.tag.state)
            .field("chunk", &self.tag.chunk.index())
            .finish()
    }
}

impl<V> Entry<V> {
    #[inline(always)]
    pub(crate) fn vacant(chunk: ChunkId) -> Self {
        Entry {
            next: None,
            hash: 0,
            tag: StateTag {
                state: EntryState::Free,
                chunk,
            },
            value: MaybeUninit::uninit(),
        }
    }

    #[inline(always)]
    pub(crate) fn state(&self) -> EntryState {
        self.tag.state
    }

    #[inline(always)]
    pub(crate) fn chunk(&self) -> ChunkId {
        self.tag.chunk
    }

    #[inline(always)]
    pub(crate) fn set_chunk(&mut self, chunk: ChunkId) {
        self.tag.chunk = chunk;
    }

    #[inline(always)]
    pub(crate) fn hash(&self) -> u32 {
        self.hash
    }

    #[inline(always)]
    pub(crate) fn next(&self) -> Option<EntryRef> {
        self.next
    }

    #[inline(always)]
    pub(crate) fn set_next(&mut self, next: Option<EntryRef>) {
        self.next = next;
    }

    #[inline(always)]
    pub(crate) fn is_live(&self) -> bool {
        self.tag.state == EntryState::InUse
    }

    #[inline(always)]
    fn has_payload(&self) -> bool {
        matches!(self.tag.state, EntryState::InUse | EntryState::Reusable)
    }

    /// Constructs a payload in a `Free` or `Reusable` slot, dropping the
    /// stale payload of a `Reusable` one first. The slot is left unlinked.
    pub(crate) fn occupy(&mut self, hash: u32, value: V) {
        debug_assert!(matches!(
            self.tag.state,
            EntryState::Free | EntryState::Reusable
        ));
        if self.tag.state == EntryState::Reusable {
            // SAFETY: Reusable slots still hold their constructed payload.
            unsafe { self.value.assume_init_drop() };
        }
        self.value.write(value);
        self.hash = hash;
        self.next = None;
        self.tag.state = EntryState::InUse;
    }

    /// Marks a live entry erased without running its destructor.
    pub(crate) fn discard(&mut self) {
        debug_assert!(self.is_live());
        self.tag.state = EntryState::Reusable;
    }

    /// Moves the payload out of a live entry, leaving the slot `Free`.
    pub(crate) fn take(&mut self) -> V {
        debug_assert!(self.is_live());
        self.tag.state = EntryState::Free;
        // SAFETY: InUse slots hold an initialized payload, and the state
        // change above prevents it from being read or dropped again.
        unsafe { self.value.assume_init_read() }
    }

    /// Drops any constructed payload and leaves the slot `Free`.
    pub(crate) fn purge(&mut self) {
        if self.has_payload() {
            self.tag.state = EntryState::Free;
            // SAFETY: InUse and Reusable slots hold an initialized payload;
            // the slot is marked Free before the destructor runs so a
            // panicking destructor cannot cause a double drop.
            unsafe { self.value.assume_init_drop() };
        }
    }

    /// Moves a live entry's payload out for relocation to `to`, turning this
    /// slot into a redirect. Returns the cached hash, the old chain link and
    /// the payload.
    pub(crate) fn evacuate(&mut self, to: EntryRef) -> (u32, Option<EntryRef>, V) {
        debug_assert!(self.is_live());
        let next = self.next.replace(to);
        self.tag.state = EntryState::Redirect;
        // SAFETY: The slot was InUse, so its payload is initialized; it is
        // now a Redirect and will never read or drop the payload again.
        let value = unsafe { self.value.assume_init_read() };
        (self.hash, next, value)
    }

    /// Forwarding address of a redirect entry.
    #[inline]
    pub(crate) fn redirect(&self) -> Option<EntryRef> {
        if self.tag.state == EntryState::Redirect {
            self.next
        } else {
            None
        }
    }

    #[inline(always)]
    pub(crate) fn value(&self) -> &V {
        debug_assert!(self.is_live());
        // SAFETY: Callers only reach payloads through live entries, whose
        // payload is initialized.
        unsafe { self.value.assume_init_ref() }
    }

    #[inline(always)]
    pub(crate) fn value_mut(&mut self) -> &mut V {
        debug_assert!(self.is_live());
        // SAFETY: See `value`.
        unsafe { self.value.assume_init_mut() }
    }
}
