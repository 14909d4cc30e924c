use crate::entry::EntryRef;

/// Access to the link and hash fields of arena entries by handle.
///
/// Bucket chains, the free list and the rehash engine all thread through the
/// same `next` field and only need this view of the arena.
pub(crate) trait EntryLinks {
    fn next(&self, at: EntryRef) -> Option<EntryRef>;

    fn set_next(&mut self, at: EntryRef, next: Option<EntryRef>);

    fn hash(&self, at: EntryRef) -> u32;
}

/// LIFO stack of reclaimed slots threaded through their `next` field.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<EntryRef>,
    count: usize,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        FreeList {
            head: None,
            count: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline(always)]
    pub(crate) fn head(&self) -> Option<EntryRef> {
        self.head
    }

    /// Forgets every member. The slots themselves are untouched.
    pub(crate) fn clear(&mut self) {
        self.head = None;
        self.count = 0;
    }

    pub(crate) fn push_front<L: EntryLinks + ?Sized>(&mut self, links: &mut L, node: EntryRef) {
        links.set_next(node, self.head);
        self.head = Some(node);
        self.count += 1;
    }

    pub(crate) fn pop_front<L: EntryLinks + ?Sized>(&mut self, links: &mut L) -> Option<EntryRef> {
        let node = self.head?;
        debug_assert!(self.count > 0, "free list count underflow");
        self.head = links.next(node);
        links.set_next(node, None);
        self.count -= 1;
        Some(node)
    }

    /// Unlinks `node`, whose predecessor on the list is `prev` (`None` for
    /// the head).
    pub(crate) fn erase<L: EntryLinks + ?Sized>(
        &mut self,
        links: &mut L,
        prev: Option<EntryRef>,
        node: EntryRef,
    ) {
        debug_assert!(self.count > 0, "free list count underflow");
        let next = links.next(node);
        match prev {
            Some(prev) => {
                debug_assert_eq!(links.next(prev), Some(node));
                links.set_next(prev, next);
            }
            None => {
                debug_assert_eq!(self.head, Some(node));
                self.head = next;
            }
        }
        links.set_next(node, None);
        self.count -= 1;
    }
}
