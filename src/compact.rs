//! Chunk consolidation behind `shrink_to_fit` and `rearrange`.
//!
//! Live entries are moved out of sparse chunks into a single target chunk.
//! Each moved entry leaves a redirect behind so every bucket chain stays
//! walkable while storage migrates; a fix-up pass then splices the redirects
//! out of the chains before the drained chunks are released.

use alloc::vec::Vec;
use core::cmp::Reverse;

use crate::arena::Arena;
use crate::arena::Chunk;
use crate::buckets::BucketTable;
use crate::config::MIN_CHUNK_ENTRIES;
use crate::entry::ChunkId;
use crate::entry::EntryRef;
use crate::entry::EntryState;
use crate::error::TryReserveError;
use crate::error::try_reserve_exact;
use crate::free_list::EntryLinks;

/// A chunk more than this many times larger than the live population is
/// replaced by a right-sized one when shrinking.
pub(crate) const SHRINK_SLACK: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Goal {
    /// Consolidate chunks; never reallocate a lone chunk.
    Rearrange,
    /// Consolidate chunks and right-size an oversized target.
    Shrink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Plan {
    Keep,
    ReleaseAll,
    Consolidate(ChunkId),
    Reallocate(usize),
}

pub(crate) fn plan<V>(arena: &Arena<V>, live: usize, goal: Goal) -> Plan {
    if arena.chunks.is_empty() {
        return Plan::Keep;
    }
    if live == 0 {
        return Plan::ReleaseAll;
    }

    let best = arena
        .chunks
        .iter()
        .filter(|chunk| chunk.capacity() >= live)
        .min_by_key(|chunk| (chunk.capacity(), Reverse(chunk.id())));
    let Some(best) = best else {
        return Plan::Reallocate(live);
    };

    let floor = live
        .max(MIN_CHUNK_ENTRIES)
        .min(arena.max_chunk_entries());
    if goal == Goal::Shrink && best.capacity() > floor.saturating_mul(SHRINK_SLACK) {
        Plan::Reallocate(live)
    } else if arena.chunks.len() == 1 {
        Plan::Keep
    } else {
        Plan::Consolidate(best.id())
    }
}

/// Runs the compaction `plan` selects. `live` is the table population and is
/// unchanged on return; on error nothing has been modified.
pub(crate) fn compact<V>(
    buckets: &mut BucketTable,
    arena: &mut Arena<V>,
    live: usize,
    goal: Goal,
) -> Result<Plan, TryReserveError> {
    let chosen = plan(arena, live, goal);
    let capacity_before = arena.capacity();
    let chunks_before = arena.chunks.len();

    match chosen {
        Plan::Keep => return Ok(chosen),
        Plan::ReleaseAll => {
            buckets.clear();
            arena.release_all();
        }
        Plan::Consolidate(target) => consolidate(buckets, arena, target),
        Plan::Reallocate(entries) => realloc_to(buckets, arena, entries)?,
    }

    debug_assert_eq!(
        arena.allocated() - arena.free.len(),
        live,
        "compaction changed the live population"
    );
    tracing::debug!(
        plan = ?chosen,
        chunks_before,
        chunks_after = arena.chunks.len(),
        capacity_before,
        capacity_after = arena.capacity(),
        "compacted arena"
    );
    Ok(chosen)
}

/// Hands out the slots of the target chunk that can receive a moved entry:
/// non-live slots below the bump pointer first, then fresh bump slots.
struct Holes {
    cursor: usize,
}

impl Holes {
    fn next<V>(&mut self, chunk: &mut Chunk<V>) -> Option<EntryRef> {
        while self.cursor < chunk.used() {
            let slot = self.cursor;
            self.cursor += 1;
            if !chunk.entries[slot].is_live() {
                return Some(EntryRef::new(chunk.id(), slot));
            }
        }
        let at = chunk.bump()?;
        self.cursor = chunk.used();
        Some(at)
    }
}

fn consolidate<V>(buckets: &mut BucketTable, arena: &mut Arena<V>, target: ChunkId) {
    let t = target.index();
    arena.free.clear();

    let mut holes = Holes { cursor: 0 };
    for index in 0..arena.chunks.len() {
        if index == t {
            continue;
        }
        for slot in 0..arena.chunks[index].used() {
            match arena.chunks[index].entries[slot].state() {
                EntryState::Free => {}
                EntryState::Reusable => arena.chunks[index].entries[slot].purge(),
                EntryState::Redirect => {
                    debug_assert!(false, "redirect entry outside of its compaction pass");
                }
                EntryState::InUse => {
                    let Some(dest) = holes.next(&mut arena.chunks[t]) else {
                        unreachable!("consolidation target is sized for every live entry");
                    };
                    let (hash, next, value) = arena.chunks[index].entries[slot].evacuate(dest);
                    arena.chunks[index].live -= 1;

                    let entry = &mut arena.chunks[t].entries[dest.slot()];
                    entry.occupy(hash, value);
                    entry.set_next(next);
                    arena.chunks[t].live += 1;
                }
            }
        }
    }

    fix_up(buckets, arena, target);

    let mut kept = arena.chunks.swap_remove(t);
    arena.chunks.clear();
    debug_assert!(
        kept.entries
            .iter()
            .all(|entry| entry.state() != EntryState::Redirect)
    );
    kept.renumber(ChunkId::FIRST);
    arena.chunks.push(kept);
    arena.rebuild_free_list();
}

/// Follows redirects from `at` to the entry's current location.
fn resolve<V>(arena: &Arena<V>, mut at: EntryRef) -> EntryRef {
    while let Some(to) = arena.chunks[at.chunk().index()].entries[at.slot()].redirect() {
        at = to;
    }
    at
}

/// Rewrites every chain link so it points straight at the relocated entry,
/// already numbered for the target's final position as chunk 0.
fn fix_up<V>(buckets: &mut BucketTable, arena: &mut Arena<V>, target: ChunkId) {
    for index in 0..buckets.len() {
        let mut prev: Option<EntryRef> = None;
        let mut cur = buckets.head(index);
        while let Some(link) = cur {
            let node = resolve(arena, link);
            debug_assert_eq!(node.chunk(), target);

            let renumbered = Some(node.in_chunk(ChunkId::FIRST));
            match prev {
                Some(prev) => arena.chunks[..].set_next(prev, renumbered),
                None => buckets.set_head(index, renumbered),
            }
            cur = arena.chunks[..].next(node);
            prev = Some(node);
        }
    }
}

/// Moves every live entry into freshly allocated chunks sized for `live`
/// entries and releases the old ones.
fn realloc_to<V>(
    buckets: &mut BucketTable,
    arena: &mut Arena<V>,
    live: usize,
) -> Result<(), TryReserveError> {
    let max = arena.max_chunk_entries();
    let mut fresh: Vec<Chunk<V>> = Vec::new();
    try_reserve_exact(&mut fresh, live.div_ceil(max))?;
    let mut remaining = live;
    while remaining > 0 {
        let capacity = remaining.min(max).max(MIN_CHUNK_ENTRIES.min(max));
        fresh.push(Chunk::try_new(ChunkId::from_index(fresh.len()), capacity)?);
        remaining -= remaining.min(capacity);
    }

    let mut fill = 0;
    for index in 0..buckets.len() {
        let mut prev: Option<EntryRef> = None;
        let mut cur = buckets.head(index);
        while let Some(node) = cur {
            let source = &mut arena.chunks[node.chunk().index()].entries[node.slot()];
            cur = source.next();
            let hash = source.hash();
            let value = source.take();

            while fresh[fill].is_full() {
                fill += 1;
            }
            let Some(at) = fresh[fill].bump() else {
                unreachable!("fresh chunks are sized for every live entry");
            };
            fresh[fill].entries[at.slot()].occupy(hash, value);
            fresh[fill].live += 1;

            match prev {
                Some(prev) => fresh[..].set_next(prev, Some(at)),
                None => buckets.set_head(index, Some(at)),
            }
            prev = Some(at);
        }
    }

    arena.free.clear();
    arena.chunks = fresh;
    Ok(())
}
