// ============================================================================
// Tile cache — LRU recency list with a resident-byte budget
// ============================================================================
//
// Bounds how many tile buffers are resident at once. The recency list is
// intrusive: each resident tile carries `lru_prev`/`lru_next` handles, so
// touch/insert/remove are O(1) with no side allocation. Eviction order is
// decided here; the actual write-back and buffer free happen in the store,
// which owns the swap file.
//
// Locked tiles (`lock_count > 0`) are never offered as eviction candidates —
// that is what keeps a tile pinned for the duration of a pixel-region chunk
// or a plug-in tile exchange round-trip.

use crate::tile::{TileArena, TileId};

/// Running counters, reset never. Surfaced by the CLI report and asserted
/// in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    /// Lock requests served from an already-resident buffer.
    pub hits: u64,
    /// Lock requests that had to materialise a buffer.
    pub misses: u64,
    /// Buffers freed under budget pressure.
    pub evictions: u64,
    /// Dirty tiles written back to swap on eviction.
    pub swap_outs: u64,
    /// Tiles faulted back in from swap.
    pub swap_ins: u64,
}

pub struct TileCache {
    /// Least-recently-used end; eviction starts here.
    head: Option<TileId>,
    /// Most-recently-used end; fresh touches land here.
    tail: Option<TileId>,
    resident_bytes: usize,
    budget: usize,
    stats: CacheStats,
}

impl TileCache {
    pub fn new(budget_bytes: usize) -> Self {
        TileCache {
            head: None,
            tail: None,
            resident_bytes: 0,
            budget: budget_bytes,
            stats: CacheStats::default(),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn set_budget(&mut self, budget_bytes: usize) {
        self.budget = budget_bytes;
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut CacheStats {
        &mut self.stats
    }

    // ---- list surgery -------------------------------------------------------

    fn unlink(&mut self, arena: &mut TileArena, id: TileId) {
        let (prev, next) = {
            let t = arena.get_mut(id);
            let pair = (t.lru_prev, t.lru_next);
            t.lru_prev = None;
            t.lru_next = None;
            pair
        };
        match prev {
            Some(p) => arena.get_mut(p).lru_next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena.get_mut(n).lru_prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_mru(&mut self, arena: &mut TileArena, id: TileId) {
        let old_tail = self.tail;
        {
            let t = arena.get_mut(id);
            t.lru_prev = old_tail;
            t.lru_next = None;
        }
        match old_tail {
            Some(p) => arena.get_mut(p).lru_next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    // ---- public operations --------------------------------------------------

    /// Register a newly-resident tile, or move an already-listed tile to the
    /// most-recently-used end. Called on every lock.
    pub fn touch(&mut self, arena: &mut TileArena, id: TileId) {
        if arena.get(id).in_lru {
            self.unlink(arena, id);
        } else {
            self.resident_bytes += arena.get(id).size();
            arena.get_mut(id).in_lru = true;
        }
        self.push_mru(arena, id);
    }

    /// Drop a tile from the recency list (its buffer is being freed).
    pub fn flush(&mut self, arena: &mut TileArena, id: TileId) {
        if arena.get(id).in_lru {
            self.unlink(arena, id);
            self.resident_bytes -= arena.get(id).size();
            arena.get_mut(id).in_lru = false;
        }
    }

    /// The least-recently-used tile that may legally be evicted right now,
    /// or `None` if everything resident is pinned (or holds sole-copy
    /// content with no swap available to write it to).
    pub fn eviction_candidate(&self, arena: &TileArena, swap_available: bool) -> Option<TileId> {
        let mut cur = self.head;
        while let Some(id) = cur {
            let t = arena.get(id);
            if t.lock_count() == 0 && (!t.must_write_back() || swap_available) {
                return Some(id);
            }
            cur = t.lru_next;
        }
        None
    }

    /// All listed tiles from LRU to MRU. Used by `flush_all` and tests.
    pub fn listed(&self, arena: &TileArena) -> Vec<TileId> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = arena.get(id).lru_next;
        }
        out
    }
}
