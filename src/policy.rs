//! Replacement and prefetch strategy contracts (SPEC_FULL §4.2) plus a
//! small reference implementation of each, selected by name at
//! construction. No strategy holds process-wide state: every hook takes
//! a [`CacheContext`] borrow instead of reaching into file-scope globals
//! (see the Design Notes on global state in SPEC_FULL §9 / the REDESIGN
//! FLAGS section).

use crate::address::Address;
use crate::request::RequestKind;

/// Read-only view of cache geometry handed to strategy hooks so they
/// never need to reach for a global.
pub struct CacheContext<'a> {
    pub sets: usize,
    pub ways: usize,
    pub name: &'a str,
}

/// Result of `find_victim`: either a concrete way, or a request to skip
/// storing the fill entirely (only legal from the fill path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Victim {
    Way(usize),
    Bypass,
}

pub trait ReplacementPolicy: Send {
    fn initialize(&mut self, ctx: &CacheContext);

    #[allow(clippy::too_many_arguments)]
    fn find_victim(
        &mut self,
        cpu: u32,
        instr_id: u64,
        set: usize,
        current_set_view: &[Option<Address>],
        ip: Address,
        paddr: Address,
        kind: RequestKind,
    ) -> Victim;

    #[allow(clippy::too_many_arguments)]
    fn update_state(
        &mut self,
        cpu: u32,
        set: usize,
        way: usize,
        paddr: Address,
        ip: Address,
        victim_addr: Address,
        kind: RequestKind,
        hit: bool,
    );

    fn final_stats(&self) -> String {
        String::new()
    }
}

pub trait PrefetchPolicy: Send {
    fn initialize(&mut self, ctx: &CacheContext);

    /// Called on a tag-array access for request kinds whose bit is set
    /// in `pref_activate_mask`; returns the (possibly updated)
    /// `pf_metadata` to thread through.
    #[allow(clippy::too_many_arguments)]
    fn cache_operate(
        &mut self,
        addr: Address,
        ip: Address,
        hit: bool,
        useful_prefetch: bool,
        kind: RequestKind,
        pf_metadata: u32,
    ) -> u32;

    fn cache_fill(
        &mut self,
        addr: Address,
        set: usize,
        way: usize,
        prefetch: bool,
        victim_addr: Address,
        pf_metadata: u32,
    ) -> u32;

    /// Invoked once per tick regardless of traffic; implementations
    /// that want to issue prefetches call back into the cache through
    /// the queued requests returned here.
    fn cycle_operate(&mut self) -> Vec<(Address, bool, u32)> {
        Vec::new()
    }

    fn final_stats(&self) -> String {
        String::new()
    }
}

/// LRU replacement: evicts the least-recently-touched way in the set.
/// `update_state` is called on every access (hit or fill) and bumps the
/// touched way to the back of the per-set recency list.
pub struct LruReplacement {
    recency: Vec<Vec<usize>>,
}

impl LruReplacement {
    pub fn new() -> Self {
        LruReplacement { recency: Vec::new() }
    }
}

impl Default for LruReplacement {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplacementPolicy for LruReplacement {
    fn initialize(&mut self, ctx: &CacheContext) {
        self.recency = (0..ctx.sets).map(|_| (0..ctx.ways).collect()).collect();
    }

    fn find_victim(
        &mut self,
        _cpu: u32,
        _instr_id: u64,
        set: usize,
        _current_set_view: &[Option<Address>],
        _ip: Address,
        _paddr: Address,
        _kind: RequestKind,
    ) -> Victim {
        Victim::Way(self.recency[set][0])
    }

    fn update_state(
        &mut self,
        _cpu: u32,
        set: usize,
        way: usize,
        _paddr: Address,
        _ip: Address,
        _victim_addr: Address,
        _kind: RequestKind,
        _hit: bool,
    ) {
        let order = &mut self.recency[set];
        if let Some(pos) = order.iter().position(|&w| w == way) {
            order.remove(pos);
        }
        order.push(way);
    }
}

/// Next-line prefetcher: on every activated access, requests the
/// following block, filling only this level.
pub struct NextLinePrefetcher {
    block_size: u64,
    pending: Vec<(Address, bool, u32)>,
}

impl NextLinePrefetcher {
    pub fn new(block_size: u64) -> Self {
        NextLinePrefetcher {
            block_size,
            pending: Vec::new(),
        }
    }
}

impl PrefetchPolicy for NextLinePrefetcher {
    fn initialize(&mut self, _ctx: &CacheContext) {}

    fn cache_operate(
        &mut self,
        addr: Address,
        _ip: Address,
        hit: bool,
        _useful_prefetch: bool,
        _kind: RequestKind,
        pf_metadata: u32,
    ) -> u32 {
        if !hit {
            self.pending.push((Address(addr.0 + self.block_size), true, pf_metadata));
        }
        pf_metadata
    }

    fn cache_fill(
        &mut self,
        _addr: Address,
        _set: usize,
        _way: usize,
        _prefetch: bool,
        _victim_addr: Address,
        pf_metadata: u32,
    ) -> u32 {
        pf_metadata
    }

    fn cycle_operate(&mut self) -> Vec<(Address, bool, u32)> {
        std::mem::take(&mut self.pending)
    }
}

/// A prefetcher that never fires; the default for caches that don't
/// configure one explicitly.
#[derive(Default)]
pub struct NoPrefetch;

impl PrefetchPolicy for NoPrefetch {
    fn initialize(&mut self, _ctx: &CacheContext) {}
    fn cache_operate(&mut self, _a: Address, _ip: Address, _h: bool, _u: bool, _k: RequestKind, pf: u32) -> u32 {
        pf
    }
    fn cache_fill(&mut self, _a: Address, _s: usize, _w: usize, _p: bool, _v: Address, pf: u32) -> u32 {
        pf
    }
}

/// Constructs a boxed [`ReplacementPolicy`] by name; names are opaque
/// strings supplied at cache construction, matching the reference
/// simulator's name-based module selection.
pub fn replacement_by_name(name: &str) -> Option<Box<dyn ReplacementPolicy>> {
    match name {
        "lru" => Some(Box::new(LruReplacement::new())),
        _ => None,
    }
}

pub fn prefetch_by_name(name: &str, block_size: u64) -> Option<Box<dyn PrefetchPolicy>> {
    match name {
        "next_line" => Some(Box::new(NextLinePrefetcher::new(block_size))),
        "none" => Some(Box::new(NoPrefetch)),
        _ => None,
    }
}
