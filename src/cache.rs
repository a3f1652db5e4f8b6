//! Set-associative tag array with decoupled tag/fill pipelines, MSHR-based
//! miss handling, and pluggable replacement/prefetch strategies
//! (SPEC_FULL §4.2).

use std::collections::VecDeque;

use crate::address::Address;
use crate::channel::{ChannelArena, ChannelId};
use crate::error::ConfigError;
use crate::operable::Operable;
use crate::policy::{CacheContext, NoPrefetch, PrefetchPolicy, ReplacementPolicy, Victim};
use crate::request::{InstrIdSet, Request, RequestKind, Response};
use crate::stats::CacheStats;

/// The explicit miss state machine from SPEC_FULL §4.2 / the REDESIGN
/// FLAGS: one sum type per entry rather than a handful of booleans
/// whose legal combinations are implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissState {
    New,
    Queued,
    Tagging,
    Translating,
    TagRecheck,
    MshrInflight,
    FillScheduled,
    Filled,
}

#[derive(Debug, Clone)]
struct CacheBlock {
    valid: bool,
    prefetch: bool,
    dirty: bool,
    address: Address,
    v_address: Address,
    data: Address,
    pf_metadata: u32,
}

impl CacheBlock {
    fn invalid() -> Self {
        CacheBlock {
            valid: false,
            prefetch: false,
            dirty: false,
            address: Address::default(),
            v_address: Address::default(),
            data: Address::default(),
            pf_metadata: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct MshrEntry {
    address: Address,
    v_address: Address,
    data: Address,
    pf_metadata: u32,
    kind: RequestKind,
    cpu: u32,
    asid: [u8; 2],
    cycle_enqueued: u64,
    event_cycle: Option<u64>,
    instr_depend_on_me: InstrIdSet,
    to_return: Vec<ChannelId>,
    prefetch_from_this: bool,
    state: MissState,
}

impl MshrEntry {
    fn block_number(&self) -> u64 {
        self.address.block_number()
    }
}

pub struct CacheConfig {
    pub name: String,
    pub sets: usize,
    pub ways: usize,
    pub mshr_size: usize,
    pub hit_latency: u64,
    pub fill_latency: u64,
    pub tag_bandwidth: usize,
    pub fill_bandwidth: usize,
    pub match_offset_bits: bool,
    pub prefetch_as_load: bool,
    pub virtual_prefetch: bool,
    pub pref_activate_mask: u8,
}

pub struct CacheBuilder {
    config: CacheConfig,
    upper_channels: Vec<ChannelId>,
    lower_channel: Option<ChannelId>,
    translation_channel: Option<ChannelId>,
    replacement: Option<Box<dyn ReplacementPolicy>>,
    prefetcher: Option<Box<dyn PrefetchPolicy>>,
}

impl CacheBuilder {
    pub fn new(
        name: impl Into<String>,
        sets: usize,
        ways: usize,
        mshr_size: usize,
        hit_latency: u64,
        fill_latency: u64,
        tag_bandwidth: usize,
        fill_bandwidth: usize,
    ) -> Self {
        CacheBuilder {
            config: CacheConfig {
                name: name.into(),
                sets,
                ways,
                mshr_size,
                hit_latency,
                fill_latency,
                tag_bandwidth,
                fill_bandwidth,
                match_offset_bits: false,
                prefetch_as_load: false,
                virtual_prefetch: false,
                pref_activate_mask: RequestKind::Load.activate_bit() | RequestKind::Prefetch.activate_bit(),
            },
            upper_channels: Vec::new(),
            lower_channel: None,
            translation_channel: None,
            replacement: None,
            prefetcher: None,
        }
    }

    pub fn upper_channel(mut self, id: ChannelId) -> Self {
        self.upper_channels.push(id);
        self
    }

    pub fn lower_channel(mut self, id: ChannelId) -> Self {
        self.lower_channel = Some(id);
        self
    }

    pub fn translation_channel(mut self, id: ChannelId) -> Self {
        self.translation_channel = Some(id);
        self
    }

    pub fn replacement(mut self, policy: Box<dyn ReplacementPolicy>) -> Self {
        self.replacement = Some(policy);
        self
    }

    pub fn prefetcher(mut self, policy: Box<dyn PrefetchPolicy>) -> Self {
        self.prefetcher = Some(policy);
        self
    }

    pub fn pref_activate_mask(mut self, mask: u8) -> Self {
        self.config.pref_activate_mask = mask;
        self
    }

    /// `arena` must hold every channel this cache was told about via
    /// `upper_channel`/`lower_channel`; it is only read here, to check that
    /// demand traffic on both sides of the cache agrees on block offset
    /// width. `translation_channel` is deliberately excluded since it
    /// carries page-granular requests by design.
    pub fn build(self, arena: &ChannelArena) -> Result<Cache, ConfigError> {
        if !self.config.sets.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "sets",
                value: self.config.sets,
            });
        }
        if self.config.ways == 0 {
            return Err(ConfigError::Zero { field: "ways" });
        }
        if self.config.mshr_size == 0 {
            return Err(ConfigError::Zero { field: "mshr_size" });
        }
        if self.config.tag_bandwidth == 0 {
            return Err(ConfigError::Zero { field: "tag_bandwidth" });
        }
        if self.config.fill_bandwidth == 0 {
            return Err(ConfigError::Zero { field: "fill_bandwidth" });
        }
        let Some(lower_channel) = self.lower_channel else {
            return Err(ConfigError::Zero { field: "lower_channel" });
        };
        if self.upper_channels.is_empty() {
            return Err(ConfigError::Zero { field: "upper_channels" });
        }
        let lower_offset_bits = arena.get(lower_channel).offset_bits();
        for &id in &self.upper_channels {
            let upper_offset_bits = arena.get(id).offset_bits();
            if upper_offset_bits != lower_offset_bits {
                return Err(ConfigError::OffsetBitsMismatch {
                    upper: upper_offset_bits,
                    lower: lower_offset_bits,
                });
            }
        }

        let mut replacement = self.replacement.unwrap_or_else(|| Box::new(crate::policy::LruReplacement::new()));
        let mut prefetcher = self.prefetcher.unwrap_or_else(|| Box::new(NoPrefetch));
        let ctx = CacheContext {
            sets: self.config.sets,
            ways: self.config.ways,
            name: &self.config.name,
        };
        replacement.initialize(&ctx);
        prefetcher.initialize(&ctx);

        Ok(Cache {
            blocks: vec![vec![CacheBlock::invalid(); self.config.ways]; self.config.sets],
            mshr: Vec::new(),
            upper_channels: self.upper_channels,
            lower_channel,
            translation_channel: self.translation_channel,
            replacement,
            prefetcher,
            stats: CacheStats::default(),
            pending_hits: Vec::new(),
            internal_pq: VecDeque::new(),
            translating: Vec::new(),
            config: self.config,
        })
    }
}

pub struct Cache {
    config: CacheConfig,
    blocks: Vec<Vec<CacheBlock>>,
    mshr: Vec<MshrEntry>,
    upper_channels: Vec<ChannelId>,
    lower_channel: ChannelId,
    translation_channel: Option<ChannelId>,
    replacement: Box<dyn ReplacementPolicy>,
    prefetcher: Box<dyn PrefetchPolicy>,
    pub stats: CacheStats,
    /// Hits admitted this tick or earlier, awaiting `hit_latency` before
    /// becoming visible upstream.
    pending_hits: Vec<(u64, ChannelId, Response)>,
    /// Prefetches injected by the strategy hook with `fill_this_level`,
    /// processed alongside upper-channel PQ traffic.
    internal_pq: VecDeque<Request>,
    /// Packets pulled off RQ/PQ pending a translation round trip.
    translating: Vec<(Request, ChannelId)>,
}

impl Cache {
    fn set_index(&self, addr: Address) -> usize {
        (addr.block_number() as usize) % self.config.sets
    }

    fn find_way(&self, set: usize, addr: Address) -> Option<usize> {
        self.blocks[set]
            .iter()
            .position(|b| b.valid && b.address.block_number() == addr.block_number())
    }

    /// Injects a prefetch from a strategy hook. `fill_this_level=true`
    /// routes through this cache's own tag/fill pipeline (an MSHR will
    /// be allocated on miss); `false` sends it straight to the next
    /// level without ever touching this cache's array.
    pub fn prefetch_line(&mut self, arena: &mut ChannelArena, address: Address, fill_this_level: bool, pf_metadata: u32) -> bool {
        let mut req = Request::new(address, address, RequestKind::Prefetch, u32::MAX);
        req.pf_metadata = pf_metadata;
        req.response_requested = false;
        req.fill_this_level = fill_this_level;

        if fill_this_level {
            self.internal_pq.push_back(req);
            self.stats.issued_prefetches += 1;
            true
        } else {
            let ok = arena.get_mut(self.lower_channel).add_rq(req);
            if ok {
                self.stats.issued_prefetches += 1;
            }
            ok
        }
    }

    fn try_hit(&mut self, cycle: u64, req: &Request, from_channel: Option<ChannelId>) -> bool {
        let set = self.set_index(req.address);
        let Some(way) = self.find_way(set, req.address) else {
            return false;
        };

        let useful_prefetch = self.blocks[set][way].prefetch;
        if matches!(req.kind, RequestKind::Write | RequestKind::Rfo) {
            self.blocks[set][way].dirty = true;
            self.blocks[set][way].data = req.data;
        }
        if useful_prefetch {
            self.blocks[set][way].prefetch = false;
            self.stats.useful_prefetches += 1;
        }

        self.replacement
            .update_state(req.cpu, set, way, req.address, req.ip, Address::default(), req.kind, true);

        let activated = req.kind.activate_bit() & self.config.pref_activate_mask != 0;
        if activated {
            self.prefetcher
                .cache_operate(req.address, req.ip, true, useful_prefetch, req.kind, req.pf_metadata);
        }

        self.stats.hits += 1;
        if req.response_requested {
            if let Some(channel) = from_channel {
                let mut resp = Response::from(req);
                resp.data = self.blocks[set][way].data;
                self.pending_hits.push((cycle + self.config.hit_latency, channel, resp));
            }
        }
        log::trace!("{}: hit set={set} way={way} addr={:?}", self.config.name, req.address);
        true
    }

    fn handle_miss(&mut self, cycle: u64, arena: &mut ChannelArena, req: &Request, from_channel: Option<ChannelId>) -> bool {
        let block = req.address.block_number();

        if let Some(existing) = self.mshr.iter_mut().find(|m| m.block_number() == block) {
            let promote = existing.prefetch_from_this && !matches!(req.kind, RequestKind::Prefetch);
            if promote {
                existing.cycle_enqueued = cycle;
                existing.kind = req.kind;
                existing.prefetch_from_this = false;
                self.stats.mshr_promotions += 1;
            } else {
                self.stats.mshr_merges += 1;
            }
            existing.instr_depend_on_me.extend(req.instr_depend_on_me.iter().copied());
            if req.response_requested {
                if let Some(channel) = from_channel {
                    existing.to_return.push(channel);
                }
            }
            return true;
        }

        if self.mshr.len() >= self.config.mshr_size {
            return false;
        }

        let mut down = req.clone();
        down.kind = match req.kind {
            RequestKind::Write => RequestKind::Write,
            RequestKind::Prefetch => RequestKind::Prefetch,
            _ => RequestKind::Load,
        };
        down.response_requested = true;
        down.is_translated = true;

        let accepted = if matches!(down.kind, RequestKind::Write) {
            arena.get_mut(self.lower_channel).add_wq(down)
        } else {
            arena.get_mut(self.lower_channel).add_rq(down)
        };
        if !accepted {
            return false;
        }

        let mut to_return = Vec::new();
        if req.response_requested {
            if let Some(channel) = from_channel {
                to_return.push(channel);
            }
        }

        self.mshr.push(MshrEntry {
            address: req.address,
            v_address: req.v_address,
            data: req.data,
            pf_metadata: req.pf_metadata,
            kind: req.kind,
            cpu: req.cpu,
            asid: req.asid,
            cycle_enqueued: cycle,
            event_cycle: None,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
            to_return,
            prefetch_from_this: matches!(req.kind, RequestKind::Prefetch),
            state: MissState::MshrInflight,
        });
        self.stats.mshr_peak_occupancy = self.stats.mshr_peak_occupancy.max(self.mshr.len());
        self.stats.misses += 1;
        log::debug!("{}: miss allocate mshr addr={:?}", self.config.name, req.address);
        true
    }

    fn deliver_pending_hits(&mut self, cycle: u64, arena: &mut ChannelArena) {
        let mut remaining = Vec::with_capacity(self.pending_hits.len());
        for (ready, channel, resp) in self.pending_hits.drain(..) {
            if ready <= cycle {
                arena.get_mut(channel).returned.push_back(resp);
            } else {
                remaining.push((ready, channel, resp));
            }
        }
        self.pending_hits = remaining;
    }

    fn finish_translation(&mut self, arena: &mut ChannelArena) {
        let Some(tchan) = self.translation_channel else { return };
        let responses: Vec<Response> = arena.get_mut(tchan).returned.drain(..).collect();
        for resp in responses {
            if let Some(pos) = self
                .translating
                .iter()
                .position(|(r, _)| r.v_address.block_number() == resp.v_address.block_number())
            {
                let (mut req, channel) = self.translating.remove(pos);
                req.is_translated = true;
                req.address = resp.data;
                log::trace!("{}: translation complete vaddr={:?} paddr={:?}", self.config.name, req.v_address, req.address);
                arena.get_mut(channel).rq.push_front(req);
            }
        }
    }

    fn finish_fill(&mut self, cycle: u64, arena: &mut ChannelArena) {
        let returns: Vec<Response> = arena.get_mut(self.lower_channel).returned.drain(..).collect();
        for resp in returns {
            if let Some(entry) = self
                .mshr
                .iter_mut()
                .find(|m| m.block_number() == resp.address.block_number() && m.event_cycle.is_none())
            {
                entry.data = resp.data;
                entry.event_cycle = Some(cycle + self.config.fill_latency);
                entry.state = MissState::FillScheduled;
            }
        }

        let mut ready: Vec<usize> = self
            .mshr
            .iter()
            .enumerate()
            .filter(|(_, m)| m.event_cycle.map(|ec| ec <= cycle).unwrap_or(false))
            .map(|(i, _)| i)
            .collect();
        ready.truncate(self.config.fill_bandwidth);

        for idx in ready.into_iter().rev() {
            let entry = self.mshr.remove(idx);
            self.complete_fill(cycle, arena, entry);
        }
    }

    fn complete_fill(&mut self, cycle: u64, arena: &mut ChannelArena, entry: MshrEntry) {
        let set = self.set_index(entry.address);
        let current_view: Vec<Option<Address>> = self.blocks[set]
            .iter()
            .map(|b| b.valid.then_some(b.address))
            .collect();

        let victim = self.replacement.find_victim(
            entry.cpu,
            0,
            set,
            &current_view,
            Address::default(),
            entry.address,
            entry.kind,
        );

        let way = match victim {
            Victim::Bypass => None,
            Victim::Way(w) => Some(w),
        };

        if let Some(way) = way {
            let victim_addr = self.blocks[set][way].address;
            let was_valid = self.blocks[set][way].valid;
            let was_dirty = self.blocks[set][way].dirty;
            if was_valid && was_dirty {
                let mut wb = Request::new(victim_addr, victim_addr, RequestKind::Write, entry.cpu);
                wb.response_requested = false;
                wb.data = self.blocks[set][way].data;
                if arena.get_mut(self.lower_channel).add_wq(wb) {
                    self.stats.dirty_evictions += 1;
                }
            }
            if was_valid {
                self.stats.evictions += 1;
            }

            let pf_meta = self
                .prefetcher
                .cache_fill(entry.address, set, way, entry.prefetch_from_this, victim_addr, entry.pf_metadata);

            self.blocks[set][way] = CacheBlock {
                valid: true,
                prefetch: entry.prefetch_from_this,
                dirty: matches!(entry.kind, RequestKind::Write),
                address: entry.address,
                v_address: entry.v_address,
                data: entry.data,
                pf_metadata: pf_meta,
            };
            self.replacement.update_state(
                entry.cpu,
                set,
                way,
                entry.address,
                Address::default(),
                victim_addr,
                entry.kind,
                false,
            );
        }

        for channel in &entry.to_return {
            arena.get_mut(*channel).returned.push_back(Response {
                address: entry.address,
                v_address: entry.v_address,
                data: entry.data,
                pf_metadata: entry.pf_metadata,
                instr_depend_on_me: entry.instr_depend_on_me.clone(),
            });
        }
        log::debug!("{}: fill complete addr={:?}", self.config.name, entry.address);
    }

    fn handle_writeback(&mut self, arena: &mut ChannelArena, budget: &mut usize) {
        let channels = self.upper_channels.clone();
        for channel_id in channels {
            while *budget > 0 {
                let has_front = !arena.get(channel_id).wq.is_empty();
                if !has_front {
                    break;
                }
                let req = arena.get(channel_id).wq.front().unwrap().clone();
                let set = self.set_index(req.address);
                if let Some(way) = self.find_way(set, req.address) {
                    self.blocks[set][way].dirty = true;
                    self.blocks[set][way].data = req.data;
                    self.replacement
                        .update_state(req.cpu, set, way, req.address, req.ip, Address::default(), req.kind, true);
                    arena.get_mut(channel_id).wq.pop_front();
                    *budget -= 1;
                } else {
                    // write-no-allocate: forward directly to the next level.
                    let mut down = req.clone();
                    down.kind = RequestKind::Write;
                    if arena.get_mut(self.lower_channel).add_wq(down) {
                        arena.get_mut(channel_id).wq.pop_front();
                        *budget -= 1;
                    } else {
                        break;
                    }
                }
            }
            if *budget == 0 {
                break;
            }
        }
    }

    fn handle_read_queue(&mut self, cycle: u64, arena: &mut ChannelArena, budget: &mut usize, is_pq: bool) {
        let channels = self.upper_channels.clone();
        for channel_id in channels {
            loop {
                if *budget == 0 {
                    return;
                }
                let front = if is_pq {
                    arena.get(channel_id).pq.front().cloned()
                } else {
                    arena.get(channel_id).rq.front().cloned()
                };
                let Some(req) = front else { break };

                if !req.is_translated {
                    // left for issue-translation; don't consume budget.
                    break;
                }

                if self.try_hit(cycle, &req, Some(channel_id)) {
                    self.pop_front(arena, channel_id, is_pq);
                    *budget -= 1;
                } else if self.handle_miss(cycle, arena, &req, Some(channel_id)) {
                    self.pop_front(arena, channel_id, is_pq);
                    *budget -= 1;
                } else {
                    break; // retryable stall; leave queued.
                }
            }
        }

        // internal (strategy-injected) prefetches share the PQ budget.
        if is_pq {
            while *budget > 0 {
                let Some(req) = self.internal_pq.front().cloned() else { break };
                if self.try_hit(cycle, &req, None) {
                    self.internal_pq.pop_front();
                    *budget -= 1;
                } else if self.handle_miss(cycle, arena, &req, None) {
                    self.internal_pq.pop_front();
                    *budget -= 1;
                } else {
                    break;
                }
            }
        }
    }

    fn pop_front(&mut self, arena: &mut ChannelArena, channel_id: ChannelId, is_pq: bool) {
        if is_pq {
            arena.get_mut(channel_id).pq.pop_front();
        } else {
            arena.get_mut(channel_id).rq.pop_front();
        }
    }

    fn issue_translation(&mut self, arena: &mut ChannelArena) {
        let Some(tchan) = self.translation_channel else { return };
        let channels = self.upper_channels.clone();
        for channel_id in channels {
            if let Some(front) = arena.get(channel_id).rq.front().cloned() {
                if !front.is_translated && !self.translating.iter().any(|(r, _)| r.v_address == front.v_address) {
                    let mut treq = Request::new(front.v_address, front.v_address, RequestKind::Translation, front.cpu);
                    treq.asid = front.asid;
                    treq.instr_id = front.instr_id;
                    if arena.get_mut(tchan).add_rq(treq) {
                        arena.get_mut(channel_id).rq.pop_front();
                        self.translating.push((front, channel_id));
                    }
                }
            }
        }
    }

    fn operate_prefetcher(&mut self, arena: &mut ChannelArena) {
        let injected = self.prefetcher.cycle_operate();
        for (addr, fill_this_level, pf_metadata) in injected {
            self.prefetch_line(arena, addr, fill_this_level, pf_metadata);
        }
    }
}

impl Operable for Cache {
    fn period(&self) -> u64 {
        1
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn tick(&mut self, cycle: u64, arena: &mut ChannelArena) {
        for &channel_id in &self.upper_channels {
            arena.get_mut(channel_id).check_collision();
        }

        self.deliver_pending_hits(cycle, arena);
        self.finish_translation(arena);
        self.finish_fill(cycle, arena);

        let mut tag_budget = self.config.tag_bandwidth;
        self.handle_writeback(arena, &mut tag_budget);
        self.handle_read_queue(cycle, arena, &mut tag_budget, false);
        self.handle_read_queue(cycle, arena, &mut tag_budget, true);

        self.issue_translation(arena);
        self.operate_prefetcher(arena);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelBuilder;
    use crate::constants::LOG2_BLOCK_SIZE;
    use crate::operable::Driver;

    fn build_cache(
        arena: &mut ChannelArena,
        sets: usize,
        ways: usize,
        mshr_size: usize,
        hit_latency: u64,
        fill_latency: u64,
        tag_bandwidth: usize,
        fill_bandwidth: usize,
    ) -> (ChannelId, ChannelId, Cache) {
        let upper = arena.insert(ChannelBuilder::new(32, 32, 32, LOG2_BLOCK_SIZE).build().unwrap());
        let lower = arena.insert(ChannelBuilder::new(32, 32, 32, LOG2_BLOCK_SIZE).build().unwrap());
        let cache = CacheBuilder::new("uut", sets, ways, mshr_size, hit_latency, fill_latency, tag_bandwidth, fill_bandwidth)
            .upper_channel(upper)
            .lower_channel(lower)
            .build(arena)
            .unwrap();
        (upper, lower, cache)
    }

    /// Stub DRAM: answers every RQ/WQ with a response on the next tick,
    /// so a cache miss's only modeled latency is `fill_latency`.
    struct InstantMemory {
        channel: ChannelId,
    }

    impl Operable for InstantMemory {
        fn period(&self) -> u64 {
            1
        }
        fn name(&self) -> &str {
            "dram"
        }
        fn tick(&mut self, _cycle: u64, arena: &mut ChannelArena) {
            let c = arena.get_mut(self.channel);
            while let Some(req) = c.rq.pop_front() {
                c.returned.push_back(Response::from(&req));
            }
            while let Some(req) = c.wq.pop_front() {
                if req.response_requested {
                    c.returned.push_back(Response::from(&req));
                }
            }
        }
    }

    #[test]
    fn mismatched_offset_bits_are_rejected() {
        let mut arena = ChannelArena::new();
        let upper = arena.insert(ChannelBuilder::new(8, 8, 8, LOG2_BLOCK_SIZE).build().unwrap());
        let lower = arena.insert(ChannelBuilder::new(8, 8, 8, 12).build().unwrap());
        let err = CacheBuilder::new("uut", 1, 1, 1, 1, 1, 1, 1)
            .upper_channel(upper)
            .lower_channel(lower)
            .build(&arena)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OffsetBitsMismatch { upper, lower } if upper == LOG2_BLOCK_SIZE && lower == 12
        ));
    }

    #[test]
    fn tag_bandwidth_throttles_hit_delivery() {
        // SPEC_FULL §8 scenario 1, warmed up first so all five accesses hit.
        let mut arena = ChannelArena::new();
        let (upper, lower, cache) = build_cache(&mut arena, 1, 8, 8, 4, 0, 2, 8);
        let mut driver = Driver::new(arena);
        driver.register(Box::new(cache));
        driver.register(Box::new(InstantMemory { channel: lower }));

        let addrs: Vec<Address> = (0..5).map(|i| Address(0x1000 + i * 0x40)).collect();
        for (i, &a) in addrs.iter().enumerate() {
            let mut req = crate::channel::demand_read(a, 0);
            req.instr_id = i as u64;
            driver.arena_mut().get_mut(upper).add_rq(req);
        }
        driver.run_until(50).unwrap();
        driver.arena_mut().get_mut(upper).returned.clear();

        // reissue the same addresses; they are now all resident.
        for (i, &a) in addrs.iter().enumerate() {
            let mut req = crate::channel::demand_read(a, 0);
            req.instr_id = 100 + i as u64;
            driver.arena_mut().get_mut(upper).add_rq(req);
        }
        let start = driver.cycle();

        let mut arrival_cycle: std::collections::HashMap<u64, u64> = std::collections::HashMap::new();
        let mut seen = 0;
        while seen < addrs.len() {
            driver.step().unwrap();
            let cycle = driver.cycle();
            for resp in driver.arena().get(upper).returned.iter().skip(seen) {
                arrival_cycle.insert(resp.address.0, cycle);
                seen += 1;
            }
        }

        let expected = [4u64, 4, 5, 5, 6];
        for (i, &a) in addrs.iter().enumerate() {
            let cycle = arrival_cycle[&a.0];
            assert_eq!(cycle - start, expected[i], "packet {i} address {a:?}");
        }
    }

    #[test]
    fn mshr_merges_same_block_reads() {
        // SPEC_FULL §8 scenario 2.
        let mut arena = ChannelArena::new();
        let (upper, lower, cache) = build_cache(&mut arena, 1, 8, 8, 4, 4, 8, 8);
        let mut driver = Driver::new(arena);
        driver.register(Box::new(cache));
        driver.register(Box::new(InstantMemory { channel: lower }));

        let addr = Address(0x4000);
        let mut a = crate::channel::demand_read(addr, 0);
        a.instr_id = 1;
        driver.arena_mut().get_mut(upper).add_rq(a);
        driver.run_until(1).unwrap();

        let lower_rq_after_first = driver.arena().get(lower).stats.rq_access;
        assert_eq!(lower_rq_after_first, 1);

        let mut b = crate::channel::demand_read(addr, 0);
        b.instr_id = 2;
        driver.arena_mut().get_mut(upper).add_rq(b);
        driver.run_until(6).unwrap();
        driver.run_until(30).unwrap();

        assert_eq!(driver.arena().get(lower).stats.rq_access, 1, "no second downstream request");
        assert_eq!(driver.arena().get(upper).returned.len(), 2, "both producers get a response");
    }
}
