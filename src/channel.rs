//! Bounded request/response coupling between an upper-level producer and
//! a lower-level consumer (SPEC_FULL §4.1).

use std::collections::VecDeque;

use crate::error::ConfigError;
use crate::request::{Request, RequestKind, Response};
use crate::stats::ChannelStats;

/// Construction-time validated parameters for a [`Channel`].
pub struct ChannelBuilder {
    rq_size: usize,
    pq_size: usize,
    wq_size: usize,
    offset_bits: u32,
    match_offset_bits: bool,
}

impl ChannelBuilder {
    pub fn new(rq_size: usize, pq_size: usize, wq_size: usize, offset_bits: u32) -> Self {
        ChannelBuilder {
            rq_size,
            pq_size,
            wq_size,
            offset_bits,
            match_offset_bits: false,
        }
    }

    /// Marks this channel as coupling page-granular consumers (TLBs,
    /// the PTW) rather than block-granular caches. Purely descriptive:
    /// the collision-key width is still driven by `offset_bits`, which
    /// the caller is expected to set to `LOG2_PAGE_SIZE` for such
    /// channels (see DESIGN.md for why this resolves the source's
    /// ambiguous `match_offset_bits` semantics).
    pub fn match_offset_bits(mut self, v: bool) -> Self {
        self.match_offset_bits = v;
        self
    }

    pub fn build(self) -> Result<Channel, ConfigError> {
        if self.rq_size == 0 {
            return Err(ConfigError::Zero { field: "rq_size" });
        }
        if self.wq_size == 0 {
            return Err(ConfigError::Zero { field: "wq_size" });
        }
        if self.pq_size == 0 {
            return Err(ConfigError::Zero { field: "pq_size" });
        }
        Ok(Channel {
            rq: VecDeque::new(),
            wq: VecDeque::new(),
            pq: VecDeque::new(),
            returned: VecDeque::new(),
            rq_size: self.rq_size,
            pq_size: self.pq_size,
            wq_size: self.wq_size,
            offset_bits: self.offset_bits,
            match_offset_bits: self.match_offset_bits,
            stats: ChannelStats::default(),
        })
    }
}

pub struct Channel {
    pub rq: VecDeque<Request>,
    pub wq: VecDeque<Request>,
    pub pq: VecDeque<Request>,
    pub returned: VecDeque<Response>,

    rq_size: usize,
    pq_size: usize,
    wq_size: usize,
    offset_bits: u32,
    #[allow(dead_code)]
    match_offset_bits: bool,

    pub stats: ChannelStats,
}

impl Channel {
    pub fn rq_size(&self) -> usize {
        self.rq_size
    }
    pub fn wq_size(&self) -> usize {
        self.wq_size
    }
    pub fn pq_size(&self) -> usize {
        self.pq_size
    }
    pub fn rq_occupancy(&self) -> usize {
        self.rq.len()
    }
    pub fn wq_occupancy(&self) -> usize {
        self.wq.len()
    }
    pub fn pq_occupancy(&self) -> usize {
        self.pq.len()
    }
    pub fn offset_bits(&self) -> u32 {
        self.offset_bits
    }

    fn key(&self, req: &Request) -> crate::address::Address {
        req.collision_key(self.offset_bits)
    }

    pub fn add_rq(&mut self, packet: Request) -> bool {
        if self.rq.len() >= self.rq_size {
            self.stats.rq_full += 1;
            return false;
        }
        self.stats.rq_access += 1;
        self.stats.rq_to_cache += 1;
        trace!("channel: admit RQ addr={:?}", packet.address);
        self.rq.push_back(packet);
        true
    }

    pub fn add_wq(&mut self, packet: Request) -> bool {
        if self.wq.len() >= self.wq_size {
            self.stats.wq_full += 1;
            return false;
        }
        self.stats.wq_access += 1;
        self.stats.wq_to_cache += 1;
        trace!("channel: admit WQ addr={:?}", packet.address);
        self.wq.push_back(packet);
        true
    }

    pub fn add_pq(&mut self, packet: Request) -> bool {
        if self.pq.len() >= self.pq_size {
            self.stats.pq_full += 1;
            return false;
        }
        self.stats.pq_access += 1;
        self.stats.pq_to_cache += 1;
        trace!("channel: admit PQ addr={:?}", packet.address);
        self.pq.push_back(packet);
        true
    }

    /// Applies the merge/forward rules (SPEC_FULL §4.1) to whatever was
    /// enqueued on `rq`/`wq`/`pq` since the last call. Must run once per
    /// tick before the consumer drains its queues.
    pub fn check_collision(&mut self) {
        self.merge_wq_wq();
        self.merge_rq_rq();
        self.merge_pq_pq();
        self.forward_wq_to_rq_pq();
    }

    fn merge_wq_wq(&mut self) {
        let mut i = 0;
        while i < self.wq.len() {
            let key_i = self.key(&self.wq[i]);
            let mut j = i + 1;
            let mut dropped = false;
            while j < self.wq.len() {
                if self.key(&self.wq[j]) == key_i {
                    self.wq.remove(j);
                    self.stats.wq_merged += 1;
                    dropped = true;
                } else {
                    j += 1;
                }
            }
            let _ = dropped;
            i += 1;
        }
    }

    fn merge_rq_rq(&mut self) {
        let mut i = 0;
        while i < self.rq.len() {
            let key_i = self.key(&self.rq[i]);
            let translated_i = self.rq[i].is_translated;
            let mut j = i + 1;
            while j < self.rq.len() {
                let same_block = self.key(&self.rq[j]) == key_i;
                let same_translation = self.rq[j].is_translated == translated_i;
                if same_block && same_translation {
                    let merged = self.rq.remove(j).unwrap();
                    let survivor = &mut self.rq[i];
                    survivor
                        .instr_depend_on_me
                        .extend(merged.instr_depend_on_me);
                    survivor.response_requested |= merged.response_requested;
                    self.stats.rq_merged += 1;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
    }

    fn merge_pq_pq(&mut self) {
        let mut i = 0;
        while i < self.pq.len() {
            let key_i = self.key(&self.pq[i]);
            let mut j = i + 1;
            while j < self.pq.len() {
                if self.key(&self.pq[j]) == key_i {
                    let merged = self.pq.remove(j).unwrap();
                    let survivor = &mut self.pq[i];
                    survivor.response_requested |= merged.response_requested;
                    survivor.fill_this_level |= merged.fill_this_level;
                    survivor
                        .instr_depend_on_me
                        .extend(merged.instr_depend_on_me);
                    self.stats.pq_merged += 1;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
    }

    /// RQ/PQ packets matching a pending WQ entry are satisfied directly
    /// from the write buffer: a response is fabricated and handed to
    /// `returned`, and the new packet never reaches the tag array.
    fn forward_wq_to_rq_pq(&mut self) {
        let wq_keys: Vec<_> = self.wq.iter().map(|w| self.key(w)).collect();

        let mut i = 0;
        while i < self.rq.len() {
            let k = self.key(&self.rq[i]);
            if let Some(pos) = wq_keys.iter().position(|&wk| wk == k) {
                let response = Response::from(&self.wq[pos]);
                let removed = self.rq.remove(i).unwrap();
                let mut response = response;
                response.instr_depend_on_me = removed.instr_depend_on_me;
                self.returned.push_back(response);
                self.stats.wq_forward += 1;
                debug!("channel: WQ forward satisfied RQ addr={:?}", k);
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < self.pq.len() {
            let k = self.key(&self.pq[i]);
            if let Some(pos) = wq_keys.iter().position(|&wk| wk == k) {
                let response = Response::from(&self.wq[pos]);
                let removed = self.pq.remove(i).unwrap();
                let mut response = response;
                response.instr_depend_on_me = removed.instr_depend_on_me;
                self.returned.push_back(response);
                self.stats.wq_forward += 1;
            } else {
                i += 1;
            }
        }
    }
}

/// Helper for producers constructing the common request shapes.
pub fn demand_read(address: crate::address::Address, cpu: u32) -> Request {
    Request::new(address, address, RequestKind::Load, cpu)
}

/// Opaque handle into a [`ChannelArena`]. Caches and the PTW hold these
/// rather than `&mut Channel` references, so the arena is the single
/// owning container the Design Notes call for (SPEC_FULL §9):
/// components reference each other only through indices, never through
/// shared ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub usize);

/// The sole owner of every `Channel` in a simulation. Components are
/// handed a `ChannelId` at construction and resolve it against whatever
/// arena the driver passes to `tick`.
#[derive(Default)]
pub struct ChannelArena {
    channels: Vec<Channel>,
}

impl ChannelArena {
    pub fn new() -> Self {
        ChannelArena { channels: Vec::new() }
    }

    pub fn insert(&mut self, channel: Channel) -> ChannelId {
        self.channels.push(channel);
        ChannelId(self.channels.len() - 1)
    }

    pub fn get(&self, id: ChannelId) -> &Channel {
        &self.channels[id.0]
    }

    pub fn get_mut(&mut self, id: ChannelId) -> &mut Channel {
        &mut self.channels[id.0]
    }

    /// Total packets resident across every queue in every channel; used
    /// by the driver's deadlock detector as a cheap progress signal.
    pub fn total_occupancy(&self) -> usize {
        self.channels
            .iter()
            .map(|c| c.rq_occupancy() + c.wq_occupancy() + c.pq_occupancy() + c.returned.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn chan(rq: usize, pq: usize, wq: usize, offset_bits: u32) -> Channel {
        ChannelBuilder::new(rq, pq, wq, offset_bits).build().unwrap()
    }

    #[test]
    fn rejects_over_capacity() {
        let mut c = chan(1, 1, 1, 6);
        assert!(c.add_rq(demand_read(Address(0), 0)));
        assert!(!c.add_rq(demand_read(Address(0x40), 0)));
        assert_eq!(c.stats.rq_full, 1);
    }

    #[test]
    fn wq_wq_same_block_merges() {
        let mut c = chan(4, 4, 4, 6);
        let mut w = Request::new(Address(0xdeadbe00), Address(0xdeadbe00), RequestKind::Write, 0);
        w.response_requested = false;
        assert!(c.add_wq(w.clone()));
        assert!(c.add_wq(w));
        c.check_collision();
        assert_eq!(c.wq_occupancy(), 1);
        assert_eq!(c.stats.wq_merged, 1);
    }

    #[test]
    fn rq_rq_same_block_merges_dependents() {
        let mut c = chan(4, 4, 4, 6);
        let mut a = demand_read(Address(0x1000), 0);
        a.instr_depend_on_me.push(1);
        let mut b = demand_read(Address(0x1000), 0);
        b.instr_depend_on_me.push(2);
        c.add_rq(a);
        c.add_rq(b);
        c.check_collision();
        assert_eq!(c.rq_occupancy(), 1);
        assert_eq!(c.rq[0].instr_depend_on_me.len(), 2);
        assert_eq!(c.stats.rq_merged, 1);
    }

    #[test]
    fn rq_rq_different_translation_state_does_not_merge() {
        let mut c = chan(4, 4, 4, 6);
        let mut a = demand_read(Address(0x1000), 0);
        a.is_translated = true;
        let mut b = demand_read(Address(0x1000), 0);
        b.is_translated = false;
        c.add_rq(a);
        c.add_rq(b);
        c.check_collision();
        assert_eq!(c.rq_occupancy(), 2);
        assert_eq!(c.stats.rq_merged, 0);
    }

    #[test]
    fn pq_pq_promotes_response_requested_and_fill() {
        let mut c = chan(4, 4, 4, 6);
        let mut a = demand_read(Address(0x2000), 0);
        a.kind = RequestKind::Prefetch;
        a.response_requested = false;
        a.fill_this_level = false;
        let mut b = demand_read(Address(0x2000), 0);
        b.kind = RequestKind::Prefetch;
        b.response_requested = true;
        b.fill_this_level = true;
        c.add_pq(a);
        c.add_pq(b);
        c.check_collision();
        assert_eq!(c.pq_occupancy(), 1);
        assert!(c.pq[0].response_requested);
        assert!(c.pq[0].fill_this_level);
    }

    #[test]
    fn wq_forwards_to_matching_rq() {
        // Scenario from SPEC_FULL §8, scenario 3.
        let mut c = chan(4, 4, 4, 6);
        let mut w = Request::new(Address(0xdeadbe00), Address(0xdeadbe00), RequestKind::Write, 0);
        w.response_requested = false;
        c.add_wq(w);
        let mut r = demand_read(Address(0xdeadbeef), 0);
        r.response_requested = true;
        c.add_rq(r);
        c.check_collision();
        assert_eq!(c.wq_occupancy(), 1);
        assert_eq!(c.rq_occupancy(), 0);
        assert_eq!(c.returned.len(), 1);
        assert_eq!(c.stats.wq_forward, 1);
    }
}
