//! Page-table walker: resolves virtual addresses into physical ones by
//! stepping through [`VirtualMemory`]'s page-table levels, short-circuited
//! by a per-level paging-structure cache (PSCL) (SPEC_FULL §4.3).

use crate::address::Address;
use crate::channel::{ChannelArena, ChannelId};
use crate::error::ConfigError;
use crate::lru_table::LruTable;
use crate::request::{InstrIdSet, Request, RequestKind, Response};
use crate::stats::PtwStats;
use crate::vmem::VirtualMemory;

struct PsclEntry {
    level: usize,
    shamt: u32,
}

struct Mshr {
    v_address: Address,
    cpu: u32,
    asid: [u8; 2],
    instr_depend_on_me: InstrIdSet,
    to_return: Vec<ChannelId>,
    level: usize,
    event_cycle: Option<u64>,
}

impl Mshr {
    /// ASID-qualified merge key: two walks for the same virtual page but
    /// different address spaces must never share an MSHR entry, or one
    /// process's walk would resolve using another's page table.
    fn merge_key(&self) -> (u8, u8, u64) {
        (self.asid[0], self.asid[1], self.v_address.page_number())
    }
}

pub struct PtwBuilder {
    name: String,
    rq_size: usize,
    mshr_size: usize,
    max_read: usize,
    max_fill: usize,
    hit_latency: u64,
    pt_levels: usize,
    pscl_dims: Vec<(usize, usize, usize)>, // (level, sets, ways)
    upper_channels: Vec<ChannelId>,
    lower_channel: Option<ChannelId>,
}

impl PtwBuilder {
    pub fn new(name: impl Into<String>, rq_size: usize, mshr_size: usize, max_read: usize, max_fill: usize, hit_latency: u64, pt_levels: usize) -> Self {
        PtwBuilder {
            name: name.into(),
            rq_size,
            mshr_size,
            max_read,
            max_fill,
            hit_latency,
            pt_levels,
            pscl_dims: Vec::new(),
            upper_channels: Vec::new(),
            lower_channel: None,
        }
    }

    /// Configures a PSCL for `level` (2..=pt_levels; level 1, the leaf PTE,
    /// is never cached since every load already hits that page in
    /// physical memory).
    pub fn pscl(mut self, level: usize, sets: usize, ways: usize) -> Self {
        self.pscl_dims.push((level, sets, ways));
        self
    }

    pub fn upper_channel(mut self, id: ChannelId) -> Self {
        self.upper_channels.push(id);
        self
    }

    pub fn lower_channel(mut self, id: ChannelId) -> Self {
        self.lower_channel = Some(id);
        self
    }

    pub fn build(self) -> Result<Ptw, ConfigError> {
        if self.rq_size == 0 {
            return Err(ConfigError::Zero { field: "rq_size" });
        }
        if self.mshr_size == 0 {
            return Err(ConfigError::Zero { field: "mshr_size" });
        }
        if self.pt_levels == 0 {
            return Err(ConfigError::Zero { field: "pt_levels" });
        }
        let Some(lower_channel) = self.lower_channel else {
            return Err(ConfigError::Zero { field: "lower_channel" });
        };
        if self.upper_channels.is_empty() {
            return Err(ConfigError::Zero { field: "upper_channels" });
        }

        let mut pscl: Vec<Option<(LruTable<Address>, PsclEntry)>> = (0..=self.pt_levels).map(|_| None).collect();
        for (level, sets, ways) in &self.pscl_dims {
            if *level == 0 || *level > self.pt_levels {
                return Err(ConfigError::InvalidPsclDimensions {
                    level: *level,
                    sets: *sets,
                    ways: *ways,
                });
            }
            let table = LruTable::new(*sets, *ways)?;
            // 9 bits/level assumes a standard 4 KiB, 8-byte-PTE page table
            // (512 entries/level); only affects PSCL hit rate, never
            // correctness, since the actual walk always goes through
            // `VirtualMemory::get_pte_pa`.
            let shamt = crate::constants::LOG2_PAGE_SIZE + (*level as u32 - 1) * 9;
            pscl[*level] = Some((table, PsclEntry { level: *level, shamt }));
        }

        Ok(Ptw {
            name: self.name,
            rq_size: self.rq_size,
            mshr_size: self.mshr_size,
            max_read: self.max_read,
            max_fill: self.max_fill,
            hit_latency: self.hit_latency,
            pt_levels: self.pt_levels,
            pscl,
            mshr: Vec::new(),
            upper_channels: self.upper_channels,
            lower_channel,
            stats: PtwStats::default(),
        })
    }
}

pub struct Ptw {
    name: String,
    #[allow(dead_code)]
    rq_size: usize,
    mshr_size: usize,
    max_read: usize,
    max_fill: usize,
    hit_latency: u64,
    pt_levels: usize,
    pscl: Vec<Option<(LruTable<Address>, PsclEntry)>>,
    mshr: Vec<Mshr>,
    upper_channels: Vec<ChannelId>,
    lower_channel: ChannelId,
    pub stats: PtwStats,
}

impl Ptw {
    /// Probes PSCLs from `pt_levels` down to 2 and returns the deepest
    /// level whose cache holds this virtual page's entry; the walk can
    /// start one level below that instead of at the root.
    fn probe_pscl(&mut self, vaddr: Address) -> usize {
        for level in (2..=self.pt_levels).rev() {
            if let Some((table, entry)) = &mut self.pscl[level] {
                let key = vaddr.0 >> entry.shamt;
                if table.get(key).is_some() {
                    self.stats.pscl_hits[level] += 1;
                    return level - 1;
                }
                self.stats.pscl_misses[level] += 1;
            }
        }
        self.pt_levels
    }

    fn fill_pscl(&mut self, vaddr: Address, level: usize, pte_pa: Address) {
        if let Some((table, entry)) = &mut self.pscl[level] {
            let key = vaddr.0 >> entry.shamt;
            table.insert(key, pte_pa);
        }
    }

    fn handle_read(
        &mut self,
        cycle: u64,
        arena: &mut ChannelArena,
        vmem: &mut VirtualMemory,
        req: &Request,
        from_channel: ChannelId,
    ) -> bool {
        let candidate = Mshr {
            v_address: req.v_address,
            cpu: req.cpu,
            asid: req.asid,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
            to_return: Vec::new(),
            level: 0,
            event_cycle: None,
        };
        let key = candidate.merge_key();

        if let Some(existing) = self.mshr.iter_mut().find(|m| m.merge_key() == key) {
            existing.instr_depend_on_me.extend(req.instr_depend_on_me.iter().copied());
            if req.response_requested {
                existing.to_return.push(from_channel);
            }
            self.stats.mshr_merges += 1;
            return true;
        }

        if self.mshr.len() >= self.mshr_size {
            return false;
        }

        let start_level = self.probe_pscl(req.v_address);
        let mut to_return = Vec::new();
        if req.response_requested {
            to_return.push(from_channel);
        }

        let mut entry = Mshr {
            v_address: req.v_address,
            cpu: req.cpu,
            asid: req.asid,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
            to_return,
            level: start_level,
            event_cycle: None,
        };
        self.issue_step(cycle, arena, vmem, &mut entry);
        self.mshr.push(entry);
        self.stats.walks_started += 1;
        true
    }

    /// Tags a step's `pf_metadata` with its issuing entry's ASID so that
    /// `finish_step` can tell apart two in-flight walks that share a
    /// `v_address` but belong to different address spaces (merge_key
    /// already keeps such walks in separate MSHR entries; without this
    /// tag a same-page response couldn't tell which entry it answers).
    fn walk_tag(asid: [u8; 2]) -> u32 {
        ((asid[0] as u32) << 8) | asid[1] as u32
    }

    /// Issues the downward `Load` for `entry`'s current level. The
    /// request's `address` is the *PTE's* physical address at that level
    /// (`vmem.get_pte_pa`), not the walk's virtual address — the lower
    /// channel is memory, and memory is addressed by the PTE location,
    /// not by what the walk is ultimately resolving.
    fn issue_step(&mut self, cycle: u64, arena: &mut ChannelArena, vmem: &mut VirtualMemory, entry: &mut Mshr) {
        let Ok((pte_pa, _penalty)) = vmem.get_pte_pa(entry.cpu, entry.v_address, entry.level.max(1)) else {
            return;
        };
        let mut vmem_step = Request::new(pte_pa, entry.v_address, RequestKind::Load, entry.cpu);
        vmem_step.asid = entry.asid;
        vmem_step.pf_metadata = Self::walk_tag(entry.asid);
        vmem_step.response_requested = true;
        let lower = arena.get_mut(self.lower_channel);
        if lower.add_rq(vmem_step) {
            entry.event_cycle = None;
            self.stats.steps_issued += 1;
        }
        let _ = cycle;
    }

    /// Drains the lower channel's responses, advances each matching
    /// walk's level, and either issues the next step or, once level 0 is
    /// reached, schedules the translation's completion.
    fn finish_step(&mut self, cycle: u64, arena: &mut ChannelArena, vmem: &mut VirtualMemory) {
        let responses: Vec<Response> = arena.get_mut(self.lower_channel).returned.drain(..).collect();
        for resp in responses {
            let Some(idx) = self.mshr.iter().position(|m| {
                m.v_address.page_number() == resp.v_address.page_number()
                    && m.event_cycle.is_none()
                    && Self::walk_tag(m.asid) == resp.pf_metadata
            }) else {
                continue;
            };

            let level = self.mshr[idx].level;
            if let Ok((pte_pa, _penalty)) = vmem.get_pte_pa(self.mshr[idx].cpu, self.mshr[idx].v_address, level.max(1)) {
                self.fill_pscl(self.mshr[idx].v_address, level.max(1), pte_pa);
            }

            if level <= 1 {
                self.mshr[idx].level = 0;
                self.mshr[idx].event_cycle = Some(cycle + self.hit_latency);
            } else {
                self.mshr[idx].level -= 1;
                let mut entry_copy = Mshr {
                    v_address: self.mshr[idx].v_address,
                    cpu: self.mshr[idx].cpu,
                    asid: self.mshr[idx].asid,
                    instr_depend_on_me: self.mshr[idx].instr_depend_on_me.clone(),
                    to_return: Vec::new(),
                    level: self.mshr[idx].level,
                    event_cycle: None,
                };
                self.issue_step(cycle, arena, vmem, &mut entry_copy);
            }
        }
    }

    fn complete_walks(&mut self, cycle: u64, arena: &mut ChannelArena, vmem: &mut VirtualMemory) {
        let mut ready: Vec<usize> = self
            .mshr
            .iter()
            .enumerate()
            .filter(|(_, m)| m.event_cycle.map(|ec| ec <= cycle).unwrap_or(false))
            .map(|(i, _)| i)
            .collect();
        ready.truncate(self.max_fill);

        for idx in ready.into_iter().rev() {
            let entry = self.mshr.remove(idx);
            let Ok((paddr, _penalty)) = vmem.va_to_pa(entry.cpu, entry.v_address) else {
                continue;
            };
            for channel in &entry.to_return {
                arena.get_mut(*channel).returned.push_back(Response {
                    address: paddr,
                    v_address: entry.v_address,
                    data: paddr,
                    pf_metadata: 0,
                    instr_depend_on_me: entry.instr_depend_on_me.clone(),
                });
            }
            self.stats.walks_completed += 1;
            log::debug!("{}: walk complete vaddr={:?} paddr={:?}", self.name, entry.v_address, paddr);
        }
    }

    fn drain_upper(&mut self, cycle: u64, arena: &mut ChannelArena, vmem: &mut VirtualMemory) {
        let channels = self.upper_channels.clone();
        let mut admitted = 0;
        for channel_id in channels {
            arena.get_mut(channel_id).check_collision();
            while admitted < self.max_read {
                let Some(req) = arena.get(channel_id).rq.front().cloned() else { break };
                if self.handle_read(cycle, arena, vmem, &req, channel_id) {
                    arena.get_mut(channel_id).rq.pop_front();
                    admitted += 1;
                } else {
                    break;
                }
            }
        }
    }
}

impl Ptw {
    pub fn period(&self) -> u64 {
        1
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every simulated component but the PTW is driven through
    /// [`Operable`]; the PTW needs mutable access to the shared
    /// [`VirtualMemory`] as well as the arena, which that trait's
    /// signature doesn't carry, so callers step it directly with this
    /// method instead of registering it with [`crate::operable::Driver`]
    /// (see SPEC_FULL §9).
    pub fn tick_with_vmem(&mut self, cycle: u64, arena: &mut ChannelArena, vmem: &mut VirtualMemory) {
        self.finish_step(cycle, arena, vmem);
        self.complete_walks(cycle, arena, vmem);
        self.drain_upper(cycle, arena, vmem);
    }
}
