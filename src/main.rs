//! Minimal demonstration of the memory hierarchy: one core issues a
//! stream of loads through an L1, an L2, and a page-table walker backed
//! by small memory stubs, and the run's progress is logged as it goes.
//! There is no CLI surface (see SPEC_FULL's Non-goals); a real frontend
//! would drive this crate's types directly instead of going through a
//! binary.

#[macro_use]
extern crate log;

use anyhow::Result;

use memsim_core::channel::demand_read;
use memsim_core::{
    Address, CacheBuilder, ChannelArena, ChannelBuilder, ChannelId, Driver, Operable, PtwBuilder,
    Request, Response, VirtualMemoryBuilder,
};

/// Stands in for DRAM: answers every request the cycle after it arrives.
struct Memory {
    channel: ChannelId,
}

impl Operable for Memory {
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

pub fn main() -> Result<()> {
    env_logger::init();

    let mut arena = ChannelArena::new();

    let cpu_l1 = arena.insert(ChannelBuilder::new(32, 32, 32, 6).build()?);
    let l1_l2 = arena.insert(ChannelBuilder::new(32, 32, 32, 6).build()?);
    let l2_mem = arena.insert(ChannelBuilder::new(32, 32, 32, 6).build()?);
    let cpu_tlb = arena.insert(ChannelBuilder::new(32, 32, 32, 12).match_offset_bits(true).build()?);
    let tlb_ptw = arena.insert(ChannelBuilder::new(16, 16, 16, 0).build()?);

    let l1 = CacheBuilder::new("l1d", 64, 8, 16, 1, 5, 2, 2)
        .upper_channel(cpu_l1)
        .lower_channel(l1_l2)
        .translation_channel(cpu_tlb)
        .build(&arena)?;
    let l2 = CacheBuilder::new("l2c", 1024, 8, 32, 8, 20, 4, 4)
        .upper_channel(l1_l2)
        .lower_channel(l2_mem)
        .build(&arena)?;
    let mut ptw = PtwBuilder::new("ptw", 16, 8, 2, 2, 2, 4)
        .pscl(2, 64, 4)
        .pscl(3, 16, 2)
        .pscl(4, 4, 1)
        .upper_channel(cpu_tlb)
        .lower_channel(tlb_ptw)
        .build()?;
    let mut vmem = VirtualMemoryBuilder::new(4096, 4, 200, 1 << 36).build()?;

    let mut driver = Driver::new(arena);
    driver.register(Box::new(l1));
    driver.register(Box::new(l2));
    driver.register(Box::new(Memory { channel: l2_mem }));
    driver.register(Box::new(Memory { channel: tlb_ptw }));

    let demand_count = 16u64;
    for i in 0..demand_count {
        let vaddr = Address(0x7f00_0000 + i * 64);
        let mut req: Request = demand_read(vaddr, 0);
        req.is_translated = false;
        req.instr_id = i;
        driver.arena_mut().get_mut(cpu_l1).add_rq(req);
    }

    for cycle in 0..200u64 {
        driver.step()?;
        ptw.tick_with_vmem(cycle, driver.arena_mut(), &mut vmem);
        if driver.arena().get(cpu_l1).returned.len() as u64 >= demand_count {
            info!("all {demand_count} demand loads resolved by cycle {cycle}");
            break;
        }
    }

    Ok(())
}
