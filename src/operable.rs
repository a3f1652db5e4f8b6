//! The cooperative clock driver (SPEC_FULL §5). Every simulated
//! component is an [`Operable`] with a period and a `next_tick` cycle;
//! the driver advances the global clock to the next due cycle and ticks
//! everything scheduled there, in registration order.

use crate::channel::ChannelArena;
use crate::error::DriverError;

pub trait Operable {
    /// Cycles between successive ticks of this component.
    fn period(&self) -> u64;

    /// Advance this component by one of its own periods. `cycle` is the
    /// global cycle at which this tick fires.
    fn tick(&mut self, cycle: u64, arena: &mut ChannelArena);

    fn name(&self) -> &str;
}

struct Entry {
    operable: Box<dyn Operable>,
    next_tick: u64,
}

pub struct Driver {
    entries: Vec<Entry>,
    cycle: u64,
    arena: ChannelArena,
    deadlock_threshold: u64,
    last_progress_cycle: u64,
    last_occupancy: usize,
}

impl Driver {
    pub fn new(arena: ChannelArena) -> Self {
        Driver {
            entries: Vec::new(),
            cycle: 0,
            arena,
            deadlock_threshold: 10_000,
            last_progress_cycle: 0,
            last_occupancy: 0,
        }
    }

    pub fn with_deadlock_threshold(mut self, cycles: u64) -> Self {
        self.deadlock_threshold = cycles;
        self
    }

    /// Registers an operable. Registration order is part of the
    /// observable contract: within one cycle, operables tick in the
    /// order they were registered (e.g. CPU before L1 before L2).
    pub fn register(&mut self, operable: Box<dyn Operable>) {
        self.entries.push(Entry {
            operable,
            next_tick: 0,
        });
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn arena(&self) -> &ChannelArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut ChannelArena {
        &mut self.arena
    }

    /// Advances the clock to the next cycle at which any operable is
    /// due, ticks every operable due at that cycle (registration
    /// order), and checks for a stalled simulation.
    pub fn step(&mut self) -> Result<(), DriverError> {
        let Some(next) = self.entries.iter().map(|e| e.next_tick).min() else {
            return Ok(());
        };
        self.cycle = next;

        for entry in &mut self.entries {
            if entry.next_tick == self.cycle {
                entry.operable.tick(self.cycle, &mut self.arena);
                entry.next_tick += entry.operable.period();
            }
        }

        self.check_deadlock()
    }

    pub fn run_until(&mut self, cycle: u64) -> Result<(), DriverError> {
        while self.cycle < cycle {
            self.step()?;
        }
        Ok(())
    }

    fn check_deadlock(&mut self) -> Result<(), DriverError> {
        let occupancy = self.arena.total_occupancy();
        if occupancy != self.last_occupancy {
            self.last_occupancy = occupancy;
            self.last_progress_cycle = self.cycle;
            return Ok(());
        }
        if occupancy > 0 && self.cycle - self.last_progress_cycle >= self.deadlock_threshold {
            log::error!(
                "deadlock detected at cycle {}: no change in channel occupancy ({}) for {} cycles",
                self.cycle,
                occupancy,
                self.deadlock_threshold
            );
            return Err(DriverError::Deadlock {
                cycle: self.cycle,
                cycles: self.deadlock_threshold,
            });
        }
        Ok(())
    }
}
