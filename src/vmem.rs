//! Deterministic virtual-to-physical and VA-to-PTE-address allocator
//! (SPEC_FULL §4.4). `VirtualMemory` never allocates real memory for
//! data; it only hands out page numbers.

use std::collections::HashMap;

use crate::address::Address;
use crate::constants::{LOG2_PAGE_SIZE, PAGE_SIZE, PTE_BYTES, VMEM_RESERVED_BYTES};
use crate::error::ConfigError;

/// Cycles charged the first time a virtual page is touched (first-touch
/// minor fault); zero on every subsequent lookup of the same page.
pub type Penalty = u64;

pub struct VirtualMemoryBuilder {
    pte_page_size: u64,
    pt_levels: usize,
    minor_fault_penalty: Penalty,
    physical_pool_bytes: u64,
}

impl VirtualMemoryBuilder {
    pub fn new(pte_page_size: u64, pt_levels: usize, minor_fault_penalty: Penalty, physical_pool_bytes: u64) -> Self {
        VirtualMemoryBuilder {
            pte_page_size,
            pt_levels,
            minor_fault_penalty,
            physical_pool_bytes,
        }
    }

    pub fn build(self) -> Result<VirtualMemory, ConfigError> {
        if self.pte_page_size <= 1024 {
            return Err(ConfigError::PteTooSmall {
                page_size: self.pte_page_size,
                minimum: 1024,
            });
        }
        if !self.pte_page_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "pte_page_size",
                value: self.pte_page_size as usize,
            });
        }
        if self.pt_levels == 0 {
            return Err(ConfigError::Zero { field: "pt_levels" });
        }

        let entries_per_page = self.pte_page_size / PTE_BYTES;
        let reserve_pages = VMEM_RESERVED_BYTES.div_ceil(PAGE_SIZE).max(1);
        let last_ppage = reserve_pages + entries_per_page.pow(self.pt_levels as u32 + 1);

        let required_bits = LOG2_PAGE_SIZE + u64::BITS - last_ppage.leading_zeros();
        if (1u64 << required_bits.min(63)) > self.physical_pool_bytes && required_bits < 64 {
            log::warn!(
                "virtual memory configuration would require {} bits of addressing, exceeding the {}-byte physical pool",
                required_bits,
                self.physical_pool_bytes
            );
        }

        Ok(VirtualMemory {
            minor_fault_penalty: self.minor_fault_penalty,
            pt_levels: self.pt_levels,
            pte_page_size: self.pte_page_size,
            entries_per_page,
            vpage_to_ppage: HashMap::new(),
            page_table: HashMap::new(),
            next_ppage: reserve_pages,
            last_ppage,
            active_pte_page: reserve_pages,
            next_pte_slot: 0,
            pte_page_allocated: false,
        })
    }
}

pub struct VirtualMemory {
    pub minor_fault_penalty: Penalty,
    pub pt_levels: usize,
    pub pte_page_size: u64,
    entries_per_page: u64,

    vpage_to_ppage: HashMap<(u32, u64), u64>,
    page_table: HashMap<(u32, usize, u64), u64>,

    next_ppage: u64,
    last_ppage: u64,

    active_pte_page: u64,
    next_pte_slot: u64,
    pte_page_allocated: bool,
}

impl VirtualMemory {
    /// Shift amount that isolates the bits of a virtual address that
    /// select a PTE slot at `level` (1 = leaf level).
    pub fn shamt(&self, level: usize) -> u32 {
        LOG2_PAGE_SIZE + (level as u32 - 1) * self.entries_per_page.trailing_zeros()
    }

    pub fn available_ppages(&self) -> u64 {
        debug_assert!(self.next_ppage <= self.last_ppage);
        self.last_ppage - self.next_ppage
    }

    fn pop_ppage(&mut self) -> Result<u64, ConfigError> {
        if self.next_ppage >= self.last_ppage {
            return Err(ConfigError::VirtualMemoryTooSmall {
                requested: self.next_ppage + 1,
                available: self.last_ppage,
            });
        }
        let p = self.next_ppage;
        self.next_ppage += 1;
        Ok(p)
    }

    /// First-touch VA→PA. Deterministic: repeated calls with the same
    /// `(cpu, vpage)` always return the same physical address, and only
    /// the first call charges the minor-fault penalty.
    pub fn va_to_pa(&mut self, cpu: u32, vaddr: Address) -> Result<(Address, Penalty), ConfigError> {
        let key = (cpu, vaddr.page_number());
        if let Some(&ppage) = self.vpage_to_ppage.get(&key) {
            return Ok((Address::splice(ppage, vaddr.page_offset()), 0));
        }
        let ppage = self.pop_ppage()?;
        self.vpage_to_ppage.insert(key, ppage);
        log::trace!("vmem: va_to_pa first touch cpu={cpu} vaddr={vaddr:?} ppage={ppage:#x}");
        Ok((Address::splice(ppage, vaddr.page_offset()), self.minor_fault_penalty))
    }

    /// VA→PTE-PA for a given page-table level. PTEs for a level are
    /// packed `entries_per_page`-to-a-page; allocates a fresh backing
    /// page once the active one fills.
    pub fn get_pte_pa(&mut self, cpu: u32, vaddr: Address, level: usize) -> Result<(Address, Penalty), ConfigError> {
        if !self.pte_page_allocated {
            self.active_pte_page = self.pop_ppage()?;
            self.pte_page_allocated = true;
        }

        let upper = vaddr.0 >> self.shamt(level);
        let key = (cpu, level, upper);
        let (ppage, fault) = match self.page_table.get(&key) {
            Some(&p) => (p, false),
            None => {
                let slot_page = self.active_pte_page;
                self.page_table.insert(key, slot_page);
                self.next_pte_slot += 1;
                if self.next_pte_slot >= self.entries_per_page {
                    self.next_pte_slot = 0;
                    self.active_pte_page = self.pop_ppage()?;
                }
                (slot_page, true)
            }
        };

        let slot = vaddr.slice(self.shamt(level), self.entries_per_page.trailing_zeros());
        let byte_offset = slot * crate::constants::PTE_BYTES;
        let paddr = Address(ppage * PAGE_SIZE + byte_offset);

        let penalty = if fault { self.minor_fault_penalty } else { 0 };
        Ok((paddr, penalty))
    }
}
