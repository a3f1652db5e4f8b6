pub const LOG_BYTES_IN_MBYTE: u8 = 20;
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the simulated page size (4 KiB pages).
pub const LOG2_PAGE_SIZE: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << LOG2_PAGE_SIZE;

/// log2 of the default cache block size (64 B lines).
pub const LOG2_BLOCK_SIZE: u32 = 6;

/// Size in bytes of a single page-table entry, used to derive how many
/// PTEs fit in one `pte_page_size` page and thus the per-level shift
/// amount in [`crate::vmem::VirtualMemory::shamt`].
pub const PTE_BYTES: u64 = 8;

/// Reserved low region of the physical address space that `VirtualMemory`
/// never hands out, mirroring the original simulator's `VMEM_RESERVE_CAPACITY`.
pub const VMEM_RESERVED_BYTES: u64 = BYTES_IN_MBYTE as u64;
