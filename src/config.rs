//! VM Configuration
//!
//! Page geometry and the user address-space layout.

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Lowest user virtual address
pub const USER_MEM_LOW: usize = 0x0040_0000;

/// One past the highest user virtual address
pub const USER_MEM_HIGH: usize = 0xc000_0000;

// ============================================================================
// Address Helpers
// ============================================================================

/// Convert address to virtual page number
pub const fn addr_to_pn(addr: usize) -> u32 {
    (addr >> PAGE_SHIFT) as u32
}

/// Convert page number to address
pub const fn pn_to_addr(pn: u32) -> usize {
    (pn as usize) << PAGE_SHIFT
}

/// Offset of an address within its page
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// Is the address page aligned?
pub const fn page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

/// Round address down to page boundary
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round address up to page boundary
pub const fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Number of pages needed to cover `len` bytes
pub const fn pages_for(len: usize) -> u32 {
    ((len + PAGE_SIZE - 1) >> PAGE_SHIFT) as u32
}

// ============================================================================
// Layout
// ============================================================================

/// User address-space bounds, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLayout {
    /// Lowest mappable address
    pub user_mem_low: usize,
    /// One past the highest mappable address
    pub user_mem_high: usize,
}

impl VmLayout {
    pub const fn new(user_mem_low: usize, user_mem_high: usize) -> Self {
        Self {
            user_mem_low,
            user_mem_high,
        }
    }

    /// First user page number
    pub const fn low_pn(&self) -> u32 {
        addr_to_pn(self.user_mem_low)
    }

    /// One past the last user page number
    pub const fn high_pn(&self) -> u32 {
        addr_to_pn(self.user_mem_high)
    }

    /// Does `[lopage, lopage + npages)` lie inside user space?
    pub fn contains_pages(&self, lopage: u32, npages: u32) -> bool {
        match lopage.checked_add(npages) {
            Some(end) => lopage >= self.low_pn() && end <= self.high_pn(),
            None => false,
        }
    }

    /// Does `[addr, addr + len)` lie inside user space?
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.user_mem_low && end <= self.user_mem_high,
            None => false,
        }
    }
}

impl Default for VmLayout {
    fn default() -> Self {
        Self::new(USER_MEM_LOW, USER_MEM_HIGH)
    }
}
