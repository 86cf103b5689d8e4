//! Buddy physical page allocator.
//!
//! Tracks free and reserved physical pages in hierarchical bitmaps derived
//! at boot from the firmware memory map: one bitmap per order in
//! `0..=MAX_ORDER`, bit 1 = reserved, bit 0 = free, plus a per-order free
//! counter to short-circuit searches. Allocation scans the requested order
//! and splits the smallest free higher-order block when it comes up empty;
//! freeing clears the block's bit and re-derives each ancestor as the OR of
//! its children, which coalesces buddies without a separate merge step.
//!
//! Bootstrap is self-hosting: the bitmaps live in a window that `new`
//! locates inside the same memory map the bitmaps describe. The window is
//! permanently reserved at every order, so the allocator can never hand out
//! its own metadata.

use core::{cmp, ptr, slice};

use muon_core::addr::PhysAddr;
use muon_core::kinfo;
use muon_core::sync::SpinLock;

use crate::bitmap::{self, OrderBitmaps};
use crate::{AllocFlags, MAX_ORDER, MemoryMap, ORDER_COUNT, PAGE_SHIFT, PAGE_SIZE, PmmError};

/// Marking mode for downward propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Reserved,
    Free,
}

/// Index of the order-`order` block containing `addr`.
#[inline]
fn block_index(addr: PhysAddr, order: usize) -> usize {
    (addr.as_u64() >> (PAGE_SHIFT + order)) as usize
}

/// Physical address of block `index` at `order`.
#[inline]
fn block_address(index: usize, order: usize) -> PhysAddr {
    PhysAddr::new((index as u64) << (PAGE_SHIFT + order))
}

/// Bytes of bitmap storage the allocator will claim for a machine with
/// `total_memory` bytes of physical memory.
pub fn bitmap_footprint(total_memory: u64) -> usize {
    bitmap::footprint((total_memory >> PAGE_SHIFT) as usize)
}

/// The buddy allocator.
///
/// All mutation goes through `&mut self`; the allocator itself holds no
/// lock. In early boot there is a single execution context; once SMP is up,
/// the global [`PMM`](init) wrapper serializes callers.
pub struct BuddyAllocator {
    /// Hierarchical bitmaps, hosted in the window claimed at bootstrap.
    bitmaps: OrderBitmaps,
    /// Per-order free-block counters; `free_count[k]` always equals the
    /// number of zero bits in the order-`k` bitmap.
    free_count: [u32; ORDER_COUNT],
    /// Number of pages tracked (everything below `total_memory`).
    total_pages: usize,
    /// Offset mapping physical addresses into the kernel's linear view of
    /// physical memory.
    phys_map_offset: u64,
}

impl BuddyAllocator {
    /// Bootstraps the allocator from the boot memory map.
    ///
    /// Sizes the per-order bitmaps for `total_memory` bytes of physical
    /// memory, claims the first usable region that can host them, seeds
    /// every block reserved, and then frees each whole, naturally-aligned
    /// `MAX_ORDER` block inside the usable regions. Sub-`MAX_ORDER` region
    /// tails stay reserved; they only become reachable through splits of a
    /// covering block.
    ///
    /// # Errors
    ///
    /// Returns [`PmmError::OutOfMemory`] if there is no memory to track or
    /// no usable region can host the bitmaps.
    ///
    /// # Safety
    ///
    /// - `phys_map_offset` must map every physical address below
    ///   `total_memory` to writable memory.
    /// - `map` must accurately describe physical memory.
    /// - The chosen bitmap window becomes exclusively owned by the
    ///   allocator; nothing else may touch it afterwards.
    pub unsafe fn new(
        total_memory: u64,
        map: &MemoryMap,
        phys_map_offset: u64,
    ) -> Result<Self, PmmError> {
        let total_pages = (total_memory >> PAGE_SHIFT) as usize;
        if total_pages == 0 {
            return Err(PmmError::OutOfMemory);
        }

        // Size pass: footprint of all MAX_ORDER+1 bitmaps.
        let required = bitmap::footprint(total_pages) as u64;

        // Locate pass: first usable region with room for the window after
        // 8-byte alignment.
        let mut window = None;
        for region in map.regions().iter().filter(|r| r.usable) {
            let aligned = region.start.align_up(8);
            let shrink = aligned - region.start;
            if region.size >= shrink && region.size - shrink >= required {
                window = Some(aligned);
                break;
            }
        }
        let window_start = window.ok_or(PmmError::OutOfMemory)?;
        let window_end = window_start.as_u64() + required;

        // Install: carve the window into per-order slabs, every bit seeded
        // reserved. All counters start at zero.
        // SAFETY: the window lies inside a usable region reachable through
        // `phys_map_offset`, is 8-byte aligned, and per the caller contract
        // is not aliased; the allocator owns it from here on.
        let words = unsafe {
            let ptr = (phys_map_offset + window_start.as_u64()) as *mut u64;
            slice::from_raw_parts_mut(ptr, (required / 8) as usize)
        };
        let bitmaps = OrderBitmaps::install(words, total_pages);

        let mut pmm = Self {
            bitmaps,
            free_count: [0; ORDER_COUNT],
            total_pages,
            phys_map_offset,
        };

        // Mark free: every whole, naturally-aligned MAX_ORDER block inside
        // a usable region. The region hosting the window contributes only
        // the part after the window.
        let block_bytes = (PAGE_SIZE as u64) << MAX_ORDER;
        for region in map.regions().iter().filter(|r| r.usable) {
            let mut start = region.start.align_up(8).as_u64();
            if region.contains(window_start) {
                start = cmp::max(start, window_end.next_multiple_of(8));
            }
            let end = cmp::min(region.end(), total_memory);
            if start >= end {
                continue;
            }

            let mut block = start.next_multiple_of(block_bytes);
            while block + block_bytes <= end {
                let index = (block >> (PAGE_SHIFT + MAX_ORDER)) as usize;
                if pmm.bitmaps.clear(MAX_ORDER, index) {
                    pmm.free_count[MAX_ORDER] += 1;
                }
                block += block_bytes;
            }
        }

        Ok(pmm)
    }

    /// Allocates a block of `PAGE_SIZE << order` bytes, aligned to its own
    /// size.
    ///
    /// If no block is free at `order`, the smallest free higher-order block
    /// is split first. Unless the flags resolve to "do not clear"
    /// (see [`AllocFlags::should_clear`]), the block is zeroed before it is
    /// returned.
    ///
    /// # Errors
    ///
    /// - [`PmmError::InvalidParam`] if `order > MAX_ORDER`.
    /// - [`PmmError::OutOfMemory`] if no free block exists at `order` or
    ///   above.
    pub fn allocate(&mut self, order: usize, flags: AllocFlags) -> Result<PhysAddr, PmmError> {
        if order > MAX_ORDER {
            return Err(PmmError::InvalidParam);
        }

        if self.free_count[order] == 0 {
            self.split_higher_order(order)?;
        }

        let index = self.reserve_at(order).ok_or(PmmError::OutOfMemory)?;
        let addr = block_address(index, order);
        self.mark_below(addr, order, Mark::Reserved);
        self.update_above(addr, order);

        if flags.should_clear() {
            // SAFETY: the block was just reserved for the caller and lies
            // in tracked memory mapped through `phys_map_offset`.
            unsafe { self.fill(addr, 0, PAGE_SIZE << order) };
        }
        Ok(addr)
    }

    /// Returns a previously allocated block to the allocator.
    ///
    /// The `(addr, order)` pair must be exactly what
    /// [`allocate`](Self::allocate) returned. Coalescing is implicit: the
    /// upward pass clears a parent bit as soon as both of its children read
    /// free, so merged blocks reappear at the highest order their buddies
    /// allow.
    ///
    /// # Errors
    ///
    /// - [`PmmError::InvalidParam`] for an out-of-range order, an address
    ///   outside tracked memory, or an address not aligned to the block
    ///   size implied by `order`.
    /// - [`PmmError::NotAllocated`] if the block is not currently allocated
    ///   (double free, wrong order, or never handed out). No state changes.
    pub fn free(&mut self, addr: PhysAddr, order: usize) -> Result<(), PmmError> {
        if order > MAX_ORDER {
            return Err(PmmError::InvalidParam);
        }
        if !addr.is_aligned((PAGE_SIZE as u64) << order) {
            return Err(PmmError::InvalidParam);
        }
        let index = block_index(addr, order);
        // The trailing partial block is permanently reserved; a block is
        // freeable only if it lies entirely within tracked memory.
        if (index + 1) << order > self.total_pages {
            return Err(PmmError::InvalidParam);
        }
        if !self.bitmaps.is_set(order, index) {
            return Err(PmmError::NotAllocated);
        }

        self.bitmaps.clear(order, index);
        self.free_count[order] += 1;
        self.mark_below(addr, order, Mark::Free);
        self.update_above(addr, order);
        Ok(())
    }

    /// Number of free blocks at `order`.
    #[inline]
    pub fn free_blocks(&self, order: usize) -> u32 {
        self.free_count[order]
    }

    /// Number of pages tracked by the allocator.
    #[inline]
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Reserves the first free bit at `order`, keeping the counter in step.
    fn reserve_at(&mut self, order: usize) -> Option<usize> {
        let index = self.bitmaps.reserve_first_free(order)?;
        self.free_count[order] -= 1;
        Some(index)
    }

    /// Breaks the smallest free higher-order block into pieces usable at
    /// `order`: the block is reserved at its own order and its subtree is
    /// re-marked free, leaving free blocks at every order below it.
    ///
    /// The upward pass may transiently release the reserved block again
    /// (its children all read free until the caller's low-order reservation
    /// re-marks the chain); the allocator is only observed between public
    /// operations, where the state is consistent.
    fn split_higher_order(&mut self, order: usize) -> Result<(), PmmError> {
        let mut higher = order + 1;
        while higher <= MAX_ORDER && self.free_count[higher] == 0 {
            higher += 1;
        }
        if higher > MAX_ORDER {
            return Err(PmmError::OutOfMemory);
        }

        let index = self.reserve_at(higher).ok_or(PmmError::OutOfMemory)?;
        let addr = block_address(index, higher);
        self.mark_below(addr, higher, Mark::Free);
        self.update_above(addr, higher);
        Ok(())
    }

    /// Downward propagation: re-marks every sub-block covered by the
    /// order-`order` block at `addr`, at every order below it.
    ///
    /// Counters move by the exact number of bits that changed, so
    /// re-marking an already-consistent subtree (e.g. reserving a
    /// never-split block out of the freshly-seeded state) leaves them
    /// untouched.
    fn mark_below(&mut self, addr: PhysAddr, order: usize, mark: Mark) {
        for below in (0..order).rev() {
            let index = block_index(addr, below);
            let run = 1 << (order - below);
            let changed = match mark {
                Mark::Reserved => self.bitmaps.set_run(below, index, run),
                Mark::Free => self.bitmaps.clear_run(below, index, run),
            } as u32;
            match mark {
                Mark::Reserved => self.free_count[below] -= changed,
                Mark::Free => self.free_count[below] += changed,
            }
        }
    }

    /// Upward propagation: re-derives each covering bit, from `order` up to
    /// `MAX_ORDER`, as the OR of its two children. This is the sole
    /// coalescing mechanism: a parent goes free exactly when its second
    /// child does.
    fn update_above(&mut self, addr: PhysAddr, order: usize) {
        for above in cmp::max(order, 1)..=MAX_ORDER {
            let index = block_index(addr, above);
            let child = index << 1;
            // A missing right sibling covers untracked memory and counts
            // as reserved.
            let reserved = self.bitmaps.is_set(above - 1, child)
                || child + 1 >= self.bitmaps.blocks(above - 1)
                || self.bitmaps.is_set(above - 1, child + 1);

            if reserved {
                if self.bitmaps.set(above, index) {
                    self.free_count[above] -= 1;
                }
            } else if self.bitmaps.clear(above, index) {
                self.free_count[above] += 1;
            }
        }
    }

    /// Fills a physical range through the physical-map window.
    ///
    /// # Safety
    ///
    /// The range must be tracked memory currently owned by the requesting
    /// caller (a block being handed out).
    unsafe fn fill(&mut self, addr: PhysAddr, value: u8, len: usize) {
        let dst = (self.phys_map_offset + addr.as_u64()) as *mut u8;
        // SAFETY: per the `new` contract, every tracked physical address is
        // mapped and writable through `phys_map_offset`.
        unsafe { ptr::write_bytes(dst, value, len) };
    }
}

// ---------------------------------------------------------------------------
// Global PMM
// ---------------------------------------------------------------------------

/// Global physical memory manager.
static PMM: SpinLock<Option<BuddyAllocator>> = SpinLock::new(None);

/// Initializes the global PMM from the boot memory map.
///
/// # Panics
///
/// Panics if called twice or if bootstrap fails; a kernel that cannot stand
/// up its page allocator cannot continue.
///
/// # Safety
///
/// Same contract as [`BuddyAllocator::new`].
pub unsafe fn init(total_memory: u64, map: &MemoryMap, phys_map_offset: u64) {
    // SAFETY: forwarded caller contract.
    let allocator = unsafe { BuddyAllocator::new(total_memory, map, phys_map_offset) }
        .expect("failed to initialize PMM");

    // Log before taking the lock; the sink may allocate or lock on its own.
    kinfo!(
        "pmm: {} pages tracked, {} KiB of bitmaps, {} free {}-page blocks",
        allocator.total_pages(),
        bitmap_footprint(total_memory) / 1024,
        allocator.free_blocks(MAX_ORDER),
        1usize << MAX_ORDER,
    );

    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(allocator);
}

/// Executes a closure with exclusive access to the global PMM.
///
/// # Panics
///
/// Panics if the PMM has not been initialized.
pub fn with<R>(f: impl FnOnce(&mut BuddyAllocator) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}

/// Attempts to execute a closure with exclusive access to the global PMM.
///
/// Returns `None` if the lock is already held (avoiding deadlock in fault
/// handlers) or the PMM has not been initialized yet.
pub fn try_with<R>(f: impl FnOnce(&mut BuddyAllocator) -> R) -> Option<R> {
    let mut pmm = PMM.try_lock()?;
    Some(f(pmm.as_mut()?))
}
