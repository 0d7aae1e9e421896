use crate::guest_memory::GuestAddr;
use crate::heap::{heap_bounds, HeapAllocator, HeapKind, Request};
use crate::{Error, MIN_ALIGNMENT, MIN_SPLIT_SIZE};
use alloc::collections::BTreeMap;
use spin::Mutex;

/// A general purpose heap supporting individual frees.
///
/// Free memory is tracked as an address ordered list of blocks. Allocations
/// from the head take the *first* (lowest addressed) block that fits,
/// allocations from the tail (negative alignment) the *last* block that fits.
/// When alignment leaves a gap in front of (head) or behind (tail) the
/// allocation, that gap stays a free block of its own. The unused remainder
/// of the chosen block is split off if it is larger than
/// [`MIN_SPLIT_SIZE`], otherwise it is handed out with the allocation.
///
/// Freed blocks are merged with their free neighbours immediately, so the
/// free list never contains two adjacent blocks.
#[derive(Debug)]
pub struct ExpandingHeap {
    base: GuestAddr,
    size: u32,
    inner: Mutex<ExpandingHeapInner>,
}

#[derive(Debug)]
struct ExpandingHeapInner {
    /// Start -> length of every free block.
    free: BTreeMap<u32, u32>,
    /// Address handed out -> the block backing it.
    used: BTreeMap<u32, UsedBlock>,
}

#[derive(Debug, Clone, Copy)]
struct UsedBlock {
    start: u32,
    len: u32,
}

impl ExpandingHeap {
    /// Create a heap managing `base..base + size`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if the range wraps the address
    /// space or is too small to hold a single allocation.
    pub fn new(base: GuestAddr, size: u32) -> crate::Result<Self> {
        let (start, end) = heap_bounds(base, size)?;

        let mut free = BTreeMap::new();
        free.insert(start, end - start);

        Ok(Self {
            base,
            size,
            inner: Mutex::new(ExpandingHeapInner {
                free,
                used: BTreeMap::new(),
            }),
        })
    }

    /// Usable size of the live allocation at `addr`.
    pub fn block_size(&self, addr: GuestAddr) -> Option<u32> {
        let inner = self.inner.lock();
        let block = inner.used.get(&addr.get())?;
        Some(block.start + block.len - addr.get())
    }

    /// Size of the largest free block, ignoring alignment.
    pub fn largest_free_block(&self) -> u32 {
        self.inner.lock().free.values().copied().max().unwrap_or(0)
    }

    /// Sum of all free blocks, ignoring alignment.
    pub fn total_free_size(&self) -> u32 {
        self.inner.lock().free.values().sum()
    }

    /// Number of blocks on the free list.
    pub fn free_block_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.inner.lock().used.len()
    }
}

impl ExpandingHeapInner {
    fn allocate_head(&mut self, req: &Request) -> Option<u32> {
        let (start, len, addr) = self.free.iter().find_map(|(&start, &len)| {
            let addr = GuestAddr::new(start).align_up(req.align)?.get();
            let gap = addr - start;
            (len.checked_sub(gap)? >= req.size).then_some((start, len, addr))
        })?;

        self.free.remove(&start);
        if addr > start {
            self.free.insert(start, addr - start);
        }

        let end = start + len;
        let rest = end - (addr + req.size);
        let block_len = if rest > MIN_SPLIT_SIZE {
            self.free.insert(addr + req.size, rest);
            req.size
        } else {
            req.size + rest
        };

        self.used.insert(
            addr,
            UsedBlock {
                start: addr,
                len: block_len,
            },
        );
        Some(addr)
    }

    fn allocate_tail(&mut self, req: &Request) -> Option<u32> {
        let (start, len, addr) = self.free.iter().rev().find_map(|(&start, &len)| {
            let end = start + len;
            let addr = GuestAddr::new(end.checked_sub(req.size)?)
                .align_down(req.align)
                .get();
            (addr >= start).then_some((start, len, addr))
        })?;

        self.free.remove(&start);
        let end = start + len;
        let alloc_end = addr + req.size;
        if end > alloc_end {
            self.free.insert(alloc_end, end - alloc_end);
        }

        let rest = addr - start;
        let block_start = if rest > MIN_SPLIT_SIZE {
            self.free.insert(start, rest);
            addr
        } else {
            start
        };

        self.used.insert(
            addr,
            UsedBlock {
                start: block_start,
                len: alloc_end - block_start,
            },
        );
        Some(addr)
    }

    /// Put a block back on the free list, merging it with adjacent free blocks.
    fn release(&mut self, block: UsedBlock) {
        let mut start = block.start;
        let mut len = block.len;

        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }

        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        self.free.insert(start, len);
    }
}

impl HeapAllocator for ExpandingHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::Expanding
    }

    fn base(&self) -> GuestAddr {
        self.base
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn allocate_aligned(&self, size: u32, align: i32) -> crate::Result<GuestAddr> {
        let req = Request::new(size, align)?;

        let mut inner = self.inner.lock();
        let addr = if req.from_tail {
            inner.allocate_tail(&req)
        } else {
            inner.allocate_head(&req)
        };

        match addr {
            Some(addr) => {
                let addr = GuestAddr::new(addr);
                tracing::trace!("heap {}: alloc {size:#x} @ {align} -> {addr}", self.base);
                Ok(addr)
            }
            None => {
                tracing::trace!("heap {}: out of memory for {size:#x} @ {align}", self.base);
                Err(req.out_of_memory())
            }
        }
    }

    fn free(&self, addr: GuestAddr) -> crate::Result<()> {
        if addr.is_null() {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        let Some(block) = inner.used.remove(&addr.get()) else {
            tracing::error!("expanding heap {}: free of unallocated {addr}", self.base);
            return Err(Error::UseAfterFree(addr));
        };
        inner.release(block);

        tracing::trace!("expanding heap {}: free {addr}", self.base);
        Ok(())
    }

    fn free_size(&self) -> u32 {
        self.total_free_size()
    }

    fn allocatable_size(&self, align: i32) -> u32 {
        let min = MIN_ALIGNMENT.unsigned_abs();
        let align = align.unsigned_abs();
        if !align.is_power_of_two() {
            return 0;
        }
        let align = align.max(min);

        self.inner
            .lock()
            .free
            .iter()
            .filter_map(|(&start, &len)| {
                let addr = GuestAddr::new(start).align_up(align)?.get();
                len.checked_sub(addr - start)
            })
            .max()
            .map_or(0, |size| size & !(min - 1))
    }

    fn as_expanding(&self) -> Option<&ExpandingHeap> {
        Some(self)
    }
}
