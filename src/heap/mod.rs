//! Heap allocators carving guest memory out of a fixed address range.
//!
//! Every allocator owns exactly one contiguous guest range and keeps its
//! bookkeeping on the host side. Allocators are shared between emulated
//! guest threads, so each instance guards its state with its own lock and
//! unrelated heaps never contend.

mod expanding;
mod frame;

use crate::guest_memory::{AddressSpace, GuestAddr};
use crate::{Error, MIN_ALIGNMENT};
use alloc::sync::Arc;
use core::fmt;
use spin::RwLock;
use wasmtime_slab::{Id, Slab};

pub use expanding::ExpandingHeap;
pub use frame::{FrameHeap, FrameRelease, Watermark};

/// Identifies one live heap allocator in the [`HeapTable`].
///
/// The raw value is what guest code sees. `HeapHandle::NULL` (0) is never
/// handed out and means "no heap".
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HeapHandle(u32);

impl HeapHandle {
    pub const NULL: HeapHandle = HeapHandle(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    fn from_id(id: Id) -> Option<Self> {
        id.into_raw().checked_add(1).map(Self)
    }

    fn id(self) -> Option<Id> {
        self.0.checked_sub(1).map(Id::from_raw)
    }
}

impl fmt::Display for HeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    Expanding,
    Frame,
}

/// Common interface of the guest heap allocators.
///
/// All methods take `&self`, implementations synchronise internally.
pub trait HeapAllocator: fmt::Debug + Send + Sync {
    fn kind(&self) -> HeapKind;

    /// First byte of the range this heap owns.
    fn base(&self) -> GuestAddr;

    /// Size in bytes of the range this heap owns.
    fn size(&self) -> u32;

    /// `(base, size)` of the owned range.
    fn range(&self) -> (GuestAddr, u32) {
        (self.base(), self.size())
    }

    /// Allocate `size` bytes with the default alignment.
    ///
    /// # Errors
    ///
    /// See [`HeapAllocator::allocate_aligned`].
    fn allocate(&self, size: u32) -> crate::Result<GuestAddr> {
        self.allocate_aligned(size, MIN_ALIGNMENT)
    }

    /// Allocate `size` bytes aligned to `|align|`.
    ///
    /// A negative alignment allocates from the tail end of the heap.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if `size` is zero or `|align|`
    /// isn't a power of two and with [`Error::OutOfMemory`] if the heap
    /// can't satisfy the request.
    fn allocate_aligned(&self, size: u32, align: i32) -> crate::Result<GuestAddr>;

    /// Return an allocation to the heap. Freeing null does nothing.
    ///
    /// # Errors
    ///
    /// Heaps tracking individual blocks fail with [`Error::UseAfterFree`] for
    /// addresses they didn't hand out.
    fn free(&self, addr: GuestAddr) -> crate::Result<()>;

    /// Total number of free bytes.
    fn free_size(&self) -> u32;

    /// The largest allocation with alignment `align` that would currently succeed.
    fn allocatable_size(&self, align: i32) -> u32;

    fn contains(&self, addr: GuestAddr) -> bool {
        addr.offset_from(self.base())
            .is_some_and(|offset| offset < self.size())
    }

    fn as_expanding(&self) -> Option<&ExpandingHeap> {
        None
    }

    fn as_frame(&self) -> Option<&FrameHeap> {
        None
    }
}

/// A validated allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Request {
    /// Size rounded up to the minimum alignment.
    pub size: u32,
    /// Absolute alignment, at least the minimum alignment.
    pub align: u32,
    pub from_tail: bool,
}

impl Request {
    pub(crate) fn new(size: u32, align: i32) -> crate::Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("allocation size must not be zero"));
        }
        let abs = align.unsigned_abs();
        if !abs.is_power_of_two() {
            return Err(Error::InvalidArgument("alignment must be a power of two"));
        }

        let min = MIN_ALIGNMENT.unsigned_abs();
        let rounded = size
            .checked_add(min - 1)
            .map(|size| size & !(min - 1))
            .ok_or(Error::OutOfMemory { size, align })?;

        Ok(Self {
            size: rounded,
            align: abs.max(min),
            from_tail: align < 0,
        })
    }

    pub(crate) fn out_of_memory(&self) -> Error {
        let align = i32::try_from(self.align).unwrap_or(i32::MAX);
        Error::OutOfMemory {
            size: self.size,
            align: if self.from_tail { -align } else { align },
        }
    }
}

/// Checks the range a new heap wants to own and returns its bounds as raw
/// `(start, end)` with the start aligned to the minimum alignment.
pub(crate) fn heap_bounds(base: GuestAddr, size: u32) -> crate::Result<(u32, u32)> {
    let min = MIN_ALIGNMENT.unsigned_abs();
    let end = base
        .checked_add(size)
        .ok_or(Error::InvalidArgument("heap range wraps the address space"))?;
    let start = base
        .align_up(min)
        .filter(|start| *start < end)
        .ok_or(Error::InvalidArgument("heap range is too small"))?;
    Ok((start.get(), end.get()))
}

/// Every live heap allocator, keyed by [`HeapHandle`].
///
/// The table lock is only held to look up, insert or remove a heap, never
/// while allocating from one.
pub struct HeapTable {
    heaps: RwLock<Slab<Arc<dyn HeapAllocator>>>,
}

impl Default for HeapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeapTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heaps = self.heaps.read();
        f.debug_map()
            .entries(
                heaps
                    .iter()
                    .filter_map(|(id, heap)| Some((HeapHandle::from_id(id)?, heap))),
            )
            .finish()
    }
}

impl HeapTable {
    pub fn new() -> Self {
        Self {
            heaps: RwLock::new(Slab::new()),
        }
    }

    /// Create an [`ExpandingHeap`] owning `base..base + size`.
    ///
    /// # Errors
    ///
    /// See [`HeapTable::insert`].
    pub fn create_expanding(
        &self,
        space: &AddressSpace,
        base: GuestAddr,
        size: u32,
    ) -> crate::Result<HeapHandle> {
        let heap = ExpandingHeap::new(base, size)?;
        self.insert(space, Arc::new(heap))
    }

    /// Create a [`FrameHeap`] owning `base..base + size`.
    ///
    /// # Errors
    ///
    /// See [`HeapTable::insert`].
    pub fn create_frame(
        &self,
        space: &AddressSpace,
        base: GuestAddr,
        size: u32,
    ) -> crate::Result<HeapHandle> {
        let heap = FrameHeap::new(base, size)?;
        self.insert(space, Arc::new(heap))
    }

    /// Register a heap and hand out its handle.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidAddress`] if the heap's range isn't mapped
    /// guest memory and with [`Error::RangeOverlap`] if another live heap
    /// already owns part of it.
    pub fn insert(
        &self,
        space: &AddressSpace,
        heap: Arc<dyn HeapAllocator>,
    ) -> crate::Result<HeapHandle> {
        let (base, size) = (heap.base(), heap.size());
        if !space.contains_range(base, size) {
            return Err(Error::InvalidAddress(base));
        }

        let mut heaps = self.heaps.write();
        if heaps.iter().any(|(_, other)| overlaps(other.as_ref(), base, size)) {
            return Err(Error::RangeOverlap { base, size });
        }

        let kind = heap.kind();
        let id = heaps.alloc(heap);
        let handle = HeapHandle::from_id(id).ok_or(Error::OutOfMemory { size, align: 0 })?;

        tracing::debug!("created {kind:?} heap {handle} over {base}+{size:#x}");
        Ok(handle)
    }

    /// Look up a live heap.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidHandle`] if `handle` doesn't name a live heap.
    pub fn get(&self, handle: HeapHandle) -> crate::Result<Arc<dyn HeapAllocator>> {
        let id = handle.id().ok_or(Error::InvalidHandle(handle))?;
        self.heaps
            .read()
            .get(id)
            .cloned()
            .ok_or(Error::InvalidHandle(handle))
    }

    /// Destroy a heap, its range can be handed to a new heap afterwards.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidHandle`] if `handle` doesn't name a live heap.
    pub fn destroy(&self, handle: HeapHandle) -> crate::Result<()> {
        let id = handle.id().ok_or(Error::InvalidHandle(handle))?;
        let mut heaps = self.heaps.write();
        if !heaps.contains(id) {
            return Err(Error::InvalidHandle(handle));
        }
        let heap = heaps.dealloc(id);
        tracing::debug!(
            "destroyed {:?} heap {handle} over {}+{:#x}",
            heap.kind(),
            heap.base(),
            heap.size()
        );
        Ok(())
    }

    pub fn contains(&self, handle: HeapHandle) -> bool {
        handle.id().is_some_and(|id| self.heaps.read().contains(id))
    }

    pub fn len(&self) -> usize {
        self.heaps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn overlaps(heap: &dyn HeapAllocator, base: GuestAddr, size: u32) -> bool {
    let a0 = u64::from(heap.base().get());
    let a1 = a0 + u64::from(heap.size());
    let b0 = u64::from(base.get());
    let b1 = b0 + u64::from(size);
    a0 < b1 && b0 < a1
}
