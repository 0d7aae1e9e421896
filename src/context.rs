use crate::arena::{ArenaRegistry, BaseHeapType};
use crate::bootstrap::{BootstrapState, DefaultHeapFn};
use crate::export::{Callable, ExportTable};
use crate::guest_memory::{AddressSpace, GuestAddr};
use crate::heap::{HeapAllocator, HeapHandle, HeapTable};
use crate::layout::MemoryLayout;
use crate::Error;
use alloc::sync::Arc;

/// Everything the memory half of `coreinit` needs, owned in one place.
///
/// Setup (bootstrap, teardown and export registration) takes `&mut self`
/// and is expected to run before guest threads start. Everything guest
/// code can reach at runtime takes `&self`, so a context can be shared
/// between emulated cores.
#[derive(Debug)]
pub struct CoreContext {
    pub(crate) space: AddressSpace,
    pub(crate) heaps: HeapTable,
    pub(crate) arenas: ArenaRegistry,
    pub(crate) exports: ExportTable,
    pub(crate) state: BootstrapState,
    /// Heaps created for each arena, indexed by raw [`BaseHeapType`].
    pub(crate) arena_heaps: [HeapHandle; 3],
    pub(crate) system_heap: HeapHandle,
    /// Default heap indirection cells, indexed by [`DefaultHeapFn`].
    pub(crate) cells: [GuestAddr; 3],
    pub(crate) functions_registered: bool,
}

impl CoreContext {
    /// Map the regions of `layout` and set up empty heap, arena and export
    /// tables. No heaps exist until [`CoreContext::boot`] runs.
    ///
    /// # Errors
    ///
    /// Fails if the layout's regions overlap or can't be backed by host memory.
    pub fn new(layout: &MemoryLayout) -> crate::Result<Self> {
        let space = AddressSpace::from_layout(layout)?;
        Ok(Self::with_address_space(space, layout))
    }

    /// Like [`CoreContext::new`] with an address space the caller already mapped.
    pub fn with_address_space(space: AddressSpace, layout: &MemoryLayout) -> Self {
        Self {
            space,
            heaps: HeapTable::new(),
            arenas: ArenaRegistry::new(),
            exports: ExportTable::new(layout.thunks.base, layout.thunks.size),
            state: BootstrapState::Uninitialized,
            arena_heaps: [HeapHandle::NULL; 3],
            system_heap: HeapHandle::NULL,
            cells: [GuestAddr::NULL; 3],
            functions_registered: false,
        }
    }

    #[inline]
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    #[inline]
    pub fn heaps(&self) -> &HeapTable {
        &self.heaps
    }

    #[inline]
    pub fn arenas(&self) -> &ArenaRegistry {
        &self.arenas
    }

    #[inline]
    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    #[inline]
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Handle of the system heap, null outside of a booted session.
    #[inline]
    pub fn system_heap(&self) -> HeapHandle {
        self.system_heap
    }

    /// Address of the indirection cell guest code calls `f` through, null
    /// until the bootstrap is initialised.
    pub fn default_heap_cell(&self, f: DefaultHeapFn) -> GuestAddr {
        self.cells[f.index()]
    }

    /// Export a function, see [`ExportTable::register_function`].
    ///
    /// # Errors
    ///
    /// Fails if no thunk could be generated for a host function.
    pub fn register_function(&mut self, name: &str, callable: Callable) -> crate::Result<GuestAddr> {
        self.exports.register_function(&self.space, name, callable)
    }

    /// The heap currently assigned to `arena`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidHandle`] if the arena is empty or its
    /// handle is stale.
    pub fn arena_heap(&self, arena: BaseHeapType) -> crate::Result<Arc<dyn HeapAllocator>> {
        self.heaps.get(self.arenas.get(arena.raw()))
    }

    /// The heap default heap allocations are served from, the MEM2 arena.
    ///
    /// # Errors
    ///
    /// See [`CoreContext::arena_heap`].
    pub fn default_heap(&self) -> crate::Result<Arc<dyn HeapAllocator>> {
        self.arena_heap(BaseHeapType::Secondary)
    }

    /// Like [`CoreContext::default_heap`], but only inside an initialised session.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotInitialized`] unless the bootstrap completed.
    pub fn default_heap_checked(&self) -> crate::Result<Arc<dyn HeapAllocator>> {
        if self.state != BootstrapState::Initialized {
            return Err(Error::NotInitialized);
        }
        self.default_heap()
    }

    /// # Errors
    ///
    /// Fails with [`Error::InvalidHandle`] outside of a booted session.
    pub fn system_heap_allocator(&self) -> crate::Result<Arc<dyn HeapAllocator>> {
        self.heaps.get(self.system_heap)
    }

    /// Allocate `size` bytes the way guest code calling
    /// `MEMAllocFromDefaultHeap` would.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotInitialized`] before the bootstrap completed,
    /// otherwise with whatever the default heap reports.
    pub fn alloc_from_default_heap(&self, size: u32) -> crate::Result<GuestAddr> {
        self.call_default_heap(DefaultHeapFn::Alloc, &[size])
            .map(GuestAddr::new)
    }

    /// Allocate `size` bytes aligned to `align` the way guest code calling
    /// `MEMAllocFromDefaultHeapEx` would. Negative alignments allocate from
    /// the tail of the heap.
    ///
    /// # Errors
    ///
    /// See [`CoreContext::alloc_from_default_heap`].
    pub fn alloc_from_default_heap_ex(&self, size: u32, align: i32) -> crate::Result<GuestAddr> {
        let align = u32::from_ne_bytes(align.to_ne_bytes());
        self.call_default_heap(DefaultHeapFn::AllocEx, &[size, align])
            .map(GuestAddr::new)
    }

    /// Free `addr` the way guest code calling `MEMFreeToDefaultHeap` would.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotInitialized`] before the bootstrap completed and
    /// with [`Error::UseAfterFree`] for addresses the heap doesn't own.
    pub fn free_to_default_heap(&self, addr: GuestAddr) -> crate::Result<()> {
        self.call_default_heap(DefaultHeapFn::Free, &[addr.get()])
            .map(|_| ())
    }

    /// Call through an indirection cell like guest code does: load the
    /// function pointer stored in the cell and dispatch the thunk it points at.
    fn call_default_heap(&self, f: DefaultHeapFn, args: &[u32]) -> crate::Result<u32> {
        if self.state != BootstrapState::Initialized {
            return Err(Error::NotInitialized);
        }

        let target = self.space.read_addr(self.default_heap_cell(f))?;
        let func = self
            .exports
            .function_at(target)
            .ok_or(Error::InvalidAddress(target))?;
        func.invoke(self, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn context_is_shareable() {
        assert_send_sync::<CoreContext>();
    }

    #[test]
    fn default_heap_needs_a_bootstrap() {
        let ctx = CoreContext::new(&MemoryLayout::default()).unwrap();
        assert_eq!(ctx.state(), BootstrapState::Uninitialized);
        assert_eq!(ctx.alloc_from_default_heap(4), Err(Error::NotInitialized));
        assert_eq!(
            ctx.alloc_from_default_heap_ex(4, -8),
            Err(Error::NotInitialized)
        );
        assert_eq!(
            ctx.free_to_default_heap(GuestAddr::new(0x1000_0000)),
            Err(Error::NotInitialized)
        );
        assert!(ctx.default_heap().is_err());
        assert!(ctx.default_heap_cell(DefaultHeapFn::Alloc).is_null());
    }
}
