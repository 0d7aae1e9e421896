//! Default heap bootstrap and teardown.
//!
//! A session walks through
//!
//! ```text
//! Uninitialized -> HeapsCreated -> FunctionsRegistered -> Initialized
//!       ^                                                      |
//!       +------------------ HeapsFreed <-----------------------+
//! ```
//!
//! [`CoreContext::boot`] performs the three forward steps,
//! [`CoreContext::teardown`] the way back. Running a step out of order is
//! an error and leaves the context untouched.

use crate::arena::BaseHeapType;
use crate::context::CoreContext;
use crate::export::{Callable, HostFunction};
use crate::guest_memory::GuestAddr;
use crate::heap::{HeapAllocator, HeapHandle};
use crate::layout::{MemoryKind, MemoryLayout};
use crate::membase;
use crate::{Error, MIN_ALIGNMENT};
use alloc::vec::Vec;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapState {
    Uninitialized,
    HeapsCreated,
    FunctionsRegistered,
    Initialized,
    HeapsFreed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The default heap operations guest code calls through an indirection cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultHeapFn {
    /// `MEMAllocFromDefaultHeap(size)`
    Alloc,
    /// `MEMAllocFromDefaultHeapEx(size, align)`
    AllocEx,
    /// `MEMFreeToDefaultHeap(ptr)`
    Free,
}

impl DefaultHeapFn {
    pub const ALL: [DefaultHeapFn; 3] = [Self::Alloc, Self::AllocEx, Self::Free];

    /// Name of the data symbol publishing the cell.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Alloc => "MEMAllocFromDefaultHeap",
            Self::AllocEx => "MEMAllocFromDefaultHeapEx",
            Self::Free => "MEMFreeToDefaultHeap",
        }
    }

    /// Name of the function the cell initially points at.
    pub fn default_target(self) -> &'static str {
        match self {
            Self::Alloc => "sMEMAllocFromDefaultHeap",
            Self::AllocEx => "sMEMAllocFromDefaultHeapEx",
            Self::Free => "sMEMFreeToDefaultHeap",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Alloc => 0,
            Self::AllocEx => 1,
            Self::Free => 2,
        }
    }
}

/// Answers "where does this kind of memory live".
///
/// Implementations report the bounds the way the platform stores them,
/// as big-endian `(base, size)` words.
pub trait PlatformMemory {
    fn memory_bounds(&self, kind: MemoryKind) -> (u32, u32);
}

/// A [`PlatformMemory`] serving the bounds of a fixed [`MemoryLayout`].
#[derive(Debug, Clone)]
pub struct StaticPlatform {
    layout: MemoryLayout,
}

impl StaticPlatform {
    pub fn new(layout: &MemoryLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }
}

impl PlatformMemory for StaticPlatform {
    fn memory_bounds(&self, kind: MemoryKind) -> (u32, u32) {
        let region = self.layout.region(kind);
        (region.base.get().to_be(), region.size.to_be())
    }
}

/// Arenas in creation order, teardown walks this backwards.
const ARENA_ORDER: [(BaseHeapType, MemoryKind); 3] = [
    (BaseHeapType::Secondary, MemoryKind::Mem2),
    (BaseHeapType::Primary, MemoryKind::Mem1),
    (BaseHeapType::Foreground, MemoryKind::Foreground),
];

const HOST_FUNCTIONS: [HostFunction; 8] = [
    HostFunction::new("MEMGetBaseHeapHandle", membase::get_base_heap_handle),
    HostFunction::new("MEMSetBaseHeapHandle", membase::set_base_heap_handle),
    HostFunction::new("MEMGetArena", membase::get_arena),
    HostFunction::new("OSAllocFromSystem", membase::alloc_from_system),
    HostFunction::new("OSFreeToSystem", membase::free_to_system),
    HostFunction::new("sMEMAllocFromDefaultHeap", membase::alloc_from_default_heap),
    HostFunction::new("sMEMAllocFromDefaultHeapEx", membase::alloc_from_default_heap_ex),
    HostFunction::new("sMEMFreeToDefaultHeap", membase::free_to_default_heap),
];

fn bounds(platform: &dyn PlatformMemory, kind: MemoryKind) -> (GuestAddr, u32) {
    let (base, size) = platform.memory_bounds(kind);
    (GuestAddr::new(u32::from_be(base)), u32::from_be(size))
}

impl CoreContext {
    /// Create the arena heaps and the system heap.
    ///
    /// MEM2 becomes an expanding heap, MEM1 and the foreground bucket frame
    /// heaps, each assigned to its arena. The system heap is an expanding
    /// heap over the system region and is not assigned to any arena. If
    /// any heap can't be created the ones already created are destroyed again.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] unless the context is
    /// uninitialized, otherwise with the heap creation error.
    pub fn create_heaps(&mut self, platform: &dyn PlatformMemory) -> crate::Result<()> {
        self.expect_state(BootstrapState::Uninitialized)?;

        let mut created: Vec<(Option<BaseHeapType>, HeapHandle)> = Vec::with_capacity(4);
        let result = self.create_heaps_inner(platform, &mut created);

        if let Err(err) = result {
            tracing::warn!("heap creation failed, rolling back: {err}");
            for (arena, handle) in created.into_iter().rev() {
                if let Some(arena) = arena {
                    self.arenas.set(arena.raw(), HeapHandle::NULL);
                }
                if let Err(err) = self.heaps.destroy(handle) {
                    tracing::warn!("failed to destroy heap {handle} during rollback: {err}");
                }
            }
            self.arena_heaps = [HeapHandle::NULL; 3];
            self.system_heap = HeapHandle::NULL;
            return Err(err);
        }

        self.state = BootstrapState::HeapsCreated;
        Ok(())
    }

    fn create_heaps_inner(
        &mut self,
        platform: &dyn PlatformMemory,
        created: &mut Vec<(Option<BaseHeapType>, HeapHandle)>,
    ) -> crate::Result<()> {
        for (arena, kind) in ARENA_ORDER {
            let (base, size) = bounds(platform, kind);
            let handle = match arena {
                BaseHeapType::Secondary => self.heaps.create_expanding(&self.space, base, size)?,
                BaseHeapType::Primary | BaseHeapType::Foreground => {
                    self.heaps.create_frame(&self.space, base, size)?
                }
            };
            created.push((Some(arena), handle));

            self.arenas.set(arena.raw(), handle);
            self.arena_heaps[arena.slot()] = handle;
            tracing::debug!("{arena} arena heap {handle} over {base}+{size:#x}");
        }

        let (base, size) = bounds(platform, MemoryKind::System);
        let handle = self.heaps.create_expanding(&self.space, base, size)?;
        created.push((None, handle));
        self.system_heap = handle;
        tracing::debug!("system heap {handle} over {base}+{size:#x}");

        Ok(())
    }

    /// Export the membase functions and the default heap stubs.
    ///
    /// Exports are only generated the first time this runs on a context,
    /// later sessions reuse them.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] unless the heaps were just created,
    /// or if the thunk region is exhausted.
    pub fn register_functions(&mut self) -> crate::Result<()> {
        self.expect_state(BootstrapState::HeapsCreated)?;

        if self.functions_registered {
            tracing::debug!("membase functions already registered");
        } else {
            for func in HOST_FUNCTIONS {
                self.register_function(func.name(), Callable::Host(func))?;
            }
            self.functions_registered = true;
        }

        self.state = BootstrapState::FunctionsRegistered;
        Ok(())
    }

    /// Allocate the default heap indirection cells from the system heap,
    /// point each at its default stub and publish them as data symbols.
    ///
    /// The exports are append-only, so after [`CoreContext::teardown`] the
    /// data symbols keep resolving to the released cells until the next
    /// session publishes fresh ones.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] unless the functions were just
    /// registered, or if the system heap can't fit the cells. Cells
    /// allocated before the failure are released again.
    pub fn initialise(&mut self) -> crate::Result<()> {
        self.expect_state(BootstrapState::FunctionsRegistered)?;
        let system = self.system_heap_allocator()?;

        let mut cells = [GuestAddr::NULL; 3];
        if let Err(err) = self.populate_cells(system.as_ref(), &mut cells) {
            for cell in cells {
                if let Err(err) = system.free(cell) {
                    tracing::warn!("failed to release cell {cell}: {err}");
                }
            }
            return Err(err);
        }

        for f in DefaultHeapFn::ALL {
            self.exports.register_data(f.symbol(), cells[f.index()]);
        }
        self.cells = cells;
        self.state = BootstrapState::Initialized;

        tracing::debug!("default heap initialised");
        Ok(())
    }

    fn populate_cells(
        &self,
        system: &dyn HeapAllocator,
        cells: &mut [GuestAddr; 3],
    ) -> crate::Result<()> {
        for f in DefaultHeapFn::ALL {
            let target = self.exports.resolve(f.default_target())?;
            let cell = system.allocate_aligned(4, MIN_ALIGNMENT)?;
            cells[f.index()] = cell;
            self.space.write_addr(cell, target)?;
        }
        Ok(())
    }

    /// Create the heaps, register the functions and initialise the cells.
    ///
    /// # Errors
    ///
    /// Fails with the first step that fails.
    pub fn boot(&mut self, platform: &dyn PlatformMemory) -> crate::Result<()> {
        self.create_heaps(platform)?;
        self.register_functions()?;
        self.initialise()
    }

    /// Destroy the arena heaps, release the indirection cells and destroy
    /// the system heap.
    ///
    /// Arena slots are cleared in reverse creation order. A slot the guest
    /// pointed at a different heap is cleared as well but only the heap
    /// created for the arena is destroyed.
    ///
    /// Every step runs even if an earlier one fails, so the context always
    /// ends up `Uninitialized` and can be booted again.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidState`] unless the context is initialised.
    /// Otherwise returns the first error hit while releasing, for example
    /// [`Error::UseAfterFree`] if guest code already freed a cell.
    pub fn teardown(&mut self) -> crate::Result<()> {
        self.expect_state(BootstrapState::Initialized)?;
        let mut first_err = None;

        for (arena, _) in ARENA_ORDER.into_iter().rev() {
            let slot = arena.slot();
            let created = core::mem::replace(&mut self.arena_heaps[slot], HeapHandle::NULL);
            let assigned = self.arenas.set(arena.raw(), HeapHandle::NULL);
            if assigned != created {
                tracing::warn!("{arena} arena held heap {assigned} instead of {created}");
            }

            if self.heaps.contains(created) {
                if let Err(err) = self.heaps.destroy(created) {
                    tracing::warn!("failed to destroy {arena} arena heap {created}: {err}");
                    first_err.get_or_insert(err);
                }
            } else {
                tracing::warn!("{arena} arena heap {created} was already destroyed");
            }
        }
        self.state = BootstrapState::HeapsFreed;

        let cells = core::mem::replace(&mut self.cells, [GuestAddr::NULL; 3]);
        match self.system_heap_allocator() {
            Ok(system) => {
                for cell in cells {
                    if let Err(err) = system.free(cell) {
                        tracing::error!("failed to release cell {cell}: {err}");
                        first_err.get_or_insert(err);
                    }
                }
            }
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }

        let system = core::mem::replace(&mut self.system_heap, HeapHandle::NULL);
        if self.heaps.contains(system) {
            if let Err(err) = self.heaps.destroy(system) {
                first_err.get_or_insert(err);
            }
        }
        self.state = BootstrapState::Uninitialized;

        match first_err {
            Some(err) => {
                tracing::warn!("default heap torn down with errors: {err}");
                Err(err)
            }
            None => {
                tracing::debug!("default heap torn down");
                Ok(())
            }
        }
    }

    /// Point the cell of `f` at `target`.
    ///
    /// Guest code calls through the cell, so every caller picks up the new
    /// target without re-resolving the symbol.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotInitialized`] before the cells exist.
    pub fn retarget_default_heap(&self, f: DefaultHeapFn, target: GuestAddr) -> crate::Result<()> {
        if self.state != BootstrapState::Initialized {
            return Err(Error::NotInitialized);
        }
        self.space.write_addr(self.default_heap_cell(f), target)?;
        tracing::debug!("{} now calls {target}", f.symbol());
        Ok(())
    }

    fn expect_state(&self, expected: BootstrapState) -> crate::Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout() -> MemoryLayout {
        MemoryLayout::default()
            .with_region(MemoryKind::Mem1, 0xF400_0000, 0x10_0000)
            .with_region(MemoryKind::Mem2, 0x1000_0000, 0x4_0000)
            .with_region(MemoryKind::Foreground, 0xE000_0000, 0x10_0000)
            .with_region(MemoryKind::System, 0x0200_0000, 0x1_0000)
    }

    #[test]
    fn platform_bounds_are_big_endian() {
        let layout = small_layout();
        let platform = StaticPlatform::new(&layout);
        let (base, size) = platform.memory_bounds(MemoryKind::Mem2);
        assert_eq!(base, 0x1000_0000_u32.to_be());
        assert_eq!(size, 0x4_0000_u32.to_be());
        assert_eq!(
            bounds(&platform, MemoryKind::Mem2),
            (GuestAddr::new(0x1000_0000), 0x4_0000)
        );
    }

    #[test]
    fn steps_must_run_in_order() {
        let layout = small_layout();
        let mut ctx = CoreContext::new(&layout).unwrap();

        assert_eq!(
            ctx.register_functions(),
            Err(Error::InvalidState {
                expected: BootstrapState::HeapsCreated,
                actual: BootstrapState::Uninitialized
            })
        );
        assert!(ctx.initialise().is_err());
        assert!(ctx.teardown().is_err());

        ctx.create_heaps(&StaticPlatform::new(&layout)).unwrap();
        assert_eq!(ctx.state(), BootstrapState::HeapsCreated);
        assert!(ctx.create_heaps(&StaticPlatform::new(&layout)).is_err());
        assert!(ctx.initialise().is_err());

        ctx.register_functions().unwrap();
        ctx.initialise().unwrap();
        assert_eq!(ctx.state(), BootstrapState::Initialized);
    }

    #[test]
    fn heaps_land_in_their_arenas() {
        let layout = small_layout();
        let mut ctx = CoreContext::new(&layout).unwrap();
        ctx.create_heaps(&StaticPlatform::new(&layout)).unwrap();

        let mem2 = ctx.arena_heap(BaseHeapType::Secondary).unwrap();
        assert!(mem2.as_expanding().is_some());
        assert_eq!(mem2.range(), (GuestAddr::new(0x1000_0000), 0x4_0000));

        let mem1 = ctx.arena_heap(BaseHeapType::Primary).unwrap();
        assert!(mem1.as_frame().is_some());
        let fg = ctx.arena_heap(BaseHeapType::Foreground).unwrap();
        assert!(fg.as_frame().is_some());

        let system = ctx.system_heap_allocator().unwrap();
        assert_eq!(system.base(), GuestAddr::new(0x0200_0000));
        assert_eq!(ctx.arenas().arena_of(ctx.system_heap()), None);
        assert_eq!(ctx.heaps().len(), 4);
    }

    #[test]
    fn failed_creation_rolls_back() {
        let layout = small_layout();
        let mut ctx = CoreContext::new(&layout).unwrap();

        // system bounds outside of any mapped region
        let broken = StaticPlatform::new(
            &layout
                .clone()
                .with_region(MemoryKind::System, 0x0300_0000, 0x1_0000),
        );
        assert!(ctx.create_heaps(&broken).is_err());
        assert_eq!(ctx.state(), BootstrapState::Uninitialized);
        assert!(ctx.heaps().is_empty());
        for ty in BaseHeapType::ALL {
            assert!(ctx.arenas().get(ty.raw()).is_null());
        }

        ctx.boot(&StaticPlatform::new(&layout)).unwrap();
    }

    #[test]
    fn cells_point_at_the_default_stubs() {
        let layout = small_layout();
        let mut ctx = CoreContext::new(&layout).unwrap();
        ctx.boot(&StaticPlatform::new(&layout)).unwrap();

        for f in DefaultHeapFn::ALL {
            let cell = ctx.exports().resolve(f.symbol()).unwrap();
            assert_eq!(cell, ctx.default_heap_cell(f));
            assert!(ctx.system_heap_allocator().unwrap().contains(cell));

            let target = ctx.space().read_addr(cell).unwrap();
            assert_eq!(target, ctx.exports().resolve(f.default_target()).unwrap());
            assert_eq!(
                ctx.exports().function_at(target).unwrap().name(),
                f.default_target()
            );
        }
    }

    #[test]
    fn teardown_releases_everything() {
        let layout = small_layout();
        let mut ctx = CoreContext::new(&layout).unwrap();
        ctx.boot(&StaticPlatform::new(&layout)).unwrap();
        ctx.teardown().unwrap();

        assert_eq!(ctx.state(), BootstrapState::Uninitialized);
        assert!(ctx.heaps().is_empty());
        assert!(ctx.system_heap().is_null());

        // a second session reuses the exports
        let exports = ctx.exports().len();
        ctx.boot(&StaticPlatform::new(&layout)).unwrap();
        assert_eq!(ctx.exports().len(), exports);
        assert!(ctx.alloc_from_default_heap(16).is_ok());
    }

    fn call(ctx: &CoreContext, name: &str, args: &[u32]) -> crate::Result<u32> {
        let addr = ctx.exports().resolve(name)?;
        let func = ctx
            .exports()
            .function_at(addr)
            .ok_or(Error::InvalidAddress(addr))?;
        func.invoke(ctx, args)
    }

    #[test]
    fn stubs_refuse_calls_outside_a_session() {
        let layout = small_layout();
        let mut ctx = CoreContext::new(&layout).unwrap();
        ctx.create_heaps(&StaticPlatform::new(&layout)).unwrap();
        ctx.register_functions().unwrap();

        let assert_refused = |ctx: &CoreContext| {
            assert_eq!(
                call(ctx, "sMEMAllocFromDefaultHeap", &[64]),
                Err(Error::NotInitialized)
            );
            assert_eq!(
                call(ctx, "sMEMAllocFromDefaultHeapEx", &[64, 0x40]),
                Err(Error::NotInitialized)
            );
            assert_eq!(
                call(ctx, "sMEMFreeToDefaultHeap", &[0x1000_0000]),
                Err(Error::NotInitialized)
            );
        };

        // heaps exist but the cells aren't published yet
        assert_refused(&ctx);
        let mem2 = ctx.default_heap().unwrap();
        assert_eq!(mem2.free_size(), 0x4_0000);

        ctx.initialise().unwrap();
        let addr = call(&ctx, "sMEMAllocFromDefaultHeap", &[64]).unwrap();
        call(&ctx, "sMEMFreeToDefaultHeap", &[addr]).unwrap();

        ctx.teardown().unwrap();
        assert_refused(&ctx);
    }

    #[test]
    fn teardown_survives_a_cell_freed_by_the_guest() {
        let layout = small_layout();
        let mut ctx = CoreContext::new(&layout).unwrap();
        ctx.boot(&StaticPlatform::new(&layout)).unwrap();

        let cell = ctx.default_heap_cell(DefaultHeapFn::Alloc);
        call(&ctx, "OSFreeToSystem", &[cell.get()]).unwrap();

        let err = ctx.teardown().unwrap_err();
        assert_eq!(err, Error::UseAfterFree(cell));
        assert!(err.is_session_fatal());

        assert_eq!(ctx.state(), BootstrapState::Uninitialized);
        assert!(ctx.heaps().is_empty());
        assert!(ctx.system_heap().is_null());
        for f in DefaultHeapFn::ALL {
            assert!(ctx.default_heap_cell(f).is_null());
        }
        for ty in BaseHeapType::ALL {
            assert!(ctx.arenas().get(ty.raw()).is_null());
        }

        ctx.boot(&StaticPlatform::new(&layout)).unwrap();
        let addr = ctx.alloc_from_default_heap(16).unwrap();
        ctx.free_to_default_heap(addr).unwrap();
        ctx.teardown().unwrap();
    }

    #[test]
    fn failed_initialise_releases_its_cells() {
        let layout = small_layout();
        let mut ctx = CoreContext::new(&layout).unwrap();

        // room for at most two of the three cells
        let cramped = StaticPlatform::new(
            &layout
                .clone()
                .with_region(MemoryKind::System, 0x0200_0000, 8),
        );
        ctx.create_heaps(&cramped).unwrap();
        ctx.register_functions().unwrap();

        assert!(matches!(
            ctx.initialise(),
            Err(Error::OutOfMemory { .. })
        ));
        assert_eq!(ctx.state(), BootstrapState::FunctionsRegistered);
        assert_eq!(ctx.system_heap_allocator().unwrap().free_size(), 8);
        for f in DefaultHeapFn::ALL {
            assert!(ctx.default_heap_cell(f).is_null());
            assert!(ctx.exports().resolve(f.symbol()).is_err());
        }
    }

    #[test]
    fn cell_exports_outlive_the_session() {
        let layout = small_layout();
        let mut ctx = CoreContext::new(&layout).unwrap();
        let platform = StaticPlatform::new(&layout);

        ctx.boot(&platform).unwrap();
        let first = ctx.exports().resolve(DefaultHeapFn::Free.symbol()).unwrap();
        ctx.teardown().unwrap();

        // still resolvable, but nothing backs it until the next session
        assert_eq!(
            ctx.exports().resolve(DefaultHeapFn::Free.symbol()).unwrap(),
            first
        );
        assert!(ctx.default_heap_cell(DefaultHeapFn::Free).is_null());

        ctx.boot(&platform).unwrap();
        assert_eq!(
            ctx.exports().resolve(DefaultHeapFn::Free.symbol()).unwrap(),
            ctx.default_heap_cell(DefaultHeapFn::Free)
        );
    }

    #[test]
    fn retargeting_a_cell() {
        let layout = small_layout();
        let mut ctx = CoreContext::new(&layout).unwrap();
        ctx.boot(&StaticPlatform::new(&layout)).unwrap();

        let system_alloc = ctx.exports().resolve("OSAllocFromSystem").unwrap();
        ctx.retarget_default_heap(DefaultHeapFn::AllocEx, system_alloc)
            .unwrap();

        let addr = ctx.alloc_from_default_heap_ex(8, 4).unwrap();
        assert!(ctx.system_heap_allocator().unwrap().contains(addr));

        // the plain variant still uses the MEM2 heap
        let addr = ctx.alloc_from_default_heap(8).unwrap();
        assert!(ctx.default_heap().unwrap().contains(addr));
    }
}
