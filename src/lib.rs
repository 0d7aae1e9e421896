#![cfg_attr(feature = "no_std", no_std)]

//! Guest memory and heap virtualization for the Cafe OS `coreinit` library.
//!
//! The crate reproduces the console's dynamic memory model on the host:
//!
//! - [`AddressSpace`] maps 32-bit guest addresses onto host memory and owns
//!   the big-endian boundary every guest-visible value crosses.
//! - [`HeapAllocator`] is implemented by the [`ExpandingHeap`] (free-list)
//!   and the [`FrameHeap`] (two-ended bump allocator with watermarks).
//! - [`ArenaRegistry`] associates the base heap types (MEM1, MEM2,
//!   foreground) with live heap handles.
//! - [`ExportTable`] resolves symbol names to guest-callable addresses and
//!   generates thunks for host-implemented functions.
//! - [`CoreContext`] owns all of the above and drives the default heap
//!   bootstrap/teardown state machine.
//!
//! ```
//! use cafe_mem::{BaseHeapType, CoreContext, MemoryLayout, StaticPlatform};
//!
//! let layout = MemoryLayout::default();
//! let mut ctx = CoreContext::new(&layout).unwrap();
//! ctx.boot(&StaticPlatform::new(&layout)).unwrap();
//!
//! let ptr = ctx.alloc_from_default_heap(64).unwrap();
//! assert!(!ctx.arenas().get(BaseHeapType::Secondary.raw()).is_null());
//! ctx.free_to_default_heap(ptr).unwrap();
//! ctx.teardown().unwrap();
//! ```

extern crate alloc;
extern crate core;

mod arena;
mod bootstrap;
mod context;
mod errors;
mod export;
mod guest_memory;
mod heap;
mod indices;
mod layout;
mod membase;

pub use arena::{ArenaRegistry, BaseHeapType};
pub use bootstrap::{BootstrapState, DefaultHeapFn, PlatformMemory, StaticPlatform};
pub use context::CoreContext;
pub use errors::Error;
pub use export::{Callable, ExportEntry, ExportKind, ExportTable, HostFn, HostFunction};
pub use guest_memory::{AddressSpace, GuestAddr, GuestView};
pub use heap::{
    ExpandingHeap, FrameHeap, FrameRelease, HeapAllocator, HeapHandle, HeapKind, HeapTable,
    Watermark,
};
pub use indices::{ExportIndex, RegionIndex};
pub use layout::{MemoryKind, MemoryLayout, RegionDescriptor};

pub type Result<T> = core::result::Result<T, Error>;

/***************** Settings *******************************************/
/// Alignment used by every allocation that doesn't ask for one explicitly,
/// and the smallest alignment any heap hands out. Alignments are signed like
/// on the guest, a negative alignment allocates from the tail of a heap.
pub const MIN_ALIGNMENT: i32 = 4;
/// A free remainder must be larger than this many bytes to be split off
/// an expanding heap block, smaller remainders stay with the allocation.
pub const MIN_SPLIT_SIZE: u32 = 16;
/// Size of one generated host function thunk in bytes.
pub const THUNK_SIZE: u32 = 8;
/// Primary opcode 1 is unused by the PowerPC ISA, the emulator claims it
/// as the "kernel call" instruction. The low 26 bits carry the export index.
pub const KERNEL_CALL_OPCODE: u32 = 1 << 26;
/// Mask selecting the export index out of a kernel call instruction.
pub const KERNEL_CALL_INDEX_MASK: u32 = KERNEL_CALL_OPCODE - 1;
/// `blr`, return to the caller through the link register.
pub const BLR_INSTRUCTION: u32 = 0x4E80_0020;

/// Returns the host page size in bytes.
pub fn host_page_size() -> usize {
    // Safety: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}
