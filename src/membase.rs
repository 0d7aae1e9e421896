//! Host implementations of the guest visible membase functions.
//!
//! Each function receives its arguments as raw register words and returns
//! the raw word guest code gets back in r3. Failures are reported as errors
//! and never folded into a null return value.

use crate::context::CoreContext;
use crate::guest_memory::GuestAddr;
use crate::heap::HeapHandle;
use crate::Error;

fn arg(args: &[u32], index: usize) -> crate::Result<u32> {
    args.get(index)
        .copied()
        .ok_or(Error::InvalidArgument("missing function argument"))
}

fn signed_arg(args: &[u32], index: usize) -> crate::Result<i32> {
    arg(args, index).map(|raw| i32::from_ne_bytes(raw.to_ne_bytes()))
}

fn unsigned(value: i32) -> u32 {
    u32::from_ne_bytes(value.to_ne_bytes())
}

/// `MEMGetBaseHeapHandle(arena) -> handle`
pub(crate) fn get_base_heap_handle(ctx: &CoreContext, args: &[u32]) -> crate::Result<u32> {
    let arena = signed_arg(args, 0)?;
    Ok(ctx.arenas().get(arena).raw())
}

/// `MEMSetBaseHeapHandle(arena, handle) -> previous`
pub(crate) fn set_base_heap_handle(ctx: &CoreContext, args: &[u32]) -> crate::Result<u32> {
    let arena = signed_arg(args, 0)?;
    let handle = HeapHandle::from_raw(arg(args, 1)?);
    Ok(ctx.arenas().set(arena, handle).raw())
}

/// `MEMGetArena(handle) -> arena`
pub(crate) fn get_arena(ctx: &CoreContext, args: &[u32]) -> crate::Result<u32> {
    let handle = HeapHandle::from_raw(arg(args, 0)?);
    Ok(unsigned(ctx.arenas().arena_of_raw(handle)))
}

/// `OSAllocFromSystem(size, align) -> ptr`
pub(crate) fn alloc_from_system(ctx: &CoreContext, args: &[u32]) -> crate::Result<u32> {
    let (size, align) = (arg(args, 0)?, signed_arg(args, 1)?);
    let addr = ctx.system_heap_allocator()?.allocate_aligned(size, align)?;
    Ok(addr.get())
}

/// `OSFreeToSystem(ptr)`
pub(crate) fn free_to_system(ctx: &CoreContext, args: &[u32]) -> crate::Result<u32> {
    let addr = GuestAddr::new(arg(args, 0)?);
    ctx.system_heap_allocator()?.free(addr)?;
    Ok(0)
}

/// Default target of the `MEMAllocFromDefaultHeap` cell.
pub(crate) fn alloc_from_default_heap(ctx: &CoreContext, args: &[u32]) -> crate::Result<u32> {
    let size = arg(args, 0)?;
    let addr = ctx.default_heap_checked()?.allocate(size)?;
    Ok(addr.get())
}

/// Default target of the `MEMAllocFromDefaultHeapEx` cell.
pub(crate) fn alloc_from_default_heap_ex(ctx: &CoreContext, args: &[u32]) -> crate::Result<u32> {
    let (size, align) = (arg(args, 0)?, signed_arg(args, 1)?);
    let addr = ctx.default_heap_checked()?.allocate_aligned(size, align)?;
    Ok(addr.get())
}

/// Default target of the `MEMFreeToDefaultHeap` cell.
pub(crate) fn free_to_default_heap(ctx: &CoreContext, args: &[u32]) -> crate::Result<u32> {
    let addr = GuestAddr::new(arg(args, 0)?);
    ctx.default_heap_checked()?.free(addr)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::StaticPlatform;
    use crate::layout::{MemoryKind, MemoryLayout};

    fn booted() -> CoreContext {
        let layout = MemoryLayout::default()
            .with_region(MemoryKind::Mem1, 0xF400_0000, 0x1_0000)
            .with_region(MemoryKind::Mem2, 0x1000_0000, 0x1_0000)
            .with_region(MemoryKind::Foreground, 0xE000_0000, 0x1_0000)
            .with_region(MemoryKind::System, 0x0200_0000, 0x1_0000);
        let mut ctx = CoreContext::new(&layout).unwrap();
        ctx.boot(&StaticPlatform::new(&layout)).unwrap();
        ctx
    }

    #[test]
    fn base_heap_handles() {
        let ctx = booted();
        let mem2 = get_base_heap_handle(&ctx, &[1]).unwrap();
        assert_ne!(mem2, 0);
        assert_eq!(get_arena(&ctx, &[mem2]).unwrap(), 1);

        // out of range arenas read as null and swallow writes
        assert_eq!(get_base_heap_handle(&ctx, &[unsigned(-1)]).unwrap(), 0);
        assert_eq!(set_base_heap_handle(&ctx, &[3, mem2]).unwrap(), 0);

        let previous = set_base_heap_handle(&ctx, &[2, mem2]).unwrap();
        assert_ne!(previous, 0);
        assert_eq!(get_base_heap_handle(&ctx, &[2]).unwrap(), mem2);

        let system = ctx.system_heap().raw();
        assert_eq!(get_arena(&ctx, &[system]).unwrap(), 4);
    }

    #[test]
    fn system_allocations() {
        let ctx = booted();
        let addr = alloc_from_system(&ctx, &[0x20, unsigned(-16)]).unwrap();
        assert_eq!(addr % 16, 0);
        assert!(ctx
            .system_heap_allocator()
            .unwrap()
            .contains(GuestAddr::new(addr)));
        free_to_system(&ctx, &[addr]).unwrap();
        assert_eq!(
            free_to_system(&ctx, &[addr]),
            Err(Error::UseAfterFree(GuestAddr::new(addr)))
        );
    }

    #[test]
    fn default_heap_stubs() {
        let ctx = booted();
        let addr = alloc_from_default_heap_ex(&ctx, &[0x10, 0x100]).unwrap();
        assert_eq!(addr % 0x100, 0);
        assert!(ctx.default_heap().unwrap().contains(GuestAddr::new(addr)));
        free_to_default_heap(&ctx, &[addr]).unwrap();

        assert!(matches!(
            alloc_from_default_heap(&ctx, &[0]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc_from_default_heap(&ctx, &[]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc_from_default_heap(&ctx, &[0x2_0000]),
            Err(Error::OutOfMemory { .. })
        ));
    }
}
