use crate::guest_memory::{round_usize_up_to_host_pages, GuestAddr, GuestView, Mmap};
use crate::indices::RegionIndex;
use crate::layout::{MemoryLayout, RegionDescriptor};
use crate::Error;
use core::ptr;
use core::ptr::NonNull;
use cranelift_entity::PrimaryMap;

macro_rules! be_accessors {
    ($(($ty:ty, $read:ident, $write:ident))*) => ($(
        /// Read a big-endian value from guest memory, returned in host byte order.
        ///
        /// # Errors
        ///
        /// Fails with [`Error::InvalidAddress`] if any byte of the value lies
        /// outside of a mapped region.
        #[inline]
        pub fn $read(&self, addr: GuestAddr) -> crate::Result<$ty> {
            let mut bytes = [0; size_of::<$ty>()];
            self.read_bytes(addr, &mut bytes)?;
            Ok(<$ty>::from_be_bytes(bytes))
        }

        /// Write a host byte order value to guest memory as big-endian.
        ///
        /// # Errors
        ///
        /// Fails with [`Error::InvalidAddress`] if any byte of the value lies
        /// outside of a mapped region.
        #[inline]
        pub fn $write(&self, addr: GuestAddr, value: $ty) -> crate::Result<()> {
            self.write_bytes(addr, &value.to_be_bytes())
        }
    )*)
}

#[derive(Debug)]
struct MappedRegion {
    desc: RegionDescriptor,
    mmap: Mmap,
}

/// The guest's 32-bit physical address space.
///
/// Only addresses inside a mapped [`RegionDescriptor`] are valid, each
/// region is backed by its own host mapping. Every multibyte value read or
/// written through the address space crosses the big-endian boundary here,
/// callers only ever see host byte order.
///
/// Accessors take `&self`: guest memory is shared by every emulated guest
/// thread, exactly like the real hardware it isn't guarded by a lock.
#[derive(Debug, Default)]
pub struct AddressSpace {
    regions: PrimaryMap<RegionIndex, MappedRegion>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every region of `layout`.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::map_region`].
    pub fn from_layout(layout: &MemoryLayout) -> crate::Result<Self> {
        let mut this = Self::new();
        for desc in layout.regions() {
            this.map_region(*desc)?;
        }
        Ok(this)
    }

    /// Back the region described by `desc` with fresh zeroed host memory.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] for a null base, an empty region
    /// or a region wrapping the end of the address space, with
    /// [`Error::RangeOverlap`] if it overlaps an already mapped region and
    /// with [`Error::Mmap`] if the host mapping fails.
    pub fn map_region(&mut self, desc: RegionDescriptor) -> crate::Result<RegionIndex> {
        if desc.base.is_null() {
            return Err(Error::InvalidArgument("region base must not be null"));
        }
        if desc.size == 0 {
            return Err(Error::InvalidArgument("region must not be empty"));
        }
        if desc.end().is_none() {
            return Err(Error::InvalidArgument("region wraps the address space"));
        }
        if self
            .regions
            .values()
            .any(|r| r.desc.overlaps(desc.base, desc.size))
        {
            return Err(Error::RangeOverlap {
                base: desc.base,
                size: desc.size,
            });
        }

        let len = usize::try_from(desc.size)
            .ok()
            .and_then(round_usize_up_to_host_pages)
            .ok_or(Error::InvalidArgument("region too large for the host"))?;
        let mmap = Mmap::new(len)?;

        tracing::debug!(
            "mapped {} {}+{:#x} -> {:?}",
            desc.name(),
            desc.base,
            desc.size,
            mmap.host_range()
        );

        Ok(self.regions.push(MappedRegion { desc, mmap }))
    }

    pub fn region(&self, index: RegionIndex) -> Option<&RegionDescriptor> {
        self.regions.get(index).map(|r| &r.desc)
    }

    /// The region containing `addr`, if any.
    pub fn region_of(&self, addr: GuestAddr) -> Option<&RegionDescriptor> {
        self.find(addr).map(|r| &r.desc)
    }

    pub fn regions(&self) -> impl Iterator<Item = (RegionIndex, &RegionDescriptor)> + '_ {
        self.regions.iter().map(|(index, r)| (index, &r.desc))
    }

    /// Whether `base..base + size` lies entirely inside a single region.
    pub fn contains_range(&self, base: GuestAddr, size: u32) -> bool {
        self.host_range(base, size).is_ok()
    }

    /// Translate a guest address into a host pointer.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidAddress`] for null and for every address
    /// outside of a mapped region.
    pub fn translate(&self, addr: GuestAddr) -> crate::Result<NonNull<u8>> {
        let ptr = self.host_range(addr, 1)?;
        NonNull::new(ptr).ok_or(Error::InvalidAddress(addr))
    }

    /// Translate a host pointer back into the guest address it was derived from.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotGuestMemory`] if `ptr` doesn't point into the
    /// guest visible part of a mapped region.
    pub fn untranslate(&self, ptr: *const u8) -> crate::Result<GuestAddr> {
        let host = ptr as usize;
        self.regions
            .values()
            .find_map(|r| {
                let start = r.mmap.host_range().start;
                let offset = u32::try_from(host.checked_sub(start)?).ok()?;
                (offset < r.desc.size).then(|| r.desc.base.checked_add(offset))?
            })
            .ok_or(Error::NotGuestMemory)
    }

    /// A bounds checked view of `len` bytes starting at `base`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidAddress`] if the range isn't fully mapped.
    pub fn view(&self, base: GuestAddr, len: u32) -> crate::Result<GuestView<'_>> {
        self.host_range(base, len)?;
        Ok(GuestView::new(self, base, len))
    }

    /// Copy guest bytes starting at `addr` into `buf`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidAddress`] if the range isn't fully mapped.
    pub fn read_bytes(&self, addr: GuestAddr, buf: &mut [u8]) -> crate::Result<()> {
        let len = u32::try_from(buf.len()).map_err(|_| Error::InvalidAddress(addr))?;
        let src = self.host_range(addr, len)?;
        // Safety: `host_range` checked that `len` bytes starting at `src` are
        // inside the mapping, `buf` is a distinct host allocation.
        unsafe { ptr::copy_nonoverlapping(src.cast_const(), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy `bytes` into guest memory starting at `addr`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidAddress`] if the range isn't fully mapped.
    pub fn write_bytes(&self, addr: GuestAddr, bytes: &[u8]) -> crate::Result<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::InvalidAddress(addr))?;
        let dst = self.host_range(addr, len)?;
        // Safety: `host_range` checked that `len` bytes starting at `dst` are
        // inside the mapping, `bytes` is a distinct host allocation.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
        Ok(())
    }

    /// Set `len` guest bytes starting at `addr` to `value`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidAddress`] if the range isn't fully mapped.
    pub fn fill(&self, addr: GuestAddr, len: u32, value: u8) -> crate::Result<()> {
        let dst = self.host_range(addr, len)?;
        let count = usize::try_from(len).map_err(|_| Error::InvalidAddress(addr))?;
        // Safety: `host_range` checked the whole range is inside the mapping
        unsafe { ptr::write_bytes(dst, value, count) };
        Ok(())
    }

    be_accessors! {
        (u8, read_u8, write_u8)
        (u16, read_u16, write_u16)
        (u32, read_u32, write_u32)
        (u64, read_u64, write_u64)
    }

    /// Read a guest pointer stored at `addr`.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::read_u32`].
    #[inline]
    pub fn read_addr(&self, addr: GuestAddr) -> crate::Result<GuestAddr> {
        self.read_u32(addr).map(GuestAddr::new)
    }

    /// Store a guest pointer at `addr`.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::write_u32`].
    #[inline]
    pub fn write_addr(&self, addr: GuestAddr, value: GuestAddr) -> crate::Result<()> {
        self.write_u32(addr, value.get())
    }

    fn find(&self, addr: GuestAddr) -> Option<&MappedRegion> {
        self.regions.values().find(|r| r.desc.contains(addr))
    }

    /// Host pointer to `len` bytes at `addr`, all of which must lie in one region.
    fn host_range(&self, addr: GuestAddr, len: u32) -> crate::Result<*mut u8> {
        if addr.is_null() {
            return Err(Error::InvalidAddress(addr));
        }

        let region = self.find(addr).ok_or(Error::InvalidAddress(addr))?;
        let offset = addr
            .offset_from(region.desc.base)
            .ok_or(Error::InvalidAddress(addr))?;
        match offset.checked_add(len) {
            Some(end) if end <= region.desc.size => {}
            _ => return Err(Error::InvalidAddress(addr)),
        }

        let offset = usize::try_from(offset).map_err(|_| Error::InvalidAddress(addr))?;
        // Safety: `offset` is smaller than the region size, which is no larger
        // than the mapping.
        Ok(unsafe { region.mmap.as_mut_ptr().add(offset) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MemoryKind;

    fn space() -> AddressSpace {
        let mut space = AddressSpace::new();
        space
            .map_region(RegionDescriptor::new(MemoryKind::Mem2, 0x1000_0000, 0x1_0000))
            .unwrap();
        space
            .map_region(RegionDescriptor::new(MemoryKind::System, 0x0200_0000, 0x3000))
            .unwrap();
        space
    }

    #[test]
    fn translate_round_trips() {
        let space = space();
        for raw in [0x1000_0000, 0x1000_0004, 0x1000_FFFF, 0x0200_0000, 0x0200_2FFF] {
            let addr = GuestAddr::new(raw);
            let host = space.translate(addr).unwrap();
            assert_eq!(space.untranslate(host.as_ptr()).unwrap(), addr);
        }
    }

    #[test]
    fn translate_outside_regions_fails() {
        let space = space();
        for raw in [0, 0x0FFF_FFFF, 0x1001_0000, 0x0200_3000, 0xFFFF_FFFF] {
            let addr = GuestAddr::new(raw);
            assert_eq!(space.translate(addr), Err(Error::InvalidAddress(addr)));
        }
    }

    #[test]
    fn untranslate_foreign_pointer_fails() {
        let space = space();
        let local = 0_u8;
        assert_eq!(
            space.untranslate(ptr::from_ref(&local)),
            Err(Error::NotGuestMemory)
        );
    }

    #[test]
    fn values_are_stored_big_endian() {
        let space = space();
        let addr = GuestAddr::new(0x1000_0010);
        space.write_u32(addr, 0x1234_5678).unwrap();

        let mut raw = [0; 4];
        space.read_bytes(addr, &mut raw).unwrap();
        assert_eq!(raw, [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(space.read_u32(addr).unwrap(), 0x1234_5678);
        assert_eq!(space.read_u16(addr).unwrap(), 0x1234);
        assert_eq!(space.read_u8(addr.checked_add(3).unwrap()).unwrap(), 0x78);

        space.write_u64(addr, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(space.read_u32(addr.checked_add(4).unwrap()).unwrap(), 0x0506_0708);
    }

    #[test]
    fn accesses_cannot_straddle_a_region_end() {
        let space = space();
        let last = GuestAddr::new(0x1000_FFFE);
        assert_eq!(space.read_u32(last), Err(Error::InvalidAddress(last)));
        assert!(space.read_u16(last).is_ok());
        assert!(!space.contains_range(GuestAddr::new(0x1000_0000), 0x1_0001));
        assert!(space.contains_range(GuestAddr::new(0x1000_0000), 0x1_0000));
    }

    #[test]
    fn overlapping_and_degenerate_regions_are_rejected() {
        let mut space = space();
        assert_eq!(
            space.map_region(RegionDescriptor::new(MemoryKind::Mem1, 0x1000_8000, 0x1_0000)),
            Err(Error::RangeOverlap {
                base: GuestAddr::new(0x1000_8000),
                size: 0x1_0000
            })
        );
        assert!(matches!(
            space.map_region(RegionDescriptor::new(MemoryKind::Mem1, 0, 0x1000)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            space.map_region(RegionDescriptor::new(MemoryKind::Mem1, 0x4000_0000, 0)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            space.map_region(RegionDescriptor::new(MemoryKind::Mem1, 0xFFFF_F000, 0x2000)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn fill_and_region_lookup() {
        let space = space();
        let addr = GuestAddr::new(0x0200_0100);
        space.fill(addr, 16, 0xCC).unwrap();
        assert_eq!(space.read_u64(addr).unwrap(), 0xCCCC_CCCC_CCCC_CCCC);
        assert_eq!(space.region_of(addr).unwrap().kind, MemoryKind::System);
        assert!(space.region_of(GuestAddr::new(0x0300_0000)).is_none());
    }
}
