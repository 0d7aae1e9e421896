use crate::guest_memory::GuestAddr;
use core::fmt;

/// The physically backed memory regions the platform reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// MEM1, the small fast embedded memory.
    Mem1,
    /// MEM2, the large main memory.
    Mem2,
    /// The foreground bucket, owned by whichever application is in front.
    Foreground,
    /// Memory reserved for the emulated OS' own bookkeeping.
    System,
    /// Memory holding generated host function thunks.
    Thunks,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 5] = [
        MemoryKind::Mem1,
        MemoryKind::Mem2,
        MemoryKind::Foreground,
        MemoryKind::System,
        MemoryKind::Thunks,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::Mem1 => "MEM1",
            MemoryKind::Mem2 => "MEM2",
            MemoryKind::Foreground => "Foreground",
            MemoryKind::System => "System",
            MemoryKind::Thunks => "Thunks",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A physically backed slice of guest memory.
///
/// Guest memory is always big-endian, so there is no byte order field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub kind: MemoryKind,
    pub base: GuestAddr,
    pub size: u32,
}

impl RegionDescriptor {
    pub const fn new(kind: MemoryKind, base: u32, size: u32) -> Self {
        Self {
            kind,
            base: GuestAddr::new(base),
            size,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// One past the last byte of the region, `None` if that isn't
    /// representable as a 32-bit guest address.
    pub fn end(&self) -> Option<GuestAddr> {
        self.base.checked_add(self.size)
    }

    pub fn contains(&self, addr: GuestAddr) -> bool {
        let end = u64::from(self.base.get()) + u64::from(self.size);
        addr >= self.base && u64::from(addr.get()) < end
    }

    pub fn overlaps(&self, base: GuestAddr, size: u32) -> bool {
        let a0 = u64::from(self.base.get());
        let a1 = a0 + u64::from(self.size);
        let b0 = u64::from(base.get());
        let b1 = b0 + u64::from(size);
        a0 < b1 && b0 < a1
    }
}

/// Where each [`MemoryKind`] lives in the guest address space.
///
/// Used both to map host memory for the [`AddressSpace`][crate::AddressSpace]
/// and to answer platform bounds queries through
/// [`StaticPlatform`][crate::StaticPlatform].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    pub mem1: RegionDescriptor,
    pub mem2: RegionDescriptor,
    pub foreground: RegionDescriptor,
    pub system: RegionDescriptor,
    pub thunks: RegionDescriptor,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            mem1: RegionDescriptor::new(MemoryKind::Mem1, 0xF400_0000, 0x0200_0000),
            mem2: RegionDescriptor::new(MemoryKind::Mem2, 0x1000_0000, 0x2000_0000),
            foreground: RegionDescriptor::new(MemoryKind::Foreground, 0xE000_0000, 0x0400_0000),
            system: RegionDescriptor::new(MemoryKind::System, 0x0200_0000, 0x0100_0000),
            thunks: RegionDescriptor::new(MemoryKind::Thunks, 0x0100_0000, 0x0001_0000),
        }
    }
}

impl MemoryLayout {
    /// Override the placement of a single region.
    #[must_use]
    pub fn with_region(mut self, kind: MemoryKind, base: u32, size: u32) -> Self {
        *self.region_mut(kind) = RegionDescriptor::new(kind, base, size);
        self
    }

    pub fn region(&self, kind: MemoryKind) -> &RegionDescriptor {
        match kind {
            MemoryKind::Mem1 => &self.mem1,
            MemoryKind::Mem2 => &self.mem2,
            MemoryKind::Foreground => &self.foreground,
            MemoryKind::System => &self.system,
            MemoryKind::Thunks => &self.thunks,
        }
    }

    fn region_mut(&mut self, kind: MemoryKind) -> &mut RegionDescriptor {
        match kind {
            MemoryKind::Mem1 => &mut self.mem1,
            MemoryKind::Mem2 => &mut self.mem2,
            MemoryKind::Foreground => &mut self.foreground,
            MemoryKind::System => &mut self.system,
            MemoryKind::Thunks => &mut self.thunks,
        }
    }

    pub fn regions(&self) -> impl Iterator<Item = &RegionDescriptor> + '_ {
        MemoryKind::ALL.into_iter().map(|kind| self.region(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_regions_dont_overlap() {
        let layout = MemoryLayout::default();
        for a in layout.regions() {
            assert!(a.end().is_some(), "{} wraps the address space", a.name());
            for b in layout.regions().filter(|b| b.kind != a.kind) {
                assert!(
                    !a.overlaps(b.base, b.size),
                    "{} overlaps {}",
                    a.name(),
                    b.name()
                );
            }
        }
    }

    #[test]
    fn with_region_replaces_one_region() {
        let layout =
            MemoryLayout::default().with_region(MemoryKind::Mem2, 0x2000_0000, 0x4_0000);
        assert_eq!(layout.mem2.base, GuestAddr::new(0x2000_0000));
        assert_eq!(layout.mem2.size, 0x4_0000);
        assert_eq!(layout.mem1, MemoryLayout::default().mem1);
    }

    #[test]
    fn contains_is_half_open() {
        let region = RegionDescriptor::new(MemoryKind::System, 0x1000, 0x100);
        assert!(!region.contains(GuestAddr::new(0xFFF)));
        assert!(region.contains(GuestAddr::new(0x1000)));
        assert!(region.contains(GuestAddr::new(0x10FF)));
        assert!(!region.contains(GuestAddr::new(0x1100)));
    }
}
