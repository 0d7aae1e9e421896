use crate::host_page_size;
use core::fmt;

mod address_space;
mod mmap;
mod view;

pub use address_space::AddressSpace;
pub use mmap::Mmap;
pub use view::GuestView;

/// A byte address in the guest's flat 32-bit address space.
///
/// This is *not* a host pointer, it only becomes one after translation
/// through the [`AddressSpace`]. [`GuestAddr::NULL`] is the guest's null
/// pointer and never translates.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GuestAddr(u32);

impl GuestAddr {
    pub const NULL: GuestAddr = GuestAddr(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn checked_add(self, offset: u32) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }

    #[inline]
    pub fn checked_sub(self, offset: u32) -> Option<Self> {
        self.0.checked_sub(offset).map(Self)
    }

    /// Distance in bytes from `base` up to `self`.
    #[inline]
    pub fn offset_from(self, base: GuestAddr) -> Option<u32> {
        self.0.checked_sub(base.0)
    }

    /// Round up to `align`, which must be a power of two.
    #[inline]
    pub fn align_up(self, align: u32) -> Option<Self> {
        debug_assert!(align.is_power_of_two());
        self.0
            .checked_add(align - 1)
            .map(|val| Self(val & !(align - 1)))
    }

    /// Round down to `align`, which must be a power of two.
    #[inline]
    pub fn align_down(self, align: u32) -> Self {
        debug_assert!(align.is_power_of_two());
        Self(self.0 & !(align - 1))
    }

    #[inline]
    pub fn is_aligned(self, align: u32) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }
}

impl From<u32> for GuestAddr {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<GuestAddr> for u32 {
    fn from(addr: GuestAddr) -> Self {
        addr.0
    }
}

impl fmt::Debug for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuestAddr({:#010x})", self.0)
    }
}

impl fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::LowerHex for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Is `bytes` a multiple of the host page size?
pub fn usize_is_multiple_of_host_page_size(bytes: usize) -> bool {
    bytes % host_page_size() == 0
}

/// Round `bytes` up to a multiple of the host page size, `None` on overflow.
pub fn round_usize_up_to_host_pages(bytes: usize) -> Option<usize> {
    let page_size = host_page_size();
    debug_assert!(page_size.is_power_of_two());
    bytes
        .checked_add(page_size - 1)
        .map(|val| val & !(page_size - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        let addr = GuestAddr::new(0x1001);
        assert_eq!(addr.align_up(0x10), Some(GuestAddr::new(0x1010)));
        assert_eq!(addr.align_down(0x10), GuestAddr::new(0x1000));
        assert!(GuestAddr::new(0x1000).is_aligned(0x1000));
        assert_eq!(GuestAddr::new(u32::MAX).align_up(4), None);
    }

    #[test]
    fn formats_as_padded_hex() {
        assert_eq!(alloc::format!("{}", GuestAddr::new(0x1234)), "0x00001234");
        assert_eq!(alloc::format!("{:x}", GuestAddr::new(0xBEEF)), "beef");
    }

    #[test]
    fn page_rounding() {
        let page = host_page_size();
        assert_eq!(round_usize_up_to_host_pages(1), Some(page));
        assert_eq!(round_usize_up_to_host_pages(page), Some(page));
        assert_eq!(round_usize_up_to_host_pages(usize::MAX), None);
        assert!(usize_is_multiple_of_host_page_size(page * 3));
    }
}
