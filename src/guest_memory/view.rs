use crate::guest_memory::{AddressSpace, GuestAddr};
use crate::Error;

/// A bounds checked window onto `len` bytes of guest memory.
///
/// Guest structures are never overlaid onto host memory with a pointer cast.
/// Instead fields are accessed by offset through a view, which checks the
/// offset against the view's length and converts between big-endian guest
/// and host byte order on every access.
#[derive(Debug, Clone, Copy)]
pub struct GuestView<'a> {
    space: &'a AddressSpace,
    base: GuestAddr,
    len: u32,
}

macro_rules! view_accessors {
    ($(($ty:ty, $read:ident, $write:ident))*) => ($(
        /// Read the field at `offset`.
        ///
        /// # Errors
        ///
        /// Fails with [`Error::InvalidAddress`] if the field extends past the view.
        #[inline]
        pub fn $read(&self, offset: u32) -> crate::Result<$ty> {
            let addr = self.field(offset, size_of::<$ty>())?;
            self.space.$read(addr)
        }

        /// Write the field at `offset`.
        ///
        /// # Errors
        ///
        /// Fails with [`Error::InvalidAddress`] if the field extends past the view.
        #[inline]
        pub fn $write(&self, offset: u32, value: $ty) -> crate::Result<()> {
            let addr = self.field(offset, size_of::<$ty>())?;
            self.space.$write(addr, value)
        }
    )*)
}

impl<'a> GuestView<'a> {
    pub(crate) fn new(space: &'a AddressSpace, base: GuestAddr, len: u32) -> Self {
        Self { space, base, len }
    }

    #[inline]
    pub fn base(&self) -> GuestAddr {
        self.base
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A narrower view starting `offset` bytes into this one.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidAddress`] if the subview doesn't fit.
    pub fn subview(&self, offset: u32, len: u32) -> crate::Result<GuestView<'a>> {
        let base = self.field_with_len(offset, len)?;
        Ok(GuestView::new(self.space, base, len))
    }

    view_accessors! {
        (u8, read_u8, write_u8)
        (u16, read_u16, write_u16)
        (u32, read_u32, write_u32)
        (u64, read_u64, write_u64)
    }

    /// Read a guest pointer field.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidAddress`] if the field extends past the view.
    #[inline]
    pub fn read_addr(&self, offset: u32) -> crate::Result<GuestAddr> {
        self.read_u32(offset).map(GuestAddr::new)
    }

    /// Write a guest pointer field.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidAddress`] if the field extends past the view.
    #[inline]
    pub fn write_addr(&self, offset: u32, addr: GuestAddr) -> crate::Result<()> {
        self.write_u32(offset, addr.get())
    }

    fn field(&self, offset: u32, size: usize) -> crate::Result<GuestAddr> {
        let size = u32::try_from(size).map_err(|_| Error::InvalidAddress(self.base))?;
        self.field_with_len(offset, size)
    }

    fn field_with_len(&self, offset: u32, size: u32) -> crate::Result<GuestAddr> {
        let addr = self.base.checked_add(offset);
        match offset.checked_add(size) {
            Some(end) if end <= self.len => addr.ok_or(Error::InvalidAddress(self.base)),
            _ => Err(Error::InvalidAddress(addr.unwrap_or(self.base))),
        }
    }
}
