use crate::guest_memory::usize_is_multiple_of_host_page_size;
use core::ops::Range;
use core::ptr;
use core::ptr::NonNull;

/// An anonymous, private, read/write host mapping backing one guest region.
///
/// The mapping is zero-filled on creation and unmapped on drop.
#[derive(Debug)]
pub struct Mmap {
    memory: NonNull<[u8]>,
}

// Safety: the mapping is plain memory owned by this value, guest accesses
// through raw pointers are synchronised (or deliberately racy, like real
// guest memory) by the callers.
unsafe impl Send for Mmap {}
// Safety: see above, `Mmap` never hands out references to its contents.
unsafe impl Sync for Mmap {}

impl Mmap {
    pub fn new_empty() -> Self {
        Self {
            memory: NonNull::slice_from_raw_parts(NonNull::dangling(), 0),
        }
    }

    /// Map `size` bytes of zeroed read/write memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mmap`][crate::Error::Mmap] if the host refuses the mapping.
    ///
    /// # Panics
    ///
    /// Panics if `size` isn't a multiple of the host page size.
    pub fn new(size: usize) -> crate::Result<Self> {
        assert!(usize_is_multiple_of_host_page_size(size));
        if size == 0 {
            return Ok(Self::new_empty());
        }

        // Safety: we request a fresh mapping, nothing else is aliased
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                size,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::PRIVATE,
            )?
        };

        let memory = ptr::slice_from_raw_parts_mut(ptr.cast::<u8>(), size);
        let memory = NonNull::new(memory).ok_or(crate::Error::Mmap(rustix::io::Errno::NOMEM))?;
        Ok(Mmap { memory })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.memory.as_ptr().cast_const().cast()
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.memory.as_ptr().cast()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The host address range covered by this mapping.
    pub fn host_range(&self) -> Range<usize> {
        let start = self.as_ptr() as usize;
        start..start + self.len()
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }

        // Safety: the pointer and length come from the `mmap_anonymous` call
        // in `Mmap::new` and nothing can observe the mapping after drop.
        let res = unsafe { rustix::mm::munmap(self.as_mut_ptr().cast(), self.len()) };
        if let Err(err) = res {
            tracing::warn!("munmap of {:?} failed: {err}", self.host_range());
        }
    }
}
