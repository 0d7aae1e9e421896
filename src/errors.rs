use crate::bootstrap::BootstrapState;
use crate::guest_memory::GuestAddr;
use crate::heap::HeapHandle;
use alloc::string::String;

#[derive(onlyerror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The address doesn't fall inside any mapped guest region (or is null).
    #[error("invalid guest address {0}")]
    InvalidAddress(GuestAddr),
    /// The host pointer wasn't carved from a mapped guest region.
    #[error("host pointer is not guest memory")]
    NotGuestMemory,
    /// The allocator has no free block large enough for the request.
    #[error("out of memory allocating {size:#x} bytes (alignment {align})")]
    OutOfMemory { size: u32, align: i32 },
    /// A parameter was outside of its valid domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// No export with this name was registered.
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),
    /// The default heap was used before the bootstrap completed.
    #[error("default heap is not initialized")]
    NotInitialized,
    /// An address was freed that the heap doesn't currently own. This is an
    /// emulation-correctness violation, see [`Error::is_session_fatal`].
    #[error("use after free or double free of {0}")]
    UseAfterFree(GuestAddr),
    /// The heap handle doesn't name a live heap.
    #[error("invalid heap handle {0}")]
    InvalidHandle(HeapHandle),
    /// The requested range overlaps memory owned by another heap or region.
    #[error("range {base}+{size:#x} overlaps an existing range")]
    RangeOverlap { base: GuestAddr, size: u32 },
    /// A bootstrap or teardown step was run out of order.
    #[error("expected bootstrap state {expected:?} but was {actual:?}")]
    InvalidState {
        expected: BootstrapState,
        actual: BootstrapState,
    },
    /// Failed to map host memory backing a guest region.
    #[error("failed to map host memory: {0}")]
    Mmap(rustix::io::Errno),
}

impl Error {
    /// Whether the emulated session must be aborted after this error.
    ///
    /// Guest code freeing memory it doesn't own means guest memory can no
    /// longer be trusted, but the emulator process itself is unaffected.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::UseAfterFree(_))
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(e: rustix::io::Errno) -> Self {
        Self::Mmap(e)
    }
}
