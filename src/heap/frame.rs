use crate::guest_memory::GuestAddr;
use crate::heap::{heap_bounds, HeapAllocator, HeapKind, Request};
use crate::{Error, MIN_ALIGNMENT};
use alloc::vec::Vec;
use spin::Mutex;

/// A two-ended bump allocator.
///
/// Head allocations move a cursor up from the start of the range, tail
/// allocations move a second cursor down from the end. Individual frees are
/// ignored, memory is reclaimed wholesale by rolling the cursors back to a
/// [`Watermark`], to a recorded state or to the heap's ends.
#[derive(Debug)]
pub struct FrameHeap {
    base: GuestAddr,
    size: u32,
    start: u32,
    end: u32,
    inner: Mutex<FrameHeapInner>,
}

#[derive(Debug)]
struct FrameHeapInner {
    head: u32,
    tail: u32,
    states: Vec<RecordedState>,
}

#[derive(Debug, Clone, Copy)]
struct RecordedState {
    tag: u32,
    mark: Watermark,
}

/// Snapshot of both cursors of a [`FrameHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub head: GuestAddr,
    pub tail: GuestAddr,
}

/// Which end(s) of a [`FrameHeap`] [`FrameHeap::free_all`] resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRelease {
    Head,
    Tail,
    All,
}

impl FrameHeap {
    /// Create a heap managing `base..base + size`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if the range wraps the address
    /// space or is too small to hold a single allocation.
    pub fn new(base: GuestAddr, size: u32) -> crate::Result<Self> {
        let (start, end) = heap_bounds(base, size)?;
        Ok(Self {
            base,
            size,
            start,
            end,
            inner: Mutex::new(FrameHeapInner {
                head: start,
                tail: end,
                states: Vec::new(),
            }),
        })
    }

    pub fn mark_watermark(&self) -> Watermark {
        self.inner.lock().mark()
    }

    /// Roll both cursors back to `mark`, releasing everything allocated
    /// since it was taken.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if the cursors already moved
    /// behind `mark` or it wasn't taken on this heap.
    pub fn release_to_watermark(&self, mark: Watermark) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        let (head, tail) = (mark.head.get(), mark.tail.get());

        if head < self.start || tail > self.end || head > tail {
            return Err(Error::InvalidArgument("watermark belongs to another heap"));
        }
        if head > inner.head || tail < inner.tail {
            return Err(Error::InvalidArgument("watermark is stale"));
        }

        inner.head = head;
        inner.tail = tail;
        // states taken after the mark point at released memory
        inner
            .states
            .retain(|state| state.mark.head.get() <= head && state.mark.tail.get() >= tail);

        tracing::trace!("frame heap {}: released to {}/{}", self.base, mark.head, mark.tail);
        Ok(())
    }

    /// Push the current cursors onto the state stack under `tag`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] for the reserved tag 0.
    pub fn record_state(&self, tag: u32) -> crate::Result<()> {
        if tag == 0 {
            return Err(Error::InvalidArgument("state tag 0 is reserved"));
        }
        let mut inner = self.inner.lock();
        let mark = inner.mark();
        inner.states.push(RecordedState { tag, mark });
        Ok(())
    }

    /// Roll back to the most recent state recorded under `tag`, or to the
    /// most recent state of all if `tag` is 0. That state and every state
    /// recorded after it are discarded.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if no such state was recorded.
    pub fn free_by_state(&self, tag: u32) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        let index = inner
            .states
            .iter()
            .rposition(|state| tag == 0 || state.tag == tag)
            .ok_or(Error::InvalidArgument("no state recorded under this tag"))?;

        let state = inner.states[index];
        inner.states.truncate(index);
        inner.head = state.mark.head.get();
        inner.tail = state.mark.tail.get();
        Ok(())
    }

    /// Reset one or both cursors to the ends of the heap. Recorded states
    /// are discarded.
    pub fn free_all(&self, release: FrameRelease) {
        let mut inner = self.inner.lock();
        if matches!(release, FrameRelease::Head | FrameRelease::All) {
            inner.head = self.start;
        }
        if matches!(release, FrameRelease::Tail | FrameRelease::All) {
            inner.tail = self.end;
        }
        inner.states.clear();
        tracing::trace!("frame heap {}: free all ({release:?})", self.base);
    }
}

impl FrameHeapInner {
    fn mark(&self) -> Watermark {
        Watermark {
            head: GuestAddr::new(self.head),
            tail: GuestAddr::new(self.tail),
        }
    }
}

impl HeapAllocator for FrameHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::Frame
    }

    fn base(&self) -> GuestAddr {
        self.base
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn allocate_aligned(&self, size: u32, align: i32) -> crate::Result<GuestAddr> {
        let req = Request::new(size, align)?;
        let mut inner = self.inner.lock();

        let addr = if req.from_tail {
            let (head, tail) = (inner.head, inner.tail);
            let addr = tail
                .checked_sub(req.size)
                .map(|addr| GuestAddr::new(addr).align_down(req.align))
                .filter(|addr| addr.get() >= head);
            if let Some(addr) = addr {
                inner.tail = addr.get();
            }
            addr
        } else {
            let (head, tail) = (inner.head, inner.tail);
            let addr = GuestAddr::new(head)
                .align_up(req.align)
                .filter(|addr| addr.checked_add(req.size).is_some_and(|end| end.get() <= tail));
            if let Some(addr) = addr {
                inner.head = addr.get() + req.size;
            }
            addr
        };

        match addr {
            Some(addr) => {
                tracing::trace!("frame heap {}: alloc {size:#x} @ {align} -> {addr}", self.base);
                Ok(addr)
            }
            None => Err(req.out_of_memory()),
        }
    }

    fn free(&self, _addr: GuestAddr) -> crate::Result<()> {
        Ok(())
    }

    fn free_size(&self) -> u32 {
        let inner = self.inner.lock();
        inner.tail - inner.head
    }

    fn allocatable_size(&self, align: i32) -> u32 {
        let align = align.unsigned_abs();
        if !align.is_power_of_two() {
            return 0;
        }
        let align = align.max(MIN_ALIGNMENT.unsigned_abs());

        let inner = self.inner.lock();
        GuestAddr::new(inner.head)
            .align_up(align)
            .and_then(|addr| inner.tail.checked_sub(addr.get()))
            .unwrap_or(0)
    }

    fn as_frame(&self) -> Option<&FrameHeap> {
        Some(self)
    }
}
