use crate::heap::HeapHandle;
use core::fmt;
use spin::RwLock;

/// The base heap types a [`HeapHandle`] can be assigned to.
///
/// Guest code names arenas by their raw index, everything outside `0..3`
/// is the guest's "invalid" arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum BaseHeapType {
    /// MEM1, a frame heap.
    Primary = 0,
    /// MEM2, the expanding heap that backs the default heap.
    Secondary = 1,
    /// Foreground bucket, a frame heap.
    Foreground = 2,
}

impl BaseHeapType {
    pub const ALL: [BaseHeapType; 3] = [Self::Primary, Self::Secondary, Self::Foreground];

    /// The raw value guest code receives when a handle belongs to no arena.
    pub const INVALID_RAW: i32 = 4;

    /// Decode a raw guest arena index.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Primary),
            1 => Some(Self::Secondary),
            2 => Some(Self::Foreground),
            _ => None,
        }
    }

    #[inline]
    pub const fn raw(self) -> i32 {
        self as i32
    }

    #[inline]
    pub(crate) fn slot(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
            Self::Foreground => 2,
        }
    }
}

impl fmt::Display for BaseHeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "MEM1",
            Self::Secondary => "MEM2",
            Self::Foreground => "FG",
        })
    }
}

/// Fixed table associating every [`BaseHeapType`] with a heap handle.
///
/// Operations take raw guest indices and never fail, out of range indices
/// read as [`HeapHandle::NULL`] and writes to them are dropped.
#[derive(Debug, Default)]
pub struct ArenaRegistry {
    slots: RwLock<[HeapHandle; 3]>,
}

impl ArenaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle assigned to arena `raw`.
    pub fn get(&self, raw: i32) -> HeapHandle {
        BaseHeapType::from_raw(raw).map_or(HeapHandle::NULL, |ty| self.slots.read()[ty.slot()])
    }

    /// Assign `handle` to arena `raw` and return the handle it replaces.
    pub fn set(&self, raw: i32, handle: HeapHandle) -> HeapHandle {
        let Some(ty) = BaseHeapType::from_raw(raw) else {
            tracing::warn!("ignoring base heap handle {handle} for invalid arena {raw}");
            return HeapHandle::NULL;
        };

        let previous = core::mem::replace(&mut self.slots.write()[ty.slot()], handle);
        tracing::debug!("arena {ty}: {previous} -> {handle}");
        previous
    }

    /// The arena `handle` is assigned to. The null handle belongs to none.
    pub fn arena_of(&self, handle: HeapHandle) -> Option<BaseHeapType> {
        if handle.is_null() {
            return None;
        }
        let slots = self.slots.read();
        BaseHeapType::ALL
            .into_iter()
            .find(|ty| slots[ty.slot()] == handle)
    }

    /// Like [`ArenaRegistry::arena_of`], encoded the way guest code sees it.
    pub fn arena_of_raw(&self, handle: HeapHandle) -> i32 {
        self.arena_of(handle)
            .map_or(BaseHeapType::INVALID_RAW, BaseHeapType::raw)
    }
}
