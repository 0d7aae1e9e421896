use cranelift_entity::entity_impl;

/// Index of an entry in the [`ExportTable`][crate::ExportTable].
///
/// Entries are append-only, so an index stays valid for the lifetime of the
/// table even when its name is later re-registered. The index is also what
/// a generated thunk encodes in its kernel call instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExportIndex(u32);
entity_impl!(ExportIndex, "export");

/// Index of a mapped region in the [`AddressSpace`][crate::AddressSpace].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionIndex(u32);
entity_impl!(RegionIndex, "region");
