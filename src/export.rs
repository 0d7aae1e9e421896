//! Symbol exports and the thunks that make host functions callable.
//!
//! Every exported function needs a guest address the emulated CPU can
//! branch to. Functions implemented in guest code simply export their own
//! address, host implemented functions get an 8 byte thunk in the thunk
//! region:
//!
//! ```text
//! +0  KERNEL_CALL_OPCODE | export index
//! +4  blr
//! ```
//!
//! The interpreter hands the first word to [`ExportTable::decode_thunk`]
//! (or the thunk address to [`ExportTable::function_at`]) and invokes the
//! resulting [`HostFunction`].
//!
//! The table is append-only. Registering a name again makes the new entry
//! the one [`ExportTable::resolve`] returns, but the superseded entry and
//! its thunk stay alive so guest code holding the old address keeps working.

use crate::context::CoreContext;
use crate::guest_memory::{AddressSpace, GuestAddr};
use crate::indices::ExportIndex;
use crate::{Error, BLR_INSTRUCTION, KERNEL_CALL_INDEX_MASK, KERNEL_CALL_OPCODE, THUNK_SIZE};
use alloc::string::ToString;
use alloc::sync::Arc;
use core::fmt;
use cranelift_entity::PrimaryMap;
use hashbrown::HashMap;

/// Signature of a host implemented guest function.
///
/// Arguments arrive as raw 32-bit register values (r3, r4, ...), the
/// returned value goes back into r3.
pub type HostFn = fn(&CoreContext, &[u32]) -> crate::Result<u32>;

#[derive(Clone, Copy)]
pub struct HostFunction {
    name: &'static str,
    func: HostFn,
}

impl HostFunction {
    pub const fn new(name: &'static str, func: HostFn) -> Self {
        Self { name, func }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Call the function on behalf of guest code.
    ///
    /// # Errors
    ///
    /// Returns whatever error the function itself fails with.
    pub fn invoke(&self, ctx: &CoreContext, args: &[u32]) -> crate::Result<u32> {
        tracing::trace!("calling host function {}({args:x?})", self.name);
        (self.func)(ctx, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// What an exported function name refers to.
#[derive(Debug, Clone, Copy)]
pub enum Callable {
    /// Implemented on the host, reached through a generated thunk.
    Host(HostFunction),
    /// Implemented in guest code at the given address.
    Guest(GuestAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Function,
    Data,
}

#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub name: Arc<str>,
    pub kind: ExportKind,
    /// The address guest code resolves this export to.
    pub address: GuestAddr,
    host: Option<HostFunction>,
}

impl ExportEntry {
    /// The host implementation behind a thunk, if this is one.
    pub fn host_function(&self) -> Option<&HostFunction> {
        self.host.as_ref()
    }
}

#[derive(Debug)]
pub struct ExportTable {
    entries: PrimaryMap<ExportIndex, ExportEntry>,
    by_name: HashMap<Arc<str>, ExportIndex>,
    thunks: HashMap<GuestAddr, ExportIndex>,
    thunk_base: GuestAddr,
    thunk_size: u32,
    thunk_used: u32,
}

impl ExportTable {
    /// Create an empty table generating thunks into `thunk_base..thunk_base + thunk_size`.
    pub fn new(thunk_base: GuestAddr, thunk_size: u32) -> Self {
        Self {
            entries: PrimaryMap::new(),
            by_name: HashMap::new(),
            thunks: HashMap::new(),
            thunk_base,
            thunk_size,
            thunk_used: 0,
        }
    }

    /// Export a function under `name` and return the address guest code
    /// should call.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OutOfMemory`] if the thunk region is exhausted,
    /// or any error from writing the thunk to guest memory.
    pub fn register_function(
        &mut self,
        space: &AddressSpace,
        name: &str,
        callable: Callable,
    ) -> crate::Result<GuestAddr> {
        let index = self.entries.next_key();

        let (address, host) = match callable {
            Callable::Host(func) => (self.emit_thunk(space, index)?, Some(func)),
            Callable::Guest(addr) => (addr, None),
        };

        self.push(name, ExportKind::Function, address, host);
        if host.is_some() {
            self.thunks.insert(address, index);
        }

        tracing::debug!("exported function `{name}` at {address}");
        Ok(address)
    }

    /// Export the data object at `address` under `name`.
    pub fn register_data(&mut self, name: &str, address: GuestAddr) -> ExportIndex {
        tracing::debug!("exported data `{name}` at {address}");
        self.push(name, ExportKind::Data, address, None)
    }

    /// The address `name` currently resolves to.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::UnknownSymbol`] if nothing was exported under `name`.
    pub fn resolve(&self, name: &str) -> crate::Result<GuestAddr> {
        self.get(name)
            .map(|entry| entry.address)
            .ok_or_else(|| Error::UnknownSymbol(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&ExportEntry> {
        let index = self.by_name.get(name)?;
        self.entries.get(*index)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn entry(&self, index: ExportIndex) -> Option<&ExportEntry> {
        self.entries.get(index)
    }

    /// The host function whose thunk starts at `addr`.
    pub fn function_at(&self, addr: GuestAddr) -> Option<&HostFunction> {
        let index = self.thunks.get(&addr)?;
        self.entries.get(*index)?.host_function()
    }

    /// The host function a kernel call instruction word refers to.
    pub fn decode_thunk(&self, word: u32) -> Option<&HostFunction> {
        if word & !KERNEL_CALL_INDEX_MASK != KERNEL_CALL_OPCODE {
            return None;
        }
        let index = ExportIndex::from_u32(word & KERNEL_CALL_INDEX_MASK);
        self.entries.get(index)?.host_function()
    }

    /// Every name currently exported, with the entry it resolves to.
    pub fn iter(&self) -> impl Iterator<Item = &ExportEntry> + '_ {
        self.by_name
            .values()
            .filter_map(|index| self.entries.get(*index))
    }

    /// Number of exported names.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Bytes of the thunk region in use.
    pub fn thunk_bytes_used(&self) -> u32 {
        self.thunk_used
    }

    fn push(
        &mut self,
        name: &str,
        kind: ExportKind,
        address: GuestAddr,
        host: Option<HostFunction>,
    ) -> ExportIndex {
        let name: Arc<str> = Arc::from(name);
        let index = self.entries.push(ExportEntry {
            name: name.clone(),
            kind,
            address,
            host,
        });
        if let Some(previous) = self.by_name.insert(name, index) {
            tracing::debug!("export {index} supersedes {previous}");
        }
        index
    }

    fn emit_thunk(&mut self, space: &AddressSpace, index: ExportIndex) -> crate::Result<GuestAddr> {
        let oom = Error::OutOfMemory {
            size: THUNK_SIZE,
            align: 4,
        };

        if index.as_u32() > KERNEL_CALL_INDEX_MASK {
            return Err(oom);
        }
        let end = self
            .thunk_used
            .checked_add(THUNK_SIZE)
            .filter(|end| *end <= self.thunk_size)
            .ok_or(oom.clone())?;
        let addr = self.thunk_base.checked_add(self.thunk_used).ok_or(oom)?;

        space.write_u32(addr, KERNEL_CALL_OPCODE | index.as_u32())?;
        space.write_u32(addr.checked_add(4).ok_or(Error::InvalidAddress(addr))?, BLR_INSTRUCTION)?;
        self.thunk_used = end;

        tracing::trace!("emitted thunk for export {index} at {addr}");
        Ok(addr)
    }
}
