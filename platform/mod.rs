//! Primitives the engine consumes.
//!
//! The engine never issues a syscall itself. It copies bytes and replaces
//! mappings through [`MemoryOps`], and arms traps and resumes faulted threads
//! through [`FaultChannel`]. On Linux both are provided by [`crate::sys::linux`];
//! tests substitute a simulated address space.

use crate::Result;
use crate::addr::{AddrRange, PageSize};
use std::sync::Arc;

#[cfg(test)]
pub mod sim;

/// Byte copies and anonymous mappings.
pub trait MemoryOps: Send + Sync {
    fn page_size(&self) -> PageSize;

    /// Copy `len` bytes from `src` to `dst`.
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for the access and must not overlap.
    unsafe fn copy(&self, dst: usize, src: usize, len: usize);

    /// Replace whatever is mapped over `range` with fresh zero-filled pages.
    ///
    /// With `populate` the pages are backed immediately; otherwise they stay
    /// untouched so that a missing-page trap can be armed over them. Any trap
    /// previously registered over `range` is dropped with the old mapping.
    ///
    /// # Safety
    ///
    /// `range` must be page-aligned and owned by the caller: its previous
    /// contents are discarded.
    unsafe fn map_zeroed(&self, range: AddrRange, populate: bool) -> Result<()>;
}

/// How a range is trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Trap the first touch of a page that has no backing yet.
    Missing,
    /// Trap writes to pages while write protection is on.
    WriteProtect,
}

/// What kind of access trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Missing,
    WriteProtect,
}

/// A single trapped access reported by the fault channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    pub address: usize,
    pub kind: FaultKind,
}

/// Page-fault notification channel.
pub trait FaultChannel: Send + Sync {
    fn register(&self, range: AddrRange, mode: RegisterMode) -> Result<()>;

    fn unregister(&self, range: AddrRange) -> Result<()>;

    fn set_write_protect(&self, range: AddrRange, protect: bool) -> Result<()>;

    /// Block until at least one fault is pending and append the batch to `events`.
    ///
    /// Returns the number of events appended. Zero means the channel was shut
    /// down and no further faults will arrive.
    fn receive(&self, events: &mut Vec<FaultEvent>) -> Result<usize>;

    /// Resume the threads blocked on a fault inside `range`.
    fn wake(&self, range: AddrRange) -> Result<()>;
}

impl<T: MemoryOps + ?Sized> MemoryOps for Arc<T> {
    fn page_size(&self) -> PageSize {
        (**self).page_size()
    }

    unsafe fn copy(&self, dst: usize, src: usize, len: usize) {
        unsafe { (**self).copy(dst, src, len) }
    }

    unsafe fn map_zeroed(&self, range: AddrRange, populate: bool) -> Result<()> {
        unsafe { (**self).map_zeroed(range, populate) }
    }
}

impl<T: FaultChannel + ?Sized> FaultChannel for Arc<T> {
    fn register(&self, range: AddrRange, mode: RegisterMode) -> Result<()> {
        (**self).register(range, mode)
    }

    fn unregister(&self, range: AddrRange) -> Result<()> {
        (**self).unregister(range)
    }

    fn set_write_protect(&self, range: AddrRange, protect: bool) -> Result<()> {
        (**self).set_write_protect(range, protect)
    }

    fn receive(&self, events: &mut Vec<FaultEvent>) -> Result<usize> {
        (**self).receive(events)
    }

    fn wake(&self, range: AddrRange) -> Result<()> {
        (**self).wake(range)
    }
}
