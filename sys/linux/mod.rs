//! Linux-specific system interfaces.
//!
//! # Submodules
//!
//! - [`memory`] - `mmap`-backed [`MemoryOps`](crate::platform::MemoryOps)
//! - [`userfaultfd`] - userfaultfd-backed [`FaultChannel`](crate::platform::FaultChannel)

pub mod memory;
pub mod userfaultfd;

pub use memory::LinuxMemory;
pub use userfaultfd::Userfaultfd;
