//! Platform-specific system interfaces.
//!
//! Userfaultfd only exists on Linux, so that is the only platform that
//! provides the engine's primitives.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::{LinuxMemory, Userfaultfd};
