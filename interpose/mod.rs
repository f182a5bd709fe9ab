//! Exported drop-in replacements.
//!
//! Each replacement has the exact C signature and return conventions of the
//! function it shadows. Calls at or below the threshold and calls made from
//! inside the engine go straight to the real implementation.

mod file;
mod memory;
mod socket;

/// Overwrite the calling thread's `errno`.
fn set_errno(code: libc::c_int) {
    unsafe { *libc::__errno_location() = code };
}

/// The calling thread's `errno`.
fn errno() -> libc::c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
