//! Process memory primitives.

use crate::addr::{AddrRange, PageSize};
use crate::platform::MemoryOps;
use crate::symbols;
use crate::{Error, Result};

/// Copies through the real `memcpy` and remaps with `mmap(MAP_FIXED)`.
#[derive(Debug, Clone, Copy)]
pub struct LinuxMemory {
    page: PageSize,
}

impl Default for LinuxMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxMemory {
    pub fn new() -> Self {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = usize::try_from(size)
            .ok()
            .and_then(PageSize::new)
            .unwrap_or(PageSize::DEFAULT);
        Self { page }
    }
}

impl MemoryOps for LinuxMemory {
    fn page_size(&self) -> PageSize {
        self.page
    }

    unsafe fn copy(&self, dst: usize, src: usize, len: usize) {
        unsafe { symbols::real_memcpy(dst as *mut libc::c_void, src as *const libc::c_void, len) };
    }

    unsafe fn map_zeroed(&self, range: AddrRange, populate: bool) -> Result<()> {
        let mut flags = libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if populate {
            flags |= libc::MAP_POPULATE;
        }
        let addr = unsafe {
            libc::mmap(
                range.start as *mut libc::c_void,
                range.len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Mapping {
                range,
                source: std::io::Error::last_os_error(),
            });
        }
        if addr as usize != range.start {
            return Err(Error::Mapping {
                range,
                source: std::io::Error::from_raw_os_error(libc::EFAULT),
            });
        }
        Ok(())
    }
}
