//! Userfaultfd fault channel.
//!
//! The file descriptor is created non-blocking; [`Userfaultfd::receive`]
//! parks in `poll` and then drains whatever messages are queued.

use crate::addr::AddrRange;
use crate::platform::{FaultChannel, FaultEvent, FaultKind, RegisterMode};
use crate::{Error, Result};
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::debug;

const UFFD_API: u64 = 0xAA;
const UFFD_FEATURE_PAGEFAULT_FLAG_WP: u64 = 1 << 0;

const UFFDIO_API: u64 = 0xC018_AA3F;
const UFFDIO_REGISTER: u64 = 0xC020_AA00;
const UFFDIO_UNREGISTER: u64 = 0x8010_AA01;
const UFFDIO_WAKE: u64 = 0x8010_AA02;
const UFFDIO_WRITEPROTECT: u64 = 0xC018_AA06;

const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;
const UFFDIO_REGISTER_MODE_WP: u64 = 1 << 1;
const UFFDIO_WRITEPROTECT_MODE_WP: u64 = 1 << 0;

const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
const UFFD_PAGEFAULT_FLAG_WP: u64 = 1 << 1;

/// Messages drained per read.
const BATCH: usize = 16;

#[repr(C)]
#[derive(Debug, Default)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct UffdioRange {
    start: u64,
    len: u64,
}

impl From<AddrRange> for UffdioRange {
    fn from(range: AddrRange) -> Self {
        Self {
            start: range.start as u64,
            len: range.len as u64,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct UffdioWriteprotect {
    range: UffdioRange,
    mode: u64,
}

/// `struct uffd_msg`; for page faults `arg` holds flags, address and thread id.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    arg: [u64; 3],
}

impl UffdMsg {
    fn fault_event(&self) -> Result<FaultEvent> {
        if self.event != UFFD_EVENT_PAGEFAULT {
            return Err(Error::UnexpectedEvent(self.event));
        }
        let kind = if self.arg[0] & UFFD_PAGEFAULT_FLAG_WP != 0 {
            FaultKind::WriteProtect
        } else {
            FaultKind::Missing
        };
        Ok(FaultEvent {
            address: self.arg[1] as usize,
            kind,
        })
    }
}

/// A userfaultfd with missing and write-protect trapping enabled.
#[derive(Debug)]
pub struct Userfaultfd {
    fd: OwnedFd,
}

impl Userfaultfd {
    pub fn open() -> Result<Self> {
        let fd = unsafe { libc::syscall(libc::SYS_userfaultfd, libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOSYS) => Error::FeatureUnavailable("userfaultfd"),
                _ => Error::Io(err),
            });
        }
        // SAFETY: the syscall just returned this descriptor to us.
        let uffd = Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd as RawFd) },
        };

        let mut api = UffdioApi {
            api: UFFD_API,
            features: UFFD_FEATURE_PAGEFAULT_FLAG_WP,
            ioctls: 0,
        };
        if let Err(err) = uffd.ioctl(UFFDIO_API, &mut api) {
            return Err(match err.raw_os_error() {
                Some(libc::EINVAL) => Error::FeatureUnavailable("write-protect page faults"),
                _ => Error::Io(err),
            });
        }
        debug!(features = api.features, ioctls = api.ioctls, "userfaultfd ready");
        Ok(uffd)
    }

    fn ioctl<T>(&self, request: u64, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), request as _, arg as *mut T) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn channel_ioctl<T>(&self, op: &'static str, request: u64, range: AddrRange, arg: &mut T) -> Result<()> {
        self.ioctl(request, arg)
            .map_err(|source| Error::Channel { op, range, source })
    }

    /// Wait until the descriptor is readable. `false` means it hung up.
    fn poll(&self) -> Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let ret = unsafe { libc::poll(&mut pollfd, 1, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if pollfd.revents & libc::POLLIN != 0 {
                return Ok(true);
            }
            if pollfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                return Ok(false);
            }
        }
    }
}

impl FaultChannel for Userfaultfd {
    fn register(&self, range: AddrRange, mode: RegisterMode) -> Result<()> {
        let mut register = UffdioRegister {
            range: range.into(),
            mode: match mode {
                RegisterMode::Missing => UFFDIO_REGISTER_MODE_MISSING,
                RegisterMode::WriteProtect => UFFDIO_REGISTER_MODE_WP,
            },
            ioctls: 0,
        };
        self.channel_ioctl("register", UFFDIO_REGISTER, range, &mut register)
    }

    fn unregister(&self, range: AddrRange) -> Result<()> {
        // Protection bits can outlive the registration on older kernels.
        let mut unprotect = UffdioWriteprotect {
            range: range.into(),
            mode: 0,
        };
        if let Err(err) = self.ioctl(UFFDIO_WRITEPROTECT, &mut unprotect) {
            debug!(?range, %err, "clearing write protection before unregister failed");
        }
        let mut uffd_range = UffdioRange::from(range);
        self.channel_ioctl("unregister", UFFDIO_UNREGISTER, range, &mut uffd_range)
    }

    fn set_write_protect(&self, range: AddrRange, protect: bool) -> Result<()> {
        let mut writeprotect = UffdioWriteprotect {
            range: range.into(),
            mode: if protect { UFFDIO_WRITEPROTECT_MODE_WP } else { 0 },
        };
        self.channel_ioctl("writeprotect", UFFDIO_WRITEPROTECT, range, &mut writeprotect)
    }

    fn receive(&self, events: &mut Vec<FaultEvent>) -> Result<usize> {
        let mut messages = [UffdMsg::default(); BATCH];
        loop {
            if !self.poll()? {
                return Ok(0);
            }
            let read = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    messages.as_mut_ptr().cast(),
                    size_of::<[UffdMsg; BATCH]>(),
                )
            };
            if read < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            let len = read as usize;
            if len == 0 || len % size_of::<UffdMsg>() != 0 {
                return Err(Error::MalformedRead { len });
            }
            let count = len / size_of::<UffdMsg>();
            for message in &messages[..count] {
                events.push(message.fault_event()?);
            }
            return Ok(count);
        }
    }

    fn wake(&self, range: AddrRange) -> Result<()> {
        let mut uffd_range = UffdioRange::from(range);
        self.channel_ioctl("wake", UFFDIO_WAKE, range, &mut uffd_range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn iowr(nr: u64, size: usize) -> u64 {
        (3 << 30) | ((size as u64) << 16) | (0xAA << 8) | nr
    }

    const fn ior(nr: u64, size: usize) -> u64 {
        (2 << 30) | ((size as u64) << 16) | (0xAA << 8) | nr
    }

    #[test]
    fn test_abi_layout() {
        assert_eq!(size_of::<UffdMsg>(), 32);
        assert_eq!(UFFDIO_API, iowr(0x3F, size_of::<UffdioApi>()));
        assert_eq!(UFFDIO_REGISTER, iowr(0x00, size_of::<UffdioRegister>()));
        assert_eq!(UFFDIO_UNREGISTER, ior(0x01, size_of::<UffdioRange>()));
        assert_eq!(UFFDIO_WAKE, ior(0x02, size_of::<UffdioRange>()));
        assert_eq!(UFFDIO_WRITEPROTECT, iowr(0x06, size_of::<UffdioWriteprotect>()));
    }

    #[test]
    fn test_decode_messages() {
        let mut message = UffdMsg {
            event: UFFD_EVENT_PAGEFAULT,
            arg: [0, 0x7f00_1000, 0],
            ..UffdMsg::default()
        };
        assert_eq!(
            message.fault_event().unwrap(),
            FaultEvent {
                address: 0x7f00_1000,
                kind: FaultKind::Missing
            }
        );
        message.arg[0] = UFFD_PAGEFAULT_FLAG_WP;
        assert_eq!(message.fault_event().unwrap().kind, FaultKind::WriteProtect);

        message.event = 0x13;
        assert!(matches!(message.fault_event(), Err(Error::UnexpectedEvent(0x13))));
    }

    #[test]
    fn test_register_and_wake_when_available() {
        let uffd = match Userfaultfd::open() {
            Ok(uffd) => uffd,
            // Sandboxes commonly forbid userfaultfd for unprivileged users.
            Err(Error::FeatureUnavailable(_)) | Err(Error::Io(_)) => return,
            Err(err) => panic!("unexpected error: {err}"),
        };
        let len = 4096;
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        let range = AddrRange::new(addr as usize, len);

        uffd.register(range, RegisterMode::Missing).unwrap();
        uffd.wake(range).unwrap();
        // Never write-protected: clearing protection fails, unregistering must not.
        uffd.unregister(range).unwrap();
        unsafe { libc::munmap(addr, len) };
    }
}
