//! Interposed symbols and the real implementations they shadow.
//!
//! Every function exported with `#[interpose]` lands in [`INTERPOSED`]. The
//! libc functions they replace are bound once with `dlsym(RTLD_NEXT, ..)` and
//! kept in [`RealFns`].

use crate::engine::EngineEntry;
use crate::{Error, Result};
use libc::{c_int, c_void};
use linkme::distributed_slice;
use std::ffi::CStr;
use std::sync::OnceLock;
use tracing::error;

/// Entry address of an exported replacement, as stored in [`INTERPOSED`].
///
/// Only compared against `dlsym` results, never called through.
#[derive(Clone, Copy)]
pub struct FnPtr(pub *const ());

// SAFETY: the address names code in this library and is only read.
unsafe impl Sync for FnPtr {}

/// Distributed slice of exported replacements, keyed by C symbol name.
#[distributed_slice]
pub static INTERPOSED: [(&str, FnPtr)] = [..];

/// Names of every exported replacement.
pub fn interposed_names() -> impl Iterator<Item = &'static str> {
    INTERPOSED.iter().map(|(name, _)| *name)
}

/// Whether `addr` is one of our own replacements.
pub fn is_interposed(addr: usize) -> bool {
    INTERPOSED.iter().any(|(_, ptr)| ptr.0 as usize == addr)
}

/// Resolve the next definition of `name` after this library.
pub fn resolve_next(name: &'static CStr) -> Result<*mut c_void> {
    let symbol = name.to_str().unwrap_or("<non-utf8>");
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if addr.is_null() || is_interposed(addr as usize) {
        return Err(Error::Symbol(symbol));
    }
    Ok(addr)
}

pub type MemcpyFn = unsafe extern "C" fn(*mut c_void, *const c_void, usize) -> *mut c_void;
pub type SendFn = unsafe extern "C" fn(c_int, *const c_void, usize, c_int) -> isize;
pub type SendmsgFn = unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> isize;
pub type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, usize, c_int) -> isize;
pub type RecvmsgFn = unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> isize;
pub type PwriteFn = unsafe extern "C" fn(c_int, *const c_void, usize, libc::off_t) -> isize;
pub type PwritevFn = unsafe extern "C" fn(c_int, *const libc::iovec, c_int, libc::off_t) -> isize;

/// The libc implementations behind every interposed symbol.
pub struct RealFns {
    pub memcpy: MemcpyFn,
    pub send: SendFn,
    pub sendmsg: SendmsgFn,
    pub recv: RecvFn,
    pub recvmsg: RecvmsgFn,
    pub pwrite: PwriteFn,
    pub pwritev: PwritevFn,
}

impl RealFns {
    fn bind() -> Result<Self> {
        // SAFETY: each symbol is the libc function with the matching C signature.
        unsafe {
            Ok(Self {
                memcpy: std::mem::transmute::<*mut c_void, MemcpyFn>(resolve_next(c"memcpy")?),
                send: std::mem::transmute::<*mut c_void, SendFn>(resolve_next(c"send")?),
                sendmsg: std::mem::transmute::<*mut c_void, SendmsgFn>(resolve_next(c"sendmsg")?),
                recv: std::mem::transmute::<*mut c_void, RecvFn>(resolve_next(c"recv")?),
                recvmsg: std::mem::transmute::<*mut c_void, RecvmsgFn>(resolve_next(c"recvmsg")?),
                pwrite: std::mem::transmute::<*mut c_void, PwriteFn>(resolve_next(c"pwrite")?),
                pwritev: std::mem::transmute::<*mut c_void, PwritevFn>(resolve_next(c"pwritev")?),
            })
        }
    }
}

static REAL: OnceLock<RealFns> = OnceLock::new();

/// The real implementations, binding them on first use.
///
/// Without them not even a passthrough is possible, so failing to bind
/// aborts the process.
pub fn real() -> &'static RealFns {
    if let Some(real) = REAL.get() {
        return real;
    }
    // dlsym may copy memory itself; those copies must not come back here.
    let _entry = EngineEntry::enter();
    REAL.get_or_init(|| {
        RealFns::bind().unwrap_or_else(|err| {
            error!(%err, "cannot bind libc");
            std::process::abort()
        })
    })
}

/// The real implementations if they are already bound.
pub fn try_real() -> Option<&'static RealFns> {
    REAL.get()
}

/// Copy through the real `memcpy`, or byte by byte while it is being bound.
///
/// # Safety
///
/// Same contract as `memcpy`.
pub unsafe fn real_memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    let real = match try_real() {
        Some(real) => real,
        None if crate::engine::is_reentrant() => {
            let (dst_bytes, src_bytes) = (dst as *mut u8, src as *const u8);
            for i in 0..n {
                // Volatile so the loop is not turned back into a memcpy call.
                unsafe { dst_bytes.add(i).write_volatile(src_bytes.add(i).read_volatile()) };
            }
            return dst;
        }
        None => real(),
    };
    unsafe { (real.memcpy)(dst, src, n) }
}
