use crate::engine::is_reentrant;
use crate::{runtime, symbols};
use libc::c_void;
use macros::interpose;

/// `memcpy` that aliases the page-aligned middle of large copies.
#[interpose]
pub unsafe fn memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    if n <= runtime::passthrough_limit() || is_reentrant() {
        return unsafe { symbols::real_memcpy(dst, src, n) };
    }
    let engine = runtime::engine();
    if let Err(err) = unsafe { engine.copy(dst.cast(), src.cast(), n) } {
        engine.die(err);
    }
    dst
}
