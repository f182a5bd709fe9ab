use super::{errno, set_errno};
use crate::engine::is_reentrant;
use crate::{runtime, symbols};
use libc::{c_int, c_void, off_t};
use macros::interpose;

/// `pwrite` that reads still-virtual bytes from their origin.
///
/// Large writes are issued as a single `pwritev` over the rewritten
/// segments; errors keep the usual `-1`/`errno` convention.
#[interpose]
pub unsafe fn pwrite(fd: c_int, buf: *const c_void, count: usize, offset: off_t) -> isize {
    let real = symbols::real();
    if count <= runtime::passthrough_limit() || is_reentrant() {
        return unsafe { (real.pwrite)(fd, buf, count, offset) };
    }
    let engine = runtime::engine();

    let iov = [libc::iovec {
        iov_base: buf.cast_mut(),
        iov_len: count,
    }];
    let rewritten = engine.with_rewritten(&iov, |segments| {
        let written = unsafe { (real.pwritev)(fd, segments.as_ptr(), segments.len() as c_int, offset) };
        (written, errno())
    });
    match rewritten {
        Ok((written, code)) => {
            if written < 0 {
                set_errno(code);
            }
            written
        }
        Err(err) => engine.die(err),
    }
}
