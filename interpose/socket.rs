//! Socket replacements.
//!
//! A failed send aborts the process instead of returning `-1`, whatever its
//! size. Only sends the engine issues on its own behalf keep libc's
//! conventions.

use super::errno;
use crate::addr::AddrRange;
use crate::engine::{checked_sent, is_reentrant};
use crate::runtime::{self, LinuxEngine};
use crate::symbols::{self, RealFns};
use libc::{c_int, c_void, msghdr};
use macros::interpose;

/// Issue one real `sendmsg` over `segments`, keeping the rest of `template`.
unsafe fn send_segments(
    real: &RealFns,
    fd: c_int,
    template: Option<&msghdr>,
    segments: &[libc::iovec],
    flags: c_int,
) -> (isize, c_int) {
    let mut header: msghdr = match template {
        Some(template) => *template,
        None => unsafe { std::mem::zeroed() },
    };
    header.msg_iov = segments.as_ptr().cast_mut();
    header.msg_iovlen = segments.len() as _;
    let sent = unsafe { (real.sendmsg)(fd, &header, flags) };
    (sent, errno())
}

fn checked_send(engine: &LinuxEngine, rewritten: crate::Result<(isize, c_int)>) -> isize {
    match rewritten.and_then(|(sent, code)| checked_sent(sent, code)) {
        Ok(sent) => sent,
        Err(err) => engine.die(err),
    }
}

/// Result of a send that went straight to libc.
fn checked_passthrough(sent: isize) -> isize {
    match checked_sent(sent, errno()) {
        Ok(sent) => sent,
        Err(err) => runtime::engine().die(err),
    }
}

/// `send` that reads still-virtual bytes from their origin.
#[interpose]
pub unsafe fn send(fd: c_int, buf: *const c_void, len: usize, flags: c_int) -> isize {
    let real = symbols::real();
    if is_reentrant() {
        return unsafe { (real.send)(fd, buf, len, flags) };
    }
    if len <= runtime::passthrough_limit() {
        return checked_passthrough(unsafe { (real.send)(fd, buf, len, flags) });
    }
    let engine = runtime::engine();
    let iov = [libc::iovec {
        iov_base: buf.cast_mut(),
        iov_len: len,
    }];
    let rewritten = engine.with_rewritten(&iov, |segments| unsafe {
        send_segments(real, fd, None, segments, flags)
    });
    checked_send(engine, rewritten)
}

/// `sendmsg` that rewrites every segment of the message in one call.
#[interpose]
pub unsafe fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> isize {
    let real = symbols::real();
    if is_reentrant() {
        return unsafe { (real.sendmsg)(fd, msg, flags) };
    }
    if msg.is_null() {
        return checked_passthrough(unsafe { (real.sendmsg)(fd, msg, flags) });
    }
    let template = unsafe { &*msg };
    let iov = unsafe { message_iov(template) };
    let limit = runtime::passthrough_limit();
    if iov.iter().all(|segment| segment.iov_len <= limit) {
        return checked_passthrough(unsafe { (real.sendmsg)(fd, msg, flags) });
    }
    let engine = runtime::engine();
    let rewritten = engine.with_rewritten(iov, |segments| unsafe {
        send_segments(real, fd, Some(template), segments, flags)
    });
    checked_send(engine, rewritten)
}

/// `recv` that offers large received buffers as origins for later copies.
#[interpose]
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: usize, flags: c_int) -> isize {
    let real = symbols::real();
    let received = unsafe { (real.recv)(fd, buf, len, flags) };
    if received <= 0 || received as usize <= runtime::passthrough_limit() || is_reentrant() {
        return received;
    }
    let engine = runtime::engine();
    let filled = AddrRange::new(buf as usize, received as usize);
    if let Err(err) = engine.register_received(filled) {
        engine.die(err);
    }
    received
}

/// `recvmsg` that registers every large filled segment.
#[interpose]
pub unsafe fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> isize {
    let real = symbols::real();
    let received = unsafe { (real.recvmsg)(fd, msg, flags) };
    if received <= 0 || received as usize <= runtime::passthrough_limit() || is_reentrant() {
        return received;
    }
    let engine = runtime::engine();
    let mut remaining = received as usize;
    for segment in unsafe { message_iov(&*msg) } {
        if remaining == 0 {
            break;
        }
        let filled = segment.iov_len.min(remaining);
        remaining -= filled;
        if let Err(err) = engine.register_received(AddrRange::new(segment.iov_base as usize, filled)) {
            engine.die(err);
        }
    }
    received
}

/// The iovec array of `header` as a slice.
unsafe fn message_iov(header: &msghdr) -> &[libc::iovec] {
    if header.msg_iov.is_null() || header.msg_iovlen == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(header.msg_iov, header.msg_iovlen as usize) }
}
