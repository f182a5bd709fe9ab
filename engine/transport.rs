//! Transport path: send-side segment rewriting and receive-side registration.
//!
//! A segment that lies inside a pending alias is pointed at the alias's
//! origin instead, so the kernel reads the promised bytes straight from the
//! buffer they still live in. The real call runs with the engine lock held:
//! no origin can be written (its write-protect fault waits for the lock) and
//! no alias can change until the kernel has taken its copy.

use super::{Engine, EngineEntry};
use crate::addr::AddrRange;
use crate::platform::{FaultChannel, MemoryOps};
use crate::store::AliasRecord;
use crate::{Error, Result};
use std::time::Instant;
use tracing::trace;

/// Largest number of segments a rewritten vector may hold.
pub const MAX_SEGMENTS: usize = 1024;

/// Fixed-capacity scatter/gather vector.
///
/// Adjacent pushes that continue the previous segment are merged.
pub struct IoSegments {
    segments: [libc::iovec; MAX_SEGMENTS],
    count: usize,
}

impl Default for IoSegments {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSegments {
    pub fn new() -> Self {
        Self {
            segments: [libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            }; MAX_SEGMENTS],
            count: 0,
        }
    }

    pub fn push(&mut self, base: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if let Some(last) = self.segments[..self.count].last_mut()
            && last.iov_base as usize + last.iov_len == base
        {
            last.iov_len += len;
            return Ok(());
        }
        if self.count == MAX_SEGMENTS {
            return Err(Error::SegmentOverflow { max: MAX_SEGMENTS });
        }
        self.segments[self.count] = libc::iovec {
            iov_base: base as *mut libc::c_void,
            iov_len: len,
        };
        self.count += 1;
        Ok(())
    }

    pub fn as_slice(&self) -> &[libc::iovec] {
        &self.segments[..self.count]
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sum of all segment lengths.
    pub fn total_len(&self) -> usize {
        self.as_slice().iter().map(|segment| segment.iov_len).sum()
    }
}

/// Apply the transport failure policy to a send's return value: a negative
/// result is an [`Error::Transport`] carrying `errno`, never a `-1` handed
/// back to the application.
pub fn checked_sent(sent: isize, errno: libc::c_int) -> Result<isize> {
    if sent < 0 {
        return Err(Error::Transport(std::io::Error::from_raw_os_error(errno)));
    }
    Ok(sent)
}

impl<M: MemoryOps, C: FaultChannel> Engine<M, C> {
    /// Rewrite `iov` so that aliased bytes are read from their origin and
    /// hand the result to `issue`, all under the engine lock.
    ///
    /// Segments at or below the threshold keep their address; any alias they
    /// touch is materialized first so the kernel never faults on it while
    /// the lock is held.
    pub fn with_rewritten<R>(&self, iov: &[libc::iovec], issue: impl FnOnce(&[libc::iovec]) -> R) -> Result<R> {
        let _entry = EngineEntry::enter();
        let mut state = self.lock();
        let mut segments = IoSegments::new();
        let mut rewrote = false;

        for vec in iov {
            let range = AddrRange::new(vec.iov_base as usize, vec.iov_len);
            if range.len <= self.config.threshold {
                self.resolve_overlapping(&mut state, range, true)?;
                segments.push(range.start, range.len)?;
                continue;
            }

            let start = Instant::now();
            let mut cursor = range.start;
            while cursor < range.end() {
                let alias = state
                    .store
                    .lookup_containing(cursor)
                    .filter(|record| !record.is_true_origin())
                    .copied();
                let stop = match alias {
                    Some(record) => {
                        let stop = record.window().end().min(range.end());
                        segments.push(record.translate(cursor), stop - cursor)?;
                        rewrote = true;
                        stop
                    }
                    None => {
                        let stop = state
                            .store
                            .first_alias_after(cursor)
                            .map_or(range.end(), |next| next.key().min(range.end()));
                        segments.push(cursor, stop - cursor)?;
                        stop
                    }
                };
                cursor = stop;
            }
            self.stats.add_lookup_time(start.elapsed());
        }

        if rewrote {
            self.stats.fast_write();
        } else {
            self.stats.slow_write();
        }
        trace!(segments = segments.len(), bytes = segments.total_len(), rewrote, "transport");
        Ok(issue(segments.as_slice()))
    }

    /// Record a freshly received buffer as a true origin for later aliasing.
    ///
    /// Whatever was tracked over the buffer's pages before is resolved first.
    /// Write protection is only armed once an alias borrows from it.
    pub fn register_received(&self, filled: AddrRange) -> Result<()> {
        if filled.len <= self.config.threshold {
            return Ok(());
        }
        let _entry = EngineEntry::enter();
        let mut state = self.lock();
        self.resolve_overlapping(&mut state, filled.page_cover(self.page), false)?;

        let core = filled.page_core(self.page);
        if !core.is_empty() {
            let start = Instant::now();
            state.store.insert(AliasRecord::true_origin(core));
            self.stats.add_insert_time(start.elapsed());
            trace!(window = ?core, "received buffer registered");
        }
        Ok(())
    }
}
