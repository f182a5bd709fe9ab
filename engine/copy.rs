//! Copy path.
//!
//! An above-threshold copy is split into a leading fringe, a page-aligned
//! middle and a trailing remainder. Fringes are copied physically; the middle
//! becomes an alias record whose pages are mapped fresh and trapped as
//! missing, while the bytes it borrows are write-protected at their origin.
//! Whatever cannot be aliased in one record is handled by the next step of
//! the same pass, never by re-entering the interposer.

use super::{Engine, EngineEntry, State};
use crate::Result;
use crate::addr::AddrRange;
use crate::platform::{FaultChannel, MemoryOps, RegisterMode};
use crate::store::AliasRecord;
use std::time::Instant;
use tracing::trace;

/// Work remaining in one copy call.
struct CopyPass {
    dest: AddrRange,
    source: AddrRange,
}

impl CopyPass {
    fn advance(&mut self, len: usize) {
        self.dest = self.dest.skip(len);
        self.source = self.source.skip(len);
    }
}

/// Where an alias's bytes will come from and how many of them one record may borrow.
struct SourceOrigin {
    addr: usize,
    len: usize,
}

impl<M: MemoryOps, C: FaultChannel> Engine<M, C> {
    /// Copy `n` bytes from `src` to `dst` with `memcpy` semantics.
    ///
    /// At or below the threshold this is a plain copy. Above it, any pending
    /// alias or origin at the destination is resolved first, then the
    /// page-aligned middle is aliased instead of copied.
    ///
    /// # Safety
    ///
    /// Same contract as `memcpy`: both ranges valid for `n` bytes and not
    /// overlapping.
    pub unsafe fn copy(&self, dst: *mut u8, src: *const u8, n: usize) -> Result<()> {
        if n <= self.config.threshold {
            unsafe { self.memory.copy(dst as usize, src as usize, n) };
            return Ok(());
        }

        let _entry = EngineEntry::enter();
        let mut state = self.lock();
        let mut pass = CopyPass {
            dest: AddrRange::from_ptr(dst, n),
            source: AddrRange::from_ptr(src, n),
        };
        trace!(dest = ?pass.dest, source = ?pass.source, "copy");

        self.resolve_overlapping(&mut state, pass.dest.page_cover(self.page), false)?;

        let avoid = pass.dest.page_cover(self.page);
        let mut aliased = false;
        while !pass.dest.is_empty() {
            aliased |= self.copy_step(&mut state, &mut pass, avoid)?;
        }

        if aliased {
            self.stats.fast_copy();
        } else {
            self.stats.slow_copy();
        }
        Ok(())
    }

    /// Handle the front of the pass: alias one record's worth, or copy a chunk.
    fn copy_step(&self, state: &mut State, pass: &mut CopyPass, avoid: AddrRange) -> Result<bool> {
        let core = pass.dest.page_core(self.page);
        if !self.worth_aliasing(core.len) {
            self.copy_direct(state, pass.dest, pass.source)?;
            pass.advance(pass.dest.len);
            return Ok(false);
        }

        let lead = pass.dest.leading_fringe(self.page);
        let wanted = AddrRange::new(pass.source.start + lead, core.len);
        let Some(origin) = self.source_origin(state, wanted, avoid)? else {
            let chunk = (lead + self.config.threshold.max(self.page.get())).min(pass.dest.len);
            trace!(chunk, "source cannot back an alias here");
            self.copy_direct(state, pass.dest.take(chunk), pass.source.take(chunk))?;
            pass.advance(chunk);
            return Ok(false);
        };

        if lead > 0 {
            self.copy_direct(state, pass.dest.take(lead), pass.source.take(lead))?;
        }

        let window = AddrRange::new(core.start, origin.len);
        let record = AliasRecord::alias(pass.dest.start, origin.addr - lead, lead, origin.len);
        unsafe { self.memory.map_zeroed(window, false)? };
        self.channel.register(window, RegisterMode::Missing)?;

        let start = Instant::now();
        state.store.insert(record);
        self.stats.add_insert_time(start.elapsed());
        self.stats.record_created();
        trace!(?record, "aliased");

        pass.advance(lead + origin.len);
        Ok(true)
    }

    /// Find (or establish) the true origin backing `wanted`.
    ///
    /// Returns `None` unless more than a threshold's worth of whole pages
    /// can be borrowed starting at `wanted.start`.
    fn source_origin(
        &self,
        state: &mut State,
        wanted: AddrRange,
        avoid: AddrRange,
    ) -> Result<Option<SourceOrigin>> {
        let start = Instant::now();
        let found = state.store.lookup_containing(wanted.start).copied();
        self.stats.add_lookup_time(start.elapsed());

        if let Some(record) = found {
            let available = record.window().end() - wanted.start;
            let len = self.page.whole_pages(available.min(wanted.len));
            if !self.worth_aliasing(len) {
                return Ok(None);
            }
            if record.is_true_origin() {
                self.arm_origin(record.window())?;
                return Ok(Some(SourceOrigin {
                    addr: wanted.start,
                    len,
                }));
            }
            // The source is itself still borrowed: point at its origin instead.
            return Ok(Some(SourceOrigin {
                addr: record.translate(wanted.start),
                len,
            }));
        }

        let cover_start = self.page.align_down(wanted.start);
        let limit = state
            .store
            .first_at_or_after(cover_start)
            .map_or(usize::MAX, |next| next.key())
            .min(self.page.align_up(wanted.end()));
        let len = self
            .page
            .whole_pages(limit.saturating_sub(wanted.start).min(wanted.len));
        if !self.worth_aliasing(len) {
            return Ok(None);
        }

        let window = AddrRange::new(wanted.start, len).page_cover(self.page);
        if window.overlaps(&avoid) {
            // Protecting it would trap the fringe writes of this very copy.
            return Ok(None);
        }
        self.arm_origin(window)?;
        let start = Instant::now();
        state.store.insert(AliasRecord::true_origin(window));
        self.stats.add_insert_time(start.elapsed());
        trace!(?window, "new true origin");
        Ok(Some(SourceOrigin {
            addr: wanted.start,
            len,
        }))
    }

    /// Physical copy of bytes read under the lock: any alias over the source
    /// is materialized first so the read cannot trap.
    fn copy_direct(&self, state: &mut State, dest: AddrRange, source: AddrRange) -> Result<()> {
        self.resolve_overlapping(state, source, true)?;
        unsafe { self.memory.copy(dest.start, source.start, dest.len) };
        Ok(())
    }
}
