//! The aliasing engine.
//!
//! An [`Engine`] owns the alias store, the memory and fault-channel
//! primitives, and one process-wide lock. Every mutation of the store and
//! every remap or trap change triggered by it happens under that lock, so
//! that the bookkeeping and what the kernel sees change together.
//!
//! # Operations
//!
//! - [`Engine::copy`] - virtualize an above-threshold copy ([`copy`])
//! - [`Engine::resolve`] - honour every promise made at an address now
//! - [`Engine::with_rewritten`] / [`Engine::register_received`] - the
//!   transport paths ([`transport`])
//! - [`Engine::service_fault`] - materialize exactly what was touched ([`fault`])
//!
//! # Reentrancy
//!
//! Anything the engine itself does while holding the lock (logging,
//! allocation, the real transport calls) may call back into an interposed
//! primitive on the same thread. A thread-local depth counter marks the
//! thread as inside the engine, and [`is_reentrant`] tells the interposers
//! to pass such calls straight through.

pub mod copy;
pub mod fault;
pub mod transport;

pub use fault::FaultService;
pub use transport::{IoSegments, MAX_SEGMENTS, checked_sent};

use crate::addr::{AddrRange, PageSize};
use crate::config::Config;
use crate::platform::{FaultChannel, MemoryOps};
use crate::stats::Stats;
use crate::store::{AliasRecord, AliasStore};
use crate::{Error, Result};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{error, trace};

thread_local! {
    static ENGINE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the current thread is already executing engine code.
pub fn is_reentrant() -> bool {
    ENGINE_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(true)
}

/// Marks the current thread as inside the engine until dropped.
pub(crate) struct EngineEntry;

impl EngineEntry {
    pub(crate) fn enter() -> Self {
        let _ = ENGINE_DEPTH.try_with(|depth| depth.set(depth.get() + 1));
        EngineEntry
    }
}

impl Drop for EngineEntry {
    fn drop(&mut self) {
        let _ = ENGINE_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Windows materialized recently.
///
/// Several threads can fault on the same page, or a thread can fault just
/// before an explicit resolution remaps its page. The queued fault then
/// finds no record. One lock hold can materialize any number of windows, so
/// this only tells the trace which stale faults were expected.
#[derive(Debug, Default)]
struct RecentWindows {
    windows: VecDeque<AddrRange>,
}

impl RecentWindows {
    const CAPACITY: usize = 64;

    fn push(&mut self, window: AddrRange) {
        if self.windows.len() == Self::CAPACITY {
            self.windows.pop_front();
        }
        self.windows.push_back(window);
    }

    fn covers(&self, page: AddrRange) -> bool {
        self.windows.iter().any(|window| window.covers(&page))
    }
}

/// State guarded by the engine lock.
pub(crate) struct State {
    store: AliasStore,
    recent: RecentWindows,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: Config,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn threshold(mut self, threshold: usize) -> Self {
        self.config.threshold = threshold;
        self
    }

    pub fn build<M: MemoryOps, C: FaultChannel>(self, memory: M, channel: C) -> Engine<M, C> {
        let page = memory.page_size();
        Engine {
            memory,
            channel,
            config: self.config,
            page,
            state: Mutex::new(State {
                store: AliasStore::new(),
                recent: RecentWindows::default(),
            }),
            stats: Stats::default(),
        }
    }
}

/// Buffer-aliasing and lazy-materialization engine.
pub struct Engine<M, C> {
    memory: M,
    channel: C,
    config: Config,
    page: PageSize,
    state: Mutex<State>,
    stats: Stats,
}

impl<M: MemoryOps, C: FaultChannel> Engine<M, C> {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn page_size(&self) -> PageSize {
        self.page
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A new alias must borrow more than the threshold.
    fn worth_aliasing(&self, len: usize) -> bool {
        len > self.config.threshold
    }

    /// What a fault leaves of an alias stays virtual while it is at least
    /// the threshold long.
    fn worth_keeping(&self, len: usize) -> bool {
        len > 0 && len >= self.config.threshold
    }

    pub fn record_count(&self) -> usize {
        let _entry = EngineEntry::enter();
        self.lock().store.len()
    }

    /// Snapshot of every live record in address order.
    pub fn records(&self) -> Vec<AliasRecord> {
        let _entry = EngineEntry::enter();
        self.lock().store.iter().copied().collect()
    }

    /// The record whose window covers `addr`, if any.
    pub fn lookup(&self, addr: usize) -> Option<AliasRecord> {
        let _entry = EngineEntry::enter();
        self.lock().store.lookup_containing(addr).copied()
    }

    /// Honour every promise made at `key` now.
    ///
    /// A true origin has its dependents copied out and its trap removed; an
    /// alias is copied in from its origin. Either way the record is gone
    /// afterwards. Resolving a key with no record is a no-op.
    pub fn resolve(&self, key: usize) -> Result<()> {
        let _entry = EngineEntry::enter();
        let mut state = self.lock();
        self.resolve_locked(&mut state, key)
    }

    pub(crate) fn resolve_locked(&self, state: &mut State, key: usize) -> Result<()> {
        let mut pending = Some(key);
        while let Some(key) = pending.take() {
            let Some(record) = state.store.delete(key) else {
                break;
            };
            trace!(?record, "resolving");
            if record.is_true_origin() {
                self.flush_dependents(state, record.window())?;
                self.channel.unregister(record.window())?;
                continue;
            }
            self.materialize(state, record.window(), record.translate(record.key()))?;
            // Earlier partial materialization can leave the rest of the same
            // destination as a separate record behind this one.
            pending = state
                .store
                .next(record.key())
                .filter(|next| next.owner == record.owner && next.origin == record.origin)
                .map(|next| next.key());
        }
        Ok(())
    }

    /// Resolve every record overlapping `range`. With `aliases_only`, true
    /// origins are left alone (reading them is always safe).
    pub(crate) fn resolve_overlapping(
        &self,
        state: &mut State,
        range: AddrRange,
        aliases_only: bool,
    ) -> Result<()> {
        let start = Instant::now();
        let keys = state.store.overlapping(range);
        self.stats.add_lookup_time(start.elapsed());
        for key in keys {
            let skip = match state.store.lookup_exact(key) {
                None => true,
                Some(record) => aliases_only && record.is_true_origin(),
            };
            if !skip {
                self.resolve_locked(state, key)?;
            }
        }
        Ok(())
    }

    /// Copy out every alias still reading from `origin` and drop its record.
    pub(crate) fn flush_dependents(&self, state: &mut State, origin: AddrRange) -> Result<()> {
        for key in state.store.dependents_of(origin) {
            if let Some(record) = state.store.delete(key) {
                trace!(?record, "flushing dependent");
                self.materialize(state, record.window(), record.translate(record.key()))?;
            }
        }
        Ok(())
    }

    /// Back `window` with real pages holding the bytes found at `src`.
    pub(crate) fn materialize(&self, state: &mut State, window: AddrRange, src: usize) -> Result<()> {
        unsafe {
            self.memory.map_zeroed(window, true)?;
            self.memory.copy(window.start, src, window.len);
        }
        state.recent.push(window);
        self.stats.add_materialized(window.len);
        self.channel.wake(window)
    }

    /// Arm write protection over a true origin's window.
    pub(crate) fn arm_origin(&self, window: AddrRange) -> Result<()> {
        self.channel
            .register(window, crate::platform::RegisterMode::WriteProtect)?;
        self.channel.set_write_protect(window, true)
    }

    /// Log `err` with the counters and a short record dump, then abort.
    pub fn die(&self, err: Error) -> ! {
        error!(%err, "fatal zcopy error");
        self.stats.report();
        match self.state.try_lock() {
            Ok(state) => {
                error!(records = state.store.len(), "alias store dump");
                for record in state.store.iter().take(16) {
                    error!(?record, window = ?record.window(), origin = ?record.origin_window());
                }
            }
            Err(_) => error!("alias store is locked; skipping dump"),
        }
        std::process::abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::{PAGE, SimSpace, pattern};

    #[test]
    fn test_resolve_without_record_is_noop() {
        let space = SimSpace::new(8);
        let engine = space.engine(4096);
        engine.resolve(space.addr(0)).unwrap();
        assert_eq!(engine.record_count(), 0);
        assert_eq!(engine.stats().snapshot().bytes_materialized, 0);
    }

    #[test]
    fn test_resolve_alias_materializes_and_deletes() {
        let space = SimSpace::new(16);
        let engine = space.engine(4096);
        let (src, dst) = (space.addr(0), space.addr(8 * PAGE));
        let data = pattern(2 * PAGE, 7);
        space.poke(src, &data);

        unsafe { engine.copy(dst as *mut u8, src as *const u8, data.len()) }.unwrap();
        assert!(space.is_missing(dst));

        engine.resolve(dst).unwrap();
        assert!(engine.lookup(dst).is_none());
        assert!(!space.is_missing(dst));
        assert_eq!(space.peek(dst, data.len()), data);

        // Resolving again finds nothing left to do.
        let before = engine.stats().snapshot().bytes_materialized;
        engine.resolve(dst).unwrap();
        assert_eq!(engine.stats().snapshot().bytes_materialized, before);
    }

    #[test]
    fn test_resolve_origin_flushes_dependents() {
        let space = SimSpace::new(24);
        let engine = space.engine(4096);
        let src = space.addr(0);
        let (b1, b2) = (space.addr(8 * PAGE), space.addr(16 * PAGE));
        let data = pattern(2 * PAGE, 3);
        space.poke(src, &data);

        unsafe {
            engine.copy(b1 as *mut u8, src as *const u8, data.len()).unwrap();
            engine.copy(b2 as *mut u8, src as *const u8, data.len()).unwrap();
        }
        assert_eq!(engine.record_count(), 3);

        engine.resolve(src).unwrap();
        assert_eq!(engine.record_count(), 0);
        assert!(!space.is_write_protected(src));
        assert_eq!(space.peek(b1, data.len()), data);
        assert_eq!(space.peek(b2, data.len()), data);
    }

    #[test]
    fn test_resolve_follows_split_segments() {
        let space = SimSpace::new(24);
        let engine = space.engine(4096);
        let (src, dst) = (space.addr(0), space.addr(12 * PAGE));
        let data = pattern(8 * PAGE, 11);
        space.poke(src, &data);

        unsafe { engine.copy(dst as *mut u8, src as *const u8, data.len()) }.unwrap();
        // Touch the middle so the record splits in two.
        let middle = dst + 3 * PAGE;
        space.read_with(middle, 1, |event| engine.service_fault(event).unwrap());
        let aliases: Vec<_> = engine.records().into_iter().filter(|r| !r.is_true_origin()).collect();
        assert_eq!(aliases.len(), 2);

        engine.resolve(aliases[0].key()).unwrap();
        assert!(engine.records().iter().all(|r| r.is_true_origin()));
        assert_eq!(space.peek(dst, data.len()), data);
    }

    #[test]
    fn test_reentrancy_marker() {
        assert!(!is_reentrant());
        {
            let _outer = EngineEntry::enter();
            assert!(is_reentrant());
            {
                let _inner = EngineEntry::enter();
                assert!(is_reentrant());
            }
            assert!(is_reentrant());
        }
        assert!(!is_reentrant());
    }
}
