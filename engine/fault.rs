//! Fault servicing.

use super::{Engine, EngineEntry, State};
use crate::addr::AddrRange;
use crate::platform::{FaultChannel, FaultEvent, FaultKind, MemoryOps};
use crate::store::AliasRecord;
use crate::{Error, Result};
use std::convert::Infallible;
use tracing::{debug, trace};

/// Where inside a record's window a missing fault landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Leading,
    Trailing,
    Interior,
    Whole,
}

impl<M: MemoryOps, C: FaultChannel> Engine<M, C> {
    /// Resolve one fault so the suspended thread can be resumed.
    pub fn service_fault(&self, event: FaultEvent) -> Result<()> {
        let _entry = EngineEntry::enter();
        let mut state = self.lock();
        match event.kind {
            FaultKind::Missing => self.service_missing(&mut state, event.address),
            FaultKind::WriteProtect => self.service_write_protect(&mut state, event.address),
        }
    }

    /// Materialize the touched page of an alias, shrinking or splitting its
    /// record. Leftovers shorter than the threshold are materialized along
    /// with it.
    fn service_missing(&self, state: &mut State, address: usize) -> Result<()> {
        let page = AddrRange::page_of(address, self.page);
        let found = state
            .store
            .lookup_containing(page.start)
            .copied()
            .filter(|record| !record.is_true_origin());
        let Some(record) = found else {
            // Materialized after the fault was queued. Should the page still
            // be missing, the woken thread faults again.
            let expected = state.recent.covers(page);
            trace!(address, expected, "fault on a page with no alias");
            return self.channel.wake(page);
        };

        let window = record.window();
        state.store.delete(record.key());

        let head = AddrRange::from_bounds(window.start, page.start);
        let tail = AddrRange::from_bounds(page.end(), window.end());
        let edge = match (head.is_empty(), tail.is_empty()) {
            (true, true) => Edge::Whole,
            (true, false) => Edge::Leading,
            (false, true) => Edge::Trailing,
            (false, false) => Edge::Interior,
        };

        let mut fill = page;
        for side in [head, tail] {
            if side.is_empty() {
                continue;
            }
            if self.worth_keeping(side.len) {
                state.store.insert(AliasRecord::alias(
                    record.owner,
                    record.origin,
                    side.start - record.owner,
                    side.len,
                ));
            } else {
                fill = AddrRange::from_bounds(fill.start.min(side.start), fill.end().max(side.end()));
            }
        }

        trace!(address, ?edge, ?fill, "missing fault");
        self.stats.missing_fault();
        self.materialize(state, fill, record.translate(fill.start))
    }

    /// Copy out everything still borrowing from the written origin, then let
    /// the write through.
    fn service_write_protect(&self, state: &mut State, address: usize) -> Result<()> {
        let page = AddrRange::page_of(address, self.page);
        let origin = state
            .store
            .lookup_containing(page.start)
            .copied()
            .filter(AliasRecord::is_true_origin);

        self.stats.write_protect_fault();
        match origin {
            Some(origin) => {
                trace!(address, ?origin, "write-protect fault");
                self.flush_dependents(state, origin.window())?;
                self.channel.set_write_protect(page, false)?;
            }
            None => debug!(address, "write-protect fault outside any origin"),
        }
        self.channel.wake(page)
    }
}

/// Long-running loop that drains the fault channel into an [`Engine`].
///
/// Blocks in [`FaultChannel::receive`] while idle and never stops on its
/// own: a closed channel or a servicing error is returned to the caller,
/// which is expected to treat it as fatal. Threads suspended on a trap have
/// nobody else to resume them.
pub struct FaultService<'a, M, C> {
    engine: &'a Engine<M, C>,
    events: Vec<FaultEvent>,
}

impl<'a, M: MemoryOps, C: FaultChannel> FaultService<'a, M, C> {
    pub fn new(engine: &'a Engine<M, C>) -> Self {
        Self {
            engine,
            events: Vec::with_capacity(16),
        }
    }

    pub fn run(&mut self) -> Result<Infallible> {
        loop {
            trace!("idle");
            self.events.clear();
            let received = self.engine.channel().receive(&mut self.events)?;
            if received == 0 {
                return Err(Error::ChannelClosed);
            }
            trace!(received, "servicing");
            for event in self.events.drain(..) {
                self.engine.service_fault(event)?;
            }
        }
    }
}
