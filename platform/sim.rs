//! Simulated address space for exercising the engine without userfaultfd.
//!
//! A page-aligned heap arena stands in for process memory. Each page carries
//! the trap state the kernel would keep for it, and every access made by a
//! test goes through [`SimSpace::read_with`]/[`SimSpace::write_with`] (or the
//! blocking variants), which raise fault events exactly where the real
//! channel would. Copies issued by the engine itself are checked too: the
//! engine must never touch trapped memory while it holds its lock, because on
//! a real system that access would block forever.

use super::{FaultChannel, FaultEvent, FaultKind, MemoryOps, RegisterMode};
use crate::addr::{AddrRange, PageSize};
use crate::engine::{Engine, EngineBuilder};
use crate::{Error, Result};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub const PAGE: usize = 4096;

pub type SimEngine = Engine<Arc<SimSpace>, Arc<SimSpace>>;

#[derive(Debug, Clone, Copy)]
struct PageState {
    populated: bool,
    missing_trap: bool,
    wp_trap: bool,
    wp: bool,
}

impl PageState {
    const PRESENT: PageState = PageState {
        populated: true,
        missing_trap: false,
        wp_trap: false,
        wp: false,
    };

    fn trap(&self, write: bool) -> Option<FaultKind> {
        if !self.populated && self.missing_trap {
            Some(FaultKind::Missing)
        } else if write && self.wp_trap && self.wp {
            Some(FaultKind::WriteProtect)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct FaultQueue {
    pending: VecDeque<FaultEvent>,
    closed: bool,
}

pub struct SimSpace {
    base: usize,
    layout: Layout,
    pages: Mutex<Vec<PageState>>,
    faults: Mutex<FaultQueue>,
    fault_ready: Condvar,
    wakes: Mutex<Vec<AddrRange>>,
    woken: Condvar,
}

// SAFETY: the arena is owned by the space and every byte access is
// coordinated through the page table or by the engine's lock.
unsafe impl Send for SimSpace {}
unsafe impl Sync for SimSpace {}

impl SimSpace {
    pub fn new(pages: usize) -> Arc<Self> {
        let layout = Layout::from_size_align(pages * PAGE, PAGE).expect("arena layout");
        let base = unsafe { alloc_zeroed(layout) } as usize;
        assert_ne!(base, 0, "arena allocation failed");
        Arc::new(Self {
            base,
            layout,
            pages: Mutex::new(vec![PageState::PRESENT; pages]),
            faults: Mutex::new(FaultQueue::default()),
            fault_ready: Condvar::new(),
            wakes: Mutex::new(Vec::new()),
            woken: Condvar::new(),
        })
    }

    /// Absolute address of `offset` bytes into the arena.
    pub fn addr(&self, offset: usize) -> usize {
        assert!(offset <= self.layout.size());
        self.base + offset
    }

    /// Engine over this space with the given threshold.
    pub fn engine(self: &Arc<Self>, threshold: usize) -> SimEngine {
        EngineBuilder::new()
            .threshold(threshold)
            .build(Arc::clone(self), Arc::clone(self))
    }

    fn page_index(&self, addr: usize) -> usize {
        assert!(
            addr >= self.base && addr < self.base + self.layout.size(),
            "address {addr:#x} outside the arena"
        );
        (addr - self.base) / PAGE
    }

    fn page_indices(&self, range: AddrRange) -> std::ops::Range<usize> {
        if range.is_empty() {
            return 0..0;
        }
        self.page_index(range.start)..self.page_index(range.end() - 1) + 1
    }

    fn check_page_range(&self, range: AddrRange, op: &'static str) -> Result<()> {
        let page = PageSize::DEFAULT;
        let inside = range.start >= self.base && range.end() <= self.base + self.layout.size();
        if page.is_aligned(range.start) && page.is_aligned(range.len) && inside {
            Ok(())
        } else {
            Err(Error::Channel {
                op,
                range,
                source: std::io::Error::from_raw_os_error(libc::EINVAL),
            })
        }
    }

    /// Write setup bytes directly. Panics if any page of the range is trapped.
    pub fn poke(&self, addr: usize, data: &[u8]) {
        let range = AddrRange::new(addr, data.len());
        {
            let mut pages = self.pages.lock().unwrap();
            for index in self.page_indices(range) {
                assert!(pages[index].trap(true).is_none(), "poke into trapped page");
                pages[index].populated = true;
            }
        }
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
    }

    /// Read the raw bytes regardless of trap state.
    pub fn peek(&self, addr: usize, len: usize) -> Vec<u8> {
        let _ = self.page_indices(AddrRange::new(addr, len));
        unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
    }

    pub fn trap_at(&self, addr: usize, write: bool) -> Option<FaultKind> {
        let index = self.page_index(addr);
        self.pages.lock().unwrap()[index].trap(write)
    }

    pub fn is_missing(&self, addr: usize) -> bool {
        self.trap_at(addr, false) == Some(FaultKind::Missing)
    }

    pub fn is_write_protected(&self, addr: usize) -> bool {
        let index = self.page_index(addr);
        let page = self.pages.lock().unwrap()[index];
        page.wp_trap && page.wp
    }

    /// Ranges passed to [`FaultChannel::wake`] so far.
    pub fn wakes(&self) -> Vec<AddrRange> {
        self.wakes.lock().unwrap().clone()
    }

    /// Stop the fault stream: `receive` returns zero once the queue drains.
    pub fn close(&self) {
        self.faults.lock().unwrap().closed = true;
        self.fault_ready.notify_all();
    }

    /// Access `range` page by page, handing every trap to `service` the way
    /// a faulting thread is suspended until the fault service resumes it.
    fn access(&self, range: AddrRange, write: bool, service: &mut dyn FnMut(FaultEvent)) {
        for index in self.page_indices(range) {
            let page_start = self.base + index * PAGE;
            let address = range.start.max(page_start);
            let mut attempts = 0;
            loop {
                let trap = self.pages.lock().unwrap()[index].trap(write);
                let Some(kind) = trap else { break };
                attempts += 1;
                assert!(attempts < 3, "fault at {address:#x} ({kind:?}) was never resolved");
                service(FaultEvent { address, kind });
            }
            self.pages.lock().unwrap()[index].populated = true;
        }
    }

    pub fn read_with(&self, addr: usize, len: usize, mut service: impl FnMut(FaultEvent)) -> Vec<u8> {
        self.access(AddrRange::new(addr, len), false, &mut service);
        self.peek(addr, len)
    }

    pub fn write_with(&self, addr: usize, data: &[u8], mut service: impl FnMut(FaultEvent)) {
        self.access(AddrRange::new(addr, data.len()), true, &mut service);
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
    }

    /// Post the fault to the channel and wait until the page stops trapping.
    fn block_on(&self, event: FaultEvent, write: bool) {
        {
            let mut queue = self.faults.lock().unwrap();
            queue.pending.push_back(event);
        }
        self.fault_ready.notify_all();
        let mut wakes = self.wakes.lock().unwrap();
        while self.trap_at(event.address, write).is_some() {
            wakes = self
                .woken
                .wait_timeout(wakes, Duration::from_millis(10))
                .unwrap()
                .0;
        }
    }

    pub fn read_blocking(&self, addr: usize, len: usize) -> Vec<u8> {
        self.access(AddrRange::new(addr, len), false, &mut |event| self.block_on(event, false));
        self.peek(addr, len)
    }

    pub fn write_blocking(&self, addr: usize, data: &[u8]) {
        self.access(AddrRange::new(addr, data.len()), true, &mut |event| {
            self.block_on(event, true)
        });
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
    }
}

impl Drop for SimSpace {
    fn drop(&mut self) {
        unsafe { dealloc(self.base as *mut u8, self.layout) };
    }
}

impl MemoryOps for SimSpace {
    fn page_size(&self) -> PageSize {
        PageSize::DEFAULT
    }

    unsafe fn copy(&self, dst: usize, src: usize, len: usize) {
        let source = AddrRange::new(src, len);
        let dest = AddrRange::new(dst, len);
        assert!(!source.overlaps(&dest), "overlapping copy {source:?} -> {dest:?}");
        {
            let mut pages = self.pages.lock().unwrap();
            for index in self.page_indices(source) {
                assert!(
                    pages[index].trap(false).is_none(),
                    "engine read trapped page {:#x}",
                    self.base + index * PAGE
                );
            }
            for index in self.page_indices(dest) {
                assert!(
                    pages[index].trap(true).is_none(),
                    "engine wrote trapped page {:#x}",
                    self.base + index * PAGE
                );
                pages[index].populated = true;
            }
        }
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len) };
    }

    unsafe fn map_zeroed(&self, range: AddrRange, populate: bool) -> Result<()> {
        self.check_page_range(range, "mmap")?;
        let mut pages = self.pages.lock().unwrap();
        for index in self.page_indices(range) {
            pages[index] = PageState {
                populated: populate,
                ..PageState::PRESENT
            };
        }
        unsafe { std::ptr::write_bytes(range.start as *mut u8, 0, range.len) };
        Ok(())
    }
}

impl FaultChannel for SimSpace {
    fn register(&self, range: AddrRange, mode: RegisterMode) -> Result<()> {
        self.check_page_range(range, "register")?;
        let mut pages = self.pages.lock().unwrap();
        for index in self.page_indices(range) {
            match mode {
                RegisterMode::Missing => pages[index].missing_trap = true,
                RegisterMode::WriteProtect => pages[index].wp_trap = true,
            }
        }
        Ok(())
    }

    fn unregister(&self, range: AddrRange) -> Result<()> {
        self.check_page_range(range, "unregister")?;
        let mut pages = self.pages.lock().unwrap();
        for index in self.page_indices(range) {
            let page = &mut pages[index];
            page.missing_trap = false;
            page.wp_trap = false;
            page.wp = false;
        }
        Ok(())
    }

    fn set_write_protect(&self, range: AddrRange, protect: bool) -> Result<()> {
        self.check_page_range(range, "writeprotect")?;
        let mut pages = self.pages.lock().unwrap();
        let indices = self.page_indices(range);
        if indices.clone().any(|index| !pages[index].wp_trap) {
            return Err(Error::Channel {
                op: "writeprotect",
                range,
                source: std::io::Error::from_raw_os_error(libc::ENOENT),
            });
        }
        for index in indices {
            pages[index].wp = protect;
        }
        Ok(())
    }

    fn receive(&self, events: &mut Vec<FaultEvent>) -> Result<usize> {
        let mut queue = self.faults.lock().unwrap();
        while queue.pending.is_empty() && !queue.closed {
            queue = self.fault_ready.wait(queue).unwrap();
        }
        let count = queue.pending.len();
        events.extend(queue.pending.drain(..));
        Ok(count)
    }

    fn wake(&self, range: AddrRange) -> Result<()> {
        self.wakes.lock().unwrap().push(range);
        self.woken.notify_all();
        Ok(())
    }
}

/// Deterministic, non-repeating-per-page test bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ ((i / PAGE) as u8))
        .collect()
}
