//! The process-wide engine.
//!
//! The engine is built lazily by the first interposed call that needs it.
//! Construction happens exactly once behind a [`OnceLock`]; concurrent
//! callers block until it is done. Construction itself copies memory and
//! logs, so the constructing thread is marked as inside the engine and those
//! nested calls pass straight through.
//!
//! The aliasing protocol is only correct with both trap kinds available, so
//! failing to set up userfaultfd aborts the process.

use crate::config::{Config, DEFAULT_THRESHOLD, LOG_VAR};
use crate::engine::{Engine, EngineBuilder, EngineEntry, FaultService};
use crate::stats::StatsSnapshot;
use crate::symbols;
use crate::sys::linux::{LinuxMemory, Userfaultfd};
use crate::{Error, Result};
use std::fs::File;
use std::io::{self, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Once, OnceLock};
use tracing::{Level, debug, error};
use tracing_subscriber::EnvFilter;

pub type LinuxEngine = Engine<LinuxMemory, Userfaultfd>;

static ENGINE: OnceLock<LinuxEngine> = OnceLock::new();
static FAULT_SERVICE: Once = Once::new();

/// Calls at or below this size never reach the engine.
static PASSTHROUGH_LIMIT: AtomicUsize = AtomicUsize::new(DEFAULT_THRESHOLD);

/// Whether the counters are printed at exit, decided while logging still works.
static EXIT_REPORT: AtomicBool = AtomicBool::new(false);

/// Size at or below which an interposed call is a pure passthrough.
pub fn passthrough_limit() -> usize {
    PASSTHROUGH_LIMIT.load(Ordering::Relaxed)
}

/// The engine, building it and starting its fault service on first use.
pub fn engine() -> &'static LinuxEngine {
    if let Some(engine) = ENGINE.get()
        && FAULT_SERVICE.is_completed()
    {
        return engine;
    }
    let _entry = EngineEntry::enter();
    let engine = ENGINE.get_or_init(bootstrap);
    FAULT_SERVICE.call_once(|| start_fault_service(engine));
    engine
}

fn bootstrap() -> LinuxEngine {
    setup_logging();
    match build() {
        Ok(engine) => {
            PASSTHROUGH_LIMIT.store(engine.config().threshold, Ordering::Relaxed);
            EXIT_REPORT.store(tracing::enabled!(Level::INFO), Ordering::Relaxed);
            debug!(
                threshold = engine.config().threshold,
                page_size = engine.page_size().get(),
                symbols = ?symbols::interposed_names().collect::<Vec<_>>(),
                "zcopy engine ready"
            );
            engine
        }
        Err(err) => {
            error!(%err, "zcopy cannot start");
            std::process::abort()
        }
    }
}

fn build() -> Result<LinuxEngine> {
    let _ = symbols::real();
    let config = Config::from_env()?;
    let channel = Userfaultfd::open()?;
    let engine = EngineBuilder::new()
        .config(config)
        .build(LinuxMemory::new(), channel);
    if unsafe { libc::atexit(report_at_exit) } != 0 {
        debug!("cannot register exit report");
    }
    Ok(engine)
}

fn start_fault_service(engine: &'static LinuxEngine) {
    let spawned = std::thread::Builder::new()
        .name("zcopy-fault".into())
        .spawn(move || {
            // Everything this thread copies is our own bookkeeping.
            let _entry = EngineEntry::enter();
            let Err(err) = FaultService::new(engine).run();
            engine.die(err)
        });
    if let Err(err) = spawned {
        engine.die(Error::Io(err));
    }
}

/// `atexit` handler.
///
/// Thread-locals are already torn down by the time it runs, and with them
/// the subscriber's per-thread state, so the report bypasses `tracing` and
/// goes straight to stderr.
extern "C" fn report_at_exit() {
    if !EXIT_REPORT.load(Ordering::Relaxed) {
        return;
    }
    if let Some(engine) = ENGINE.get() {
        let _ = write_exit_report(libc::STDERR_FILENO, &engine.stats().take());
    }
}

fn write_exit_report(fd: RawFd, snapshot: &StatsSnapshot) -> io::Result<()> {
    let line = format!("{snapshot}\n");
    // SAFETY: the descriptor stays open; ManuallyDrop keeps it that way.
    let mut out = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    out.write_all(line.as_bytes())
}

/// Install the stderr subscriber, filtered by `ZCOPY_LOG` (default `warn`).
///
/// A subscriber the host program installed first wins.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
