//! zcopy - transparent zero-copy `memcpy` and socket I/O.
//!
//! zcopy replaces large physical copies with virtual aliases. The destination
//! of an above-threshold copy is left unbacked and trapped through
//! userfaultfd; the source is write-protected. Bytes are only moved when a
//! destination page is first touched, when the source is about to be
//! overwritten, or never, when the destination is handed straight to a
//! socket and the send reads from the source instead.
//!
//! # Modules
//!
//! - [`addr`] - Address ranges and page arithmetic
//! - [`store`] - Alias records and the interval store
//! - [`platform`] - Memory and fault-channel primitives the engine consumes
//! - [`engine`] - Copy, transport, resolution and fault servicing
//! - [`config`] / [`stats`] - Tunables and diagnostic counters
//! - [`sys`] - Linux implementations of the primitives
//! - [`runtime`] - The process-wide engine and its fault-service thread
//! - [`symbols`] - Interposed symbol registry and the real implementations
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type. Errors only become
//! fatal at the exported C entry points and in the fault-service thread,
//! where the engine has no caller left to report them to.

pub mod addr;
pub mod config;
pub mod engine;
pub mod platform;
pub mod stats;
pub mod store;
pub mod symbols;
pub mod sys;

#[cfg(target_os = "linux")]
pub mod runtime;

#[cfg(all(feature = "interpose", target_os = "linux", not(test)))]
mod interpose;

use addr::AddrRange;

/// Consolidated error type for all zcopy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kernel lacks userfaultfd feature: {0}")]
    FeatureUnavailable(&'static str),

    #[error("fault channel {op} failed over {range:?}: {source}")]
    Channel {
        op: &'static str,
        range: AddrRange,
        #[source]
        source: std::io::Error,
    },

    #[error("mapping {range:?} failed: {source}")]
    Mapping {
        range: AddrRange,
        #[source]
        source: std::io::Error,
    },

    #[error("fault channel closed while the engine is live")]
    ChannelClosed,

    #[error("fault channel read of {len} bytes is not a whole number of messages")]
    MalformedRead { len: usize },

    #[error("unexpected fault channel event {0:#x}")]
    UnexpectedEvent(u8),

    #[error("rewritten I/O vector exceeds {max} segments")]
    SegmentOverflow { max: usize },

    #[error("cannot bind real symbol `{0}`")]
    Symbol(&'static str),

    #[error("interposed transport call failed: {0}")]
    Transport(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = core::result::Result<T, Error>;

pub use config::Config;
pub use engine::{Engine, EngineBuilder, FaultService};
pub use store::{AliasRecord, AliasStore};
