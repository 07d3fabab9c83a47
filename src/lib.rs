//! rlb is a small HTTP-style load balancing system made of three cooperating
//! programs:
//!
//! - The **balancer** accepts client connections, picks an upstream worker
//!   using a configurable scheduling policy and relays requests and responses
//!   between the two, correlating responses back to clients through in-band
//!   routing headers.
//! - The **worker** owns a pool of handler tasks. A fixed set is started up
//!   front and the pool grows on demand up to a ceiling; handlers started on
//!   demand are reaped again after an idle timeout.
//! - The **loadgen** client generator spawns many concurrent one-shot clients
//!   and short-circuits repeated request kinds through a shared LRU cache.
//!
//! All traffic between the three programs uses fixed-size HTTP/1.1 style
//! frames, see [`http`].

pub mod balancer;
pub mod cache;
pub mod client;
pub mod config;
pub mod http;
pub mod logger;
pub mod sched;
pub mod worker;

use std::io;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors that can stop one of the rlb programs. Recoverable conditions are
/// logged and handled inside the event loops; whatever reaches this type is
/// fatal for the process that observes it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("bad config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("another instance already holds {0}")]
    PidFileHeld(String),

    #[error("no worker is available")]
    NoWorkers,

    #[error("message of {0} bytes exceeds the frame size")]
    FrameTooLarge(usize),

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("{0}")]
    Usage(String),
}
