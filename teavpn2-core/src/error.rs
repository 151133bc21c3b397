//! Error types for the TeaVPN2 core.
//!
//! Startup failures (§7) are fatal and unwind the whole lifecycle.
//! Per-client faults never get their own error type here: the
//! charge-budget-vs-close decision is already carried by
//! `state_machine::Transition`, computed at each call site from
//! `ClientRecord::charge_error`'s return value, so there is nothing
//! left for a separate fault type to carry.

use std::io;

/// Fatal errors raised while bringing the server up or tearing it down.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to open self-pipe: {0}")]
    SelfPipe(#[source] io::Error),

    #[error("failed to open TUN device {dev}: {source}")]
    TunOpen { dev: String, source: io::Error },

    #[error("failed to bring up interface {dev}: {reason}")]
    Provision { dev: String, reason: String },

    #[error("failed to bind listen socket on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: io::Error,
    },

    #[error("failed to register {what} with the poll set: {source}")]
    PollRegister {
        what: &'static str,
        source: io::Error,
    },

    #[error("thread_count={0} requested but the multi-reactor backend is not implemented")]
    MultiReactorUnsupported(u16),
}
