//! Error taxonomy for the command bridge.
//!
//! Configuration errors are raised before any network action, connection and stream
//! errors come from the session, invocation errors from the direct-method bridge.
//! `InvalidUsage` is rendered by the argument parser instead of the generic
//! `error:` line.

use thiserror::Error;

use crate::session::SessionError;
use crate::session::transport::TransportKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    // ── Configuration ────────────────────────────────────────────────
    #[error("{0}")]
    Config(String),

    #[error("unsupported transport {0:?}")]
    UnsupportedTransport(String),

    #[error("transport {0} is not implemented")]
    TransportNotImplemented(TransportKind),

    // ── Session (connection, stream) ─────────────────────────────────
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("unable to write output: {0}")]
    Output(#[source] std::io::Error),

    #[error("unable to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    // ── Direct method invocation ─────────────────────────────────────
    #[error("unable to read response: {0}")]
    Input(#[source] std::io::Error),

    #[error("invalid json response: {0}")]
    ParseResponse(#[source] serde_json::Error),

    // ── Usage / lifecycle ────────────────────────────────────────────
    #[error("{0}")]
    InvalidUsage(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
