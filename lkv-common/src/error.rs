//! # Error Taxonomy
//!
//! Every failure the driver can surface, from configuration mistakes at start
//! time to per-request protocol violations.
//!
//! ## Propagation Rules
//!
//! 1. **Poisoned connections never return**: connection-level failures
//!    (`Io`, `Timeout`, `Closed`, `Protocol`, `Auth`) close the socket before
//!    the error reaches the caller.
//! 2. **Server replies are not transport failures**: `Server` leaves the
//!    stream aligned, so the connection stays reusable.
//! 3. **Backpressure is recoverable**: `PoolBusy` is returned unchanged and the
//!    caller decides whether to retry.
//! 4. **`not_found` is data**: it is a normal reply status, never an error.

use std::fmt;
use std::io;

/// Result type used across the driver.
pub type LkvResult<T> = Result<T, LkvError>;

/// Why a checkout was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    /// The bounded wait queue already holds `max_wait_size` callers.
    QueueFull,
    /// No connection was handed over before the checkout deadline.
    TimedOut,
}

impl fmt::Display for BusyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusyReason::QueueFull => write!(f, "wait queue full"),
            BusyReason::TimedOut => write!(f, "timed out waiting for a connection"),
        }
    }
}

/// Errors surfaced by the driver.
#[derive(Debug, thiserror::Error)]
pub enum LkvError {
    /// Invalid or missing configuration, detected before any I/O.
    #[error("configuration error: {0}")]
    Config(String),

    /// The node could not be reached while opening a connection.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The server rejected the configured password.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed framing; the stream position is unrecoverable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with a status other than `ok` or `not_found`.
    #[error("server replied `{status}`")]
    Server { status: String, detail: Vec<String> },

    /// A read or write deadline expired.
    #[error("i/o deadline exceeded")]
    Timeout,

    /// Socket failure other than a deadline.
    #[error("io error: {0}")]
    Io(io::Error),

    /// The connection is not open, or the peer closed it mid-response.
    #[error("connection closed")]
    Closed,

    /// An argument could not be encoded.
    #[error("encoding error: {0}")]
    Encode(String),

    /// Pool backpressure: the caller may retry later.
    #[error("pool busy: {0}")]
    PoolBusy(BusyReason),

    /// The pool or registry is not in the `Running` state.
    #[error("not running: {0}")]
    NotRunning(&'static str),
}

impl LkvError {
    /// Returns true when the connection that produced this error must be
    /// closed instead of recycled.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LkvError::Io(_)
                | LkvError::Timeout
                | LkvError::Closed
                | LkvError::Protocol(_)
                | LkvError::Auth(_)
                | LkvError::Connect { .. }
        )
    }

    /// Returns true when a single reopen-and-resend may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LkvError::Io(_) | LkvError::Timeout | LkvError::Closed)
    }

    /// Returns true for pool backpressure errors.
    pub fn is_busy(&self) -> bool {
        matches!(self, LkvError::PoolBusy(_))
    }
}

impl From<io::Error> for LkvError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            // Socket timeouts surface as WouldBlock on Unix and TimedOut on Windows.
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => LkvError::Timeout,
            io::ErrorKind::UnexpectedEof => LkvError::Closed,
            _ => LkvError::Io(err),
        }
    }
}
