//! Proxy Relay Server
//!
//! Loopback HTTP listener that relays everything through the SOCKS5 hop:
//!
//! ```text
//! client ──HTTP──▶ relay (127.0.0.1:8080) ──SOCKS5──▶ tunnel client ──▶ origin
//!
//!   GET http://host/path   plain request, re-issued upstream in origin-form
//!   CONNECT host:443       200 Connection established, then splice
//!   Upgrade: websocket     request head forwarded, 101 relayed, then splice
//! ```
//!
//! Every failure is connection-scoped: a broken hop produces a best-effort
//! response for that client and nothing else.

mod http;
mod idle;
mod probe;
mod server;
mod tunnel;
mod upstream;

pub use probe::{ProbeReport, probe};
pub use server::{RelayContext, RelayHandle, RelayServer};

use crate::events::{EventSink, Verbosity};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use rand::Rng;
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Body type of every response the relay writes
pub(crate) type RelayBody = BoxBody<Bytes, RelayError>;

/// Relay errors. All connection-scoped except `BindFailed`.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("SOCKS5 connect to {target} failed: {reason}")]
    UpstreamHandshakeFailed { target: String, reason: String },

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Upstream HTTP error: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Relay self-test failed: {0}")]
    ProbeFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Socket errors caused by an ordinary peer-initiated close
pub fn is_benign_disconnect(e: &io::Error) -> bool {
    #[cfg(target_os = "linux")]
    const ECANCELED: i32 = 125;
    #[cfg(target_os = "macos")]
    const ECANCELED: i32 = 89;
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    const ECANCELED: i32 = -1;

    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::UnexpectedEof
    ) || e.raw_os_error() == Some(ECANCELED)
}

/// Walk a hyper error's source chain for a benign socket error
pub(crate) fn is_benign_hyper(e: &hyper::Error) -> bool {
    if e.is_canceled() || e.is_incomplete_message() {
        return true;
    }
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            return is_benign_disconnect(io);
        }
        source = cause.source();
    }
    false
}

/// `<unix-millis>-<9 base36 chars>`
pub fn correlation_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{millis}-{suffix}")
}

/// Diagnostics for one relayed request, tagged with its correlation id
#[derive(Clone)]
pub(crate) struct ConnLog {
    id: Arc<str>,
    verbosity: Verbosity,
    events: EventSink,
}

impl ConnLog {
    pub(crate) fn new(verbosity: Verbosity, events: EventSink) -> Self {
        Self {
            id: correlation_id().into(),
            verbosity,
            events,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// High-frequency event, dropped unless verbose logging is on
    pub(crate) fn verbose(&self, msg: impl Display) {
        if !self.verbosity.enabled() {
            return;
        }
        let line = format!("[Proxy {}] {}", self.id, msg);
        debug!("{}", line);
        self.events.log(line);
    }

    /// Always emitted
    pub(crate) fn error(&self, msg: impl Display) {
        let line = format!("[Proxy {}] {}", self.id, msg);
        warn!("{}", line);
        self.events.error(line);
    }

    /// Report an I/O error unless it is an ordinary disconnect
    pub(crate) fn io_error(&self, context: &str, e: &io::Error) {
        if is_benign_disconnect(e) {
            self.verbose(format_args!("{context}: {e}"));
        } else {
            self.error(format_args!("{context}: {e}"));
        }
    }
}

pub(crate) fn empty() -> RelayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full(chunk: impl Into<Bytes>) -> RelayBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}
