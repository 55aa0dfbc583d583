//! Event types delivered to the UI bridge.
//!
//! Events are fire-and-forget: a send with no subscribers, or with a
//! lagging subscriber, never blocks the core.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Service mode reported in the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceMode {
    #[serde(rename = "HTTP Proxy")]
    HttpProxy,
}

impl fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpProxy => write!(f, "HTTP Proxy"),
        }
    }
}

/// Composed status, derived from the components on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub tunnel_alive: bool,
    pub relay_listening: bool,
    pub system_proxy_configured: bool,
    pub mode: ServiceMode,
}

/// Messages sent from the core to the UI.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Status changed (or may have)
    StatusUpdate(StatusSnapshot),
    /// Informational line (tunnel stdout, relay diagnostics)
    Log(String),
    /// Error line (tunnel stderr, relay failures)
    Error(String),
    /// Tunnel client exited
    Exit(Option<i32>),
}

/// Broadcast handle for [`ServiceEvent`]s.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ServiceEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn log(&self, line: impl Into<String>) {
        self.emit(ServiceEvent::Log(line.into()));
    }

    pub fn error(&self, line: impl Into<String>) {
        self.emit(ServiceEvent::Error(line.into()));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Global verbose-logging toggle, shared read-only with the relay data path.
#[derive(Debug, Clone, Default)]
pub struct Verbosity(Arc<AtomicBool>);

impl Verbosity {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let sink = EventSink::default();
        sink.log("nobody listening");
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();

        sink.log("one");
        sink.error("two");
        sink.emit(ServiceEvent::Exit(Some(0)));

        assert!(matches!(rx.recv().await.unwrap(), ServiceEvent::Log(l) if l == "one"));
        assert!(matches!(rx.recv().await.unwrap(), ServiceEvent::Error(l) if l == "two"));
        assert!(matches!(rx.recv().await.unwrap(), ServiceEvent::Exit(Some(0))));
    }

    #[test]
    fn test_status_json() {
        let status = StatusSnapshot {
            tunnel_alive: true,
            relay_listening: true,
            system_proxy_configured: false,
            mode: ServiceMode::HttpProxy,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["tunnelAlive"], true);
        assert_eq!(json["mode"], "HTTP Proxy");
    }

    #[test]
    fn test_verbosity_shared() {
        let v = Verbosity::new(false);
        let clone = v.clone();
        v.set(true);
        assert!(clone.enabled());
    }
}
