//! Listener and per-connection dispatch.

use super::{ConnLog, RelayBody, RelayError, http, is_benign_hyper, tunnel};
use crate::config::ProxyEndpoint;
use crate::events::{EventSink, Verbosity};
use crate::socks::Socks5Connector;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, header};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Read-only state shared by every relayed connection
pub struct RelayContext {
    connector: Arc<Socks5Connector>,
    verbosity: Verbosity,
    events: EventSink,
    http_timeout: Duration,
}

impl RelayContext {
    pub fn new(
        connector: Arc<Socks5Connector>,
        verbosity: Verbosity,
        events: EventSink,
        http_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            verbosity,
            events,
            http_timeout,
        }
    }

    pub(crate) fn connector(&self) -> &Socks5Connector {
        &self.connector
    }

    pub(crate) fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    fn conn_log(&self) -> ConnLog {
        ConnLog::new(self.verbosity.clone(), self.events.clone())
    }
}

/// HTTP relay server
pub struct RelayServer {
    context: Arc<RelayContext>,
}

impl RelayServer {
    pub fn new(context: RelayContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Bind the loopback listener and start accepting.
    ///
    /// Fails only when the address cannot be bound.
    pub async fn bind(&self, endpoint: &ProxyEndpoint) -> Result<RelayHandle, RelayError> {
        let bind_failed = |reason: String| RelayError::BindFailed {
            addr: endpoint.to_string(),
            reason,
        };
        let addr = endpoint.socket_addr().map_err(|e| bind_failed(e.to_string()))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| bind_failed(e.to_string()))?;
        let local_addr = listener.local_addr()?;

        let listening = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!("HTTP relay listening on {}", local_addr);
        self.context
            .events
            .log(format!("HTTP Proxy listening on {local_addr}"));

        let task = tokio::spawn(accept_loop(
            listener,
            self.context.clone(),
            shutdown_rx,
            listening.clone(),
        ));

        Ok(RelayHandle {
            local_addr,
            listening,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// A bound relay listener
#[derive(Debug)]
pub struct RelayHandle {
    local_addr: SocketAddr,
    listening: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }

    /// Stop accepting and release the port. In-flight connections run on.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Relay accept loop ended abnormally: {}", e);
            }
        }
        self.listening.store(false, Ordering::Relaxed);
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<RelayContext>,
    mut shutdown: oneshot::Receiver<()>,
    listening: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(stream, peer, context.clone()));
                }
                Err(e) => {
                    warn!("Relay accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }

    listening.store(false, Ordering::Relaxed);
    info!("HTTP relay stopped");
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, context: Arc<RelayContext>) {
    let _ = stream.set_nodelay(true);
    debug!("Relay connection from {}", peer);

    let timeout = context.http_timeout;
    let service = service_fn(move |req| dispatch(req, context.clone()));

    let served = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeout)
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await;

    if let Err(e) = served {
        if is_benign_hyper(&e) {
            debug!("Relay connection from {} closed: {}", peer, e);
        } else {
            warn!("Relay connection from {} failed: {}", peer, e);
        }
    }
}

async fn dispatch(
    req: Request<Incoming>,
    context: Arc<RelayContext>,
) -> Result<Response<RelayBody>, Infallible> {
    let log = context.conn_log();

    let resp = if req.method() == Method::CONNECT {
        tunnel::connect(req, &context, log).await
    } else if is_upgrade(&req) {
        tunnel::upgrade(req, &context, log).await
    } else {
        http::forward(req, &context, log).await
    };
    Ok(resp)
}

/// `Upgrade` present and `Connection` lists the `upgrade` token
fn is_upgrade<B>(req: &Request<B>) -> bool {
    let headers = req.headers();
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}
