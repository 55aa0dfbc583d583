//! Test fixtures: loopback SOCKS5 endpoint, origin servers, a scripted
//! system-proxy driver and fake tunnel-client binaries.

use crate::config::ProxyEndpoint;
use crate::system_proxy::{ApplyOutcome, ConfigError, ProxyState, SystemProxyDriver};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Scratch files and fake tunnel clients
// ---------------------------------------------------------------------------

static SCRATCH: AtomicUsize = AtomicUsize::new(0);

/// Fresh empty directory under the system temp dir
pub fn scratch_dir(name: &str) -> PathBuf {
    let n = SCRATCH.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("slipnet-test-{}-{}-{}", std::process::id(), name, n));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write a `/bin/sh` script standing in for the tunnel client
pub fn write_client_script(dir: &Path, name: &str, body: &str, executable: bool) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if executable { 0o755 } else { 0o644 };
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
    }
    #[cfg(not(unix))]
    let _ = executable;

    path
}

/// A loopback address with nothing listening
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

// ---------------------------------------------------------------------------
// Echo server
// ---------------------------------------------------------------------------

pub struct EchoServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl EchoServer {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_echo_server() -> EchoServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rx, mut tx) = stream.split();
                let _ = tokio::io::copy(&mut rx, &mut tx).await;
            });
        }
    });
    EchoServer { addr, task }
}

// ---------------------------------------------------------------------------
// SOCKS5 endpoint
// ---------------------------------------------------------------------------

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;

/// Loopback SOCKS5 server that dials destinations directly
pub struct MockSocks5 {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MockSocks5 {
    /// Start on an ephemeral port; `credentials` makes auth mandatory
    pub async fn start(credentials: Option<(&str, &str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let credentials = credentials.map(|(u, p)| (u.to_string(), p.to_string()));

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let credentials = credentials.clone();
                tokio::spawn(async move {
                    let _ = handle_socks(stream, credentials).await;
                });
            }
        });

        Self { addr, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockSocks5 {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_socks(
    mut stream: TcpStream,
    credentials: Option<(String, String)>,
) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS5_VERSION {
        return Ok(());
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;

    match &credentials {
        None if methods.contains(&AUTH_NO_AUTH) => {
            stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;
        }
        Some((user, pass)) if methods.contains(&AUTH_PASSWORD) => {
            stream.write_all(&[SOCKS5_VERSION, AUTH_PASSWORD]).await?;

            let mut version_and_len = [0u8; 2];
            stream.read_exact(&mut version_and_len).await?;
            let mut username = vec![0u8; version_and_len[1] as usize];
            stream.read_exact(&mut username).await?;
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut password = vec![0u8; len[0] as usize];
            stream.read_exact(&mut password).await?;

            let ok = username == user.as_bytes() && password == pass.as_bytes();
            stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
            if !ok {
                return Ok(());
            }
        }
        _ => {
            stream.write_all(&[SOCKS5_VERSION, AUTH_NONE_ACCEPTABLE]).await?;
            return Ok(());
        }
    }

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != CMD_CONNECT {
        send_reply(&mut stream, REPLY_GENERAL_FAILURE).await?;
        return Ok(());
    }

    let dest = match header[3] {
        ADDR_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            format!("{}:{}", std::net::Ipv4Addr::from(ip), port)
        }
        ADDR_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            format!("{}:{}", String::from_utf8_lossy(&domain), port)
        }
        ADDR_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            format!("[{}]:{}", std::net::Ipv6Addr::from(ip), port)
        }
        _ => {
            send_reply(&mut stream, REPLY_GENERAL_FAILURE).await?;
            return Ok(());
        }
    };

    match TcpStream::connect(&dest).await {
        Ok(mut remote) => {
            send_reply(&mut stream, REPLY_SUCCESS).await?;
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
        }
        Err(_) => {
            send_reply(&mut stream, REPLY_CONNECTION_REFUSED).await?;
        }
    }
    Ok(())
}

async fn send_reply(stream: &mut TcpStream, reply: u8) -> std::io::Result<()> {
    stream
        .write_all(&[SOCKS5_VERSION, reply, 0x00, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

// ---------------------------------------------------------------------------
// HTTP origin
// ---------------------------------------------------------------------------

/// What the origin saw of the last request
#[derive(Debug, Clone)]
pub struct SeenRequest {
    /// Request target as received (origin-form expected)
    pub target: String,
    pub host: Option<String>,
    /// Lowercase header names
    pub header_names: Vec<String>,
}

/// Loopback HTTP server.
///
/// - `/slow` answers after 5s
/// - `/upgrade` switches to an echo protocol
/// - `/ip` answers like httpbin
/// - anything else answers `ok` with keep-alive headers
pub struct HttpOrigin {
    addr: SocketAddr,
    last: Arc<Mutex<Option<SeenRequest>>>,
    task: JoinHandle<()>,
}

impl HttpOrigin {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn last_request(&self) -> Option<SeenRequest> {
        self.last.lock().unwrap().clone()
    }
}

impl Drop for HttpOrigin {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_http_origin() -> HttpOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let last = Arc::new(Mutex::new(None));
    let seen = last.clone();

    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| origin(req, seen.clone()));
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    HttpOrigin { addr, last, task }
}

async fn origin(
    mut req: Request<Incoming>,
    seen: Arc<Mutex<Option<SeenRequest>>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    *seen.lock().unwrap() = Some(SeenRequest {
        target: req.uri().to_string(),
        host: req
            .headers()
            .get("host")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string),
        header_names: req.headers().keys().map(|k| k.as_str().to_string()).collect(),
    });

    let resp = match req.uri().path() {
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Response::new(Full::new(Bytes::from_static(b"late")))
        }
        "/upgrade" => {
            let on_upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                if let Ok(upgraded) = on_upgrade.await {
                    let (mut rx, mut tx) = tokio::io::split(TokioIo::new(upgraded));
                    let _ = tokio::io::copy(&mut rx, &mut tx).await;
                }
            });
            Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header("connection", "Upgrade")
                .header("upgrade", "echo")
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
        "/ip" => Response::new(Full::new(Bytes::from_static(br#"{"origin": "203.0.113.7"}"#))),
        _ => {
            let _ = req.into_body().collect().await;
            Response::builder()
                .header("keep-alive", "timeout=5")
                .header("content-type", "text/plain")
                .body(Full::new(Bytes::from_static(b"ok")))
                .unwrap()
        }
    };
    Ok(resp)
}

// ---------------------------------------------------------------------------
// Raw HTTP client
// ---------------------------------------------------------------------------

/// Byte-level client for asserting exact wire output
pub struct RawClient {
    stream: TcpStream,
    buffered: Vec<u8>,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buffered: Vec::new(),
        }
    }

    pub async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
    }

    /// Read up to and including the blank line ending a response head
    pub async fn read_head(&mut self) -> String {
        loop {
            if let Some(end) = find(&self.buffered, b"\r\n\r\n") {
                let head: Vec<u8> = self.buffered.drain(..end + 4).collect();
                return String::from_utf8(head).unwrap();
            }
            self.fill().await;
        }
    }

    pub async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        while self.buffered.len() < n {
            self.fill().await;
        }
        self.buffered.drain(..n).collect()
    }

    /// Everything until the peer closes
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), self.stream.read_to_end(&mut rest))
            .await
            .expect("peer did not close")
            .unwrap();
        let mut all = std::mem::take(&mut self.buffered);
        all.extend(rest);
        all
    }

    async fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(10), self.stream.read(&mut chunk))
            .await
            .expect("read timed out")
            .unwrap();
        assert!(n > 0, "peer closed early");
        self.buffered.extend_from_slice(&chunk[..n]);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ---------------------------------------------------------------------------
// System proxy driver
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DriverState {
    live: HashMap<String, ProxyState>,
    read_back_override: HashMap<String, ProxyState>,
    failing_apply: HashSet<String>,
}

/// In-memory driver with per-target state and failure injection
pub struct MockDriver {
    targets: Vec<String>,
    preferred: Vec<&'static str>,
    state: Mutex<DriverState>,
    clears: AtomicUsize,
    read_back_fails: AtomicBool,
    apply_ambiguous: AtomicBool,
}

impl MockDriver {
    pub fn new(targets: &[&str], preferred: &[&'static str]) -> Self {
        Self {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            preferred: preferred.to_vec(),
            state: Mutex::new(DriverState::default()),
            clears: AtomicUsize::new(0),
            read_back_fails: AtomicBool::new(false),
            apply_ambiguous: AtomicBool::new(false),
        }
    }

    pub fn state(&self, target: &str) -> ProxyState {
        self.state.lock().unwrap().live.get(target).cloned().unwrap_or_default()
    }

    pub fn set_state(&self, target: &str, state: ProxyState) {
        self.state.lock().unwrap().live.insert(target.to_string(), state);
    }

    pub fn override_read_back(&self, target: &str, state: ProxyState) {
        self.state
            .lock()
            .unwrap()
            .read_back_override
            .insert(target.to_string(), state);
    }

    pub fn fail_read_back(&self, fail: bool) {
        self.read_back_fails.store(fail, Ordering::Relaxed);
    }

    pub fn ambiguous_apply(&self, ambiguous: bool) {
        self.apply_ambiguous.store(ambiguous, Ordering::Relaxed);
    }

    pub fn fail_apply_on(&self, target: &str) {
        self.state.lock().unwrap().failing_apply.insert(target.to_string());
    }

    pub fn clear_calls(&self) -> usize {
        self.clears.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SystemProxyDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn targets(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.targets.clone())
    }

    fn preferred_targets(&self) -> &[&'static str] {
        &self.preferred
    }

    async fn apply(&self, target: &str, endpoint: &ProxyEndpoint) -> Result<ApplyOutcome, ConfigError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_apply.contains(target) {
            return Err(ConfigError::Command {
                command: format!("apply {target}"),
                reason: "permission denied".to_string(),
            });
        }
        state
            .live
            .insert(target.to_string(), ProxyState::enabled(endpoint.host.clone(), endpoint.port));
        if self.apply_ambiguous.load(Ordering::Relaxed) {
            Ok(ApplyOutcome::Ambiguous("** Error: unexpected output".to_string()))
        } else {
            Ok(ApplyOutcome::Applied)
        }
    }

    async fn read_back(&self, target: &str) -> Result<ProxyState, ConfigError> {
        if self.read_back_fails.load(Ordering::Relaxed) {
            return Err(ConfigError::Command {
                command: format!("read {target}"),
                reason: "unavailable".to_string(),
            });
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .read_back_override
            .get(target)
            .or_else(|| state.live.get(target))
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, target: &str) -> Result<(), ConfigError> {
        self.clears.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        if let Some(live) = state.live.get_mut(target) {
            live.web.enabled = false;
            live.secure.enabled = false;
        }
        Ok(())
    }
}
