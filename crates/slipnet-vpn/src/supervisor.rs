//! Tunnel-Client Supervisor
//!
//! Owns the single external tunnel-client subprocess:
//!
//! ```text
//! <binary> --resolver <ip:port> --domain <name>
//!    stdout ──▶ ProcessEvent::Output(line)
//!    stderr ──▶ ProcessEvent::Fault(line)
//!    exit   ──▶ ProcessEvent::Exited { run, code }
//! ```
//!
//! Readiness is "spawned and still alive after the grace interval"; the
//! client has no explicit handshake. Spawn failures are surfaced, never
//! retried.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Base name of the tunnel-client binaries
pub const CLIENT_BASENAME: &str = "slipstream-client";

/// Directory (under the resources dir) that holds bundled binaries
const BINARIES_DIR: &str = "binaries";

/// How long `stop()` waits for the process to go away
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the exit watcher waits for stdio readers to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle events of the supervised process, in the order they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A stdout line
    Output(String),
    /// A stderr line, or a supervisor-generated fault
    Fault(String),
    /// The process is gone. `run` identifies which start produced it.
    Exited { run: u64, code: Option<i32> },
}

/// Supervisor errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error("Tunnel client binary not found. Looked in: {}", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    BinaryNotFound(Vec<PathBuf>),

    #[error("Tunnel client failed to spawn: {0}")]
    SpawnFailed(String),

    #[error("Tunnel client exited during startup (code {0:?})")]
    StartupFailed(Option<i32>),

    #[error("No tunnel client build for {0}")]
    UnsupportedPlatform(String),
}

/// Ordered search for the tunnel-client binary.
///
/// Default order per platform: preferred name, legacy name, then the
/// other architecture's build; each probed under `binaries/` first and
/// then directly in the resources directory.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    resources_dir: PathBuf,
    names: Option<Vec<String>>,
}

impl BinaryLocator {
    /// Search under `resources_dir` with the platform's default names
    pub fn new(resources_dir: impl Into<PathBuf>) -> Self {
        Self {
            resources_dir: resources_dir.into(),
            names: None,
        }
    }

    /// Override the probe order
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn resources_dir(&self) -> &Path {
        &self.resources_dir
    }

    /// Every path that will be probed, in order
    pub fn candidates(&self) -> Result<Vec<PathBuf>, SupervisorError> {
        let names = match &self.names {
            Some(names) => names.clone(),
            None => client_names(std::env::consts::OS, std::env::consts::ARCH).ok_or_else(
                || SupervisorError::UnsupportedPlatform(std::env::consts::OS.to_string()),
            )?,
        };

        Ok(names
            .iter()
            .flat_map(|name| {
                [
                    self.resources_dir.join(BINARIES_DIR).join(name),
                    self.resources_dir.join(name),
                ]
            })
            .collect())
    }

    /// First candidate that exists
    pub fn locate(&self) -> Result<PathBuf, SupervisorError> {
        let candidates = self.candidates()?;
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or(SupervisorError::BinaryNotFound(candidates))
    }
}

impl Default for BinaryLocator {
    fn default() -> Self {
        let dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(dir)
    }
}

/// Binary names to probe for an OS/architecture pair
pub fn client_names(os: &str, arch: &str) -> Option<Vec<String>> {
    let name = |suffix: &str| format!("{CLIENT_BASENAME}-{suffix}");
    match os {
        "macos" => {
            let (preferred, fallback) = if arch == "aarch64" {
                ("mac-arm64", "mac-intel")
            } else {
                ("mac-intel", "mac-arm64")
            };
            Some(vec![name(preferred), name("mac"), name(fallback)])
        }
        "windows" => Some(vec![name("win.exe")]),
        "linux" => Some(vec![name("linux")]),
        _ => None,
    }
}

/// Result of a successful start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    /// Start identifier, echoed in [`ProcessEvent::Exited`]
    pub run: u64,
    pub pid: Option<u32>,
    pub binary: PathBuf,
}

/// Identity of the running tunnel client
#[derive(Debug)]
pub struct TunnelProcessHandle {
    run: u64,
    pid: Option<u32>,
    binary: PathBuf,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
}

impl TunnelProcessHandle {
    pub fn run(&self) -> u64 {
        self.run
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// `Some(code)` once the process has exited
    pub fn exit_code(&self) -> Option<Option<i32>> {
        *self.exit_rx.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_code().is_none()
    }
}

/// Tunnel-client supervisor
pub struct Supervisor {
    locator: BinaryLocator,
    grace: Duration,
    socks_port: u16,
    events: mpsc::UnboundedSender<ProcessEvent>,
    alive: Arc<AtomicBool>,
    handle: Option<TunnelProcessHandle>,
    next_run: u64,
}

impl Supervisor {
    /// Create a supervisor; lifecycle events go to `events`
    pub fn new(
        locator: BinaryLocator,
        grace: Duration,
        socks_port: u16,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Self {
        Self {
            locator,
            grace,
            socks_port,
            events,
            alive: Arc::new(AtomicBool::new(false)),
            handle: None,
            next_run: 1,
        }
    }

    /// Shared liveness flag, for status reads
    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn handle(&self) -> Option<&TunnelProcessHandle> {
        self.handle.as_ref()
    }

    /// Spawn the tunnel client and wait out the readiness grace interval
    pub async fn start(&mut self, resolver: &str, domain: &str) -> Result<Ready, SupervisorError> {
        if self.handle.as_ref().is_some_and(TunnelProcessHandle::is_alive) {
            warn!("Tunnel client already running, restarting");
            self.stop().await;
        }

        let binary = self.locator.locate()?;
        ensure_executable(&binary);

        info!("Starting tunnel client {} (resolver {}, domain {})", binary.display(), resolver, domain);

        let mut command = Command::new(&binary);
        command
            .args(["--resolver", resolver, "--domain", domain])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let child = command.spawn().map_err(|e| {
            error!("Tunnel client failed to spawn: {}", e);
            SupervisorError::SpawnFailed(format!("{}: {}", binary.display(), e))
        })?;

        let run = self.next_run;
        self.next_run += 1;
        let pid = child.id();
        self.alive.store(true, Ordering::Relaxed);

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = watch::channel(None);
        self.spawn_watcher(child, run, kill_rx, exit_tx);

        self.handle = Some(TunnelProcessHandle {
            run,
            pid,
            binary: binary.clone(),
            kill_tx: Some(kill_tx),
            exit_rx: exit_rx.clone(),
        });

        debug!("Tunnel client spawned (pid {:?}), waiting {:?}", pid, self.grace);

        match tokio::time::timeout(self.grace, exit_rx.wait_for(Option::is_some)).await {
            Err(_) => {
                info!("Tunnel client ready (pid {:?})", pid);
                Ok(Ready { run, pid, binary })
            }
            Ok(exited) => {
                let code = exited.ok().and_then(|state| *state).flatten();
                warn!("Tunnel client exited during startup (code {:?})", code);
                self.handle = None;
                Err(SupervisorError::StartupFailed(code))
            }
        }
    }

    /// Terminate the tunnel client, if any
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        info!("Stopping tunnel client (pid {:?})", handle.pid);
        if let Some(kill_tx) = handle.kill_tx.take() {
            let _ = kill_tx.send(());
        }

        if tokio::time::timeout(STOP_TIMEOUT, handle.exit_rx.wait_for(Option::is_some))
            .await
            .is_err()
        {
            warn!("Tunnel client did not exit within {:?}", STOP_TIMEOUT);
        }
    }

    fn spawn_watcher(
        &self,
        mut child: Child,
        run: u64,
        kill_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<Option<Option<i32>>>,
    ) {
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            let events = self.events.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    info!("tunnel: {}", line);
                    let _ = events.send(ProcessEvent::Output(line));
                }
            }));
        }

        if let Some(stderr) = child.stderr.take() {
            let events = self.events.clone();
            let socks_port = self.socks_port;
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    warn!("tunnel: {}", line);
                    if is_address_in_use(&line) {
                        warn!("SOCKS5 port {} is already in use, reaping its holder", socks_port);
                        let events = events.clone();
                        tokio::spawn(async move {
                            if reap_port_holder(socks_port).await {
                                let _ = events.send(ProcessEvent::Fault(format!(
                                    "Port {socks_port} was in use. Killed existing process. Please restart the VPN."
                                )));
                            }
                        });
                    }
                    let _ = events.send(ProcessEvent::Fault(line));
                }
            }));
        }

        let events = self.events.clone();
        let alive = self.alive.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    error!("Failed to wait for tunnel client: {}", e);
                    None
                }
            };

            for reader in readers {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
            }

            info!("Tunnel client exited with code {:?}", code);
            alive.store(false, Ordering::Relaxed);
            let _ = exit_tx.send(Some(code));
            let _ = events.send(ProcessEvent::Exited { run, code });
        });
    }
}

/// stderr text that means the SOCKS5 port is taken
pub fn is_address_in_use(line: &str) -> bool {
    line.contains("EADDRINUSE") || line.to_ascii_lowercase().contains("address already in use")
}

/// Grant execute permission when missing. Failure is logged, not fatal.
#[cfg(unix)]
fn ensure_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mut permissions = metadata.permissions();
    if permissions.mode() & 0o111 != 0 {
        return;
    }
    permissions.set_mode(0o755);
    match std::fs::set_permissions(path, permissions) {
        Ok(()) => info!("Set execute permission on {}", path.display()),
        Err(e) => warn!("Could not set execute permission on {}: {}", path.display(), e),
    }
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) {}

/// Best-effort kill of whatever holds `port`. Returns true if something was killed.
#[cfg(unix)]
async fn reap_port_holder(port: u16) -> bool {
    let output = match Command::new("lsof")
        .arg(format!("-ti:{port}"))
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            debug!("lsof unavailable: {}", e);
            return false;
        }
    };

    let own_pid = std::process::id();
    let mut killed = false;
    for pid in String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .filter(|pid| *pid != own_pid)
    {
        match Command::new("kill").args(["-9", &pid.to_string()]).status().await {
            Ok(status) if status.success() => {
                info!("Killed pid {} holding port {}", pid, port);
                killed = true;
            }
            Ok(status) => debug!("kill {} exited with {}", pid, status),
            Err(e) => debug!("kill {} failed: {}", pid, e),
        }
    }
    killed
}

#[cfg(not(unix))]
async fn reap_port_holder(port: u16) -> bool {
    debug!("Port reaping is not supported on this platform (port {})", port);
    false
}
