//! Service Orchestrator
//!
//! Composes the tunnel-client supervisor, the HTTP relay and the system
//! proxy configurator behind one serialized state machine:
//!
//! ```text
//! Stopped ──start──▶ Starting ──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                       │            │
//!                       └── error ───┴── tunnel exit ──────────────▶ Stopped
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let service = ServiceManager::new(ServiceConfig::default(), settings, default_driver())?;
//! service.recover().await?;
//! service.start("1.1.1.1:53", "tunnel.example.com").await?;
//! service.enable_system_proxy().await?;
//!
//! // Later
//! service.stop().await?;
//! ```

use crate::config::{self, Resolver, ServiceConfig};
use crate::events::{EventSink, ServiceEvent, ServiceMode, StatusSnapshot, Verbosity};
use crate::relay::{self, ProbeReport, RelayContext, RelayError, RelayHandle, RelayServer};
use crate::settings::SharedSettings;
use crate::socks::{Socks5Auth, Socks5Connector};
use crate::supervisor::{ProcessEvent, Supervisor, SupervisorError};
use crate::system_proxy::{ConfigError, SystemProxyConfigurator, SystemProxyDriver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }
}

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service already running")]
    AlreadyRunning,

    #[error("Service not running")]
    NotRunning,

    #[error("Invalid resolver: {0}")]
    InvalidResolver(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    SystemProxy(#[from] ConfigError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Everything mutated by start/stop/enable/disable, behind one lock
struct Control {
    supervisor: Supervisor,
    relay: Option<RelayHandle>,
    run: Option<u64>,
}

struct Inner {
    config: ServiceConfig,
    settings: SharedSettings,
    events: EventSink,
    verbosity: Verbosity,
    auth: watch::Sender<Option<Socks5Auth>>,
    connector: Arc<Socks5Connector>,
    proxy: Option<SystemProxyConfigurator>,
    control: Mutex<Control>,
    state: watch::Sender<ServiceState>,
    tunnel_alive: Arc<AtomicBool>,
    relay_listening: AtomicBool,
}

/// Service orchestrator. Cheap to clone; clones share one service.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<Inner>,
}

impl ServiceManager {
    /// Build the service. `driver` is `None` where the platform has no
    /// system proxy support.
    ///
    /// Must be called inside a Tokio runtime: the process monitor task
    /// starts here.
    pub fn new(
        config: ServiceConfig,
        settings: SharedSettings,
        driver: Option<Arc<dyn SystemProxyDriver>>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let socks_addr = config.socks.socket_addr()?;

        let current = settings.get();
        let verbosity = Verbosity::new(current.verbose);
        let (auth, auth_rx) = watch::channel(Socks5Auth::from_parts(
            current.socks5_auth_enabled,
            &current.socks5_auth_username,
            &current.socks5_auth_password,
        ));
        let connector = Arc::new(Socks5Connector::new(socks_addr, auth_rx));

        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            config.locator.clone(),
            config.startup_grace,
            config.socks.port,
            process_tx,
        );
        let tunnel_alive = supervisor.alive_flag();

        let proxy = driver.map(|driver| SystemProxyConfigurator::new(driver, config.relay.clone(), settings.clone()));
        let (state, _) = watch::channel(ServiceState::Stopped);

        let inner = Arc::new(Inner {
            config,
            settings,
            events: EventSink::default(),
            verbosity,
            auth,
            connector,
            proxy,
            control: Mutex::new(Control {
                supervisor,
                relay: None,
                run: None,
            }),
            state,
            tunnel_alive,
            relay_listening: AtomicBool::new(false),
        });

        tokio::spawn(monitor(Arc::downgrade(&inner), process_rx));

        Ok(Self { inner })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.inner.settings
    }

    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    /// Follow state transitions
    pub fn watch_state(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    /// Composed status. A pure read; never a source of truth.
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            tunnel_alive: self.inner.tunnel_alive.load(Ordering::Relaxed),
            relay_listening: self.inner.relay_listening.load(Ordering::Relaxed),
            system_proxy_configured: self
                .inner
                .proxy
                .as_ref()
                .is_some_and(SystemProxyConfigurator::is_configured),
            mode: ServiceMode::HttpProxy,
        }
    }

    /// Start the tunnel client, then the relay.
    ///
    /// The system proxy is left alone; see [`Self::enable_system_proxy`].
    pub async fn start(&self, resolver: &str, domain: &str) -> Result<StatusSnapshot, ServiceError> {
        let resolver = Resolver::parse(resolver).ok_or_else(|| ServiceError::InvalidResolver(resolver.to_string()))?;

        let mut control = self.inner.control.lock().await;
        if self.state() != ServiceState::Stopped {
            return Err(ServiceError::AlreadyRunning);
        }

        info!("Starting service (resolver {}, domain {})", resolver, domain);
        self.set_state(ServiceState::Starting);
        self.inner.settings.update(|s| {
            s.resolver = resolver.to_string();
            s.domain = domain.to_string();
        });

        let ready = match control.supervisor.start(&resolver.to_string(), domain).await {
            Ok(ready) => ready,
            Err(e) => {
                error!("Tunnel client failed: {}", e);
                self.inner.events.error(e.to_string());
                self.set_state(ServiceState::Stopped);
                self.emit_status();
                return Err(e.into());
            }
        };

        let server = RelayServer::new(RelayContext::new(
            self.inner.connector.clone(),
            self.inner.verbosity.clone(),
            self.inner.events.clone(),
            self.inner.config.http_timeout,
        ));
        let handle = match server.bind(&self.inner.config.relay).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Relay failed to start: {}", e);
                self.inner.events.error(e.to_string());
                control.supervisor.stop().await;
                self.set_state(ServiceState::Stopped);
                self.emit_status();
                return Err(e.into());
            }
        };

        control.relay = Some(handle);
        control.run = Some(ready.run);
        self.inner.relay_listening.store(true, Ordering::Relaxed);
        self.set_state(ServiceState::Running);

        info!("Service running");
        Ok(self.emit_status())
    }

    /// Tear everything down. Fails only with [`ServiceError::NotRunning`].
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let mut control = self.inner.control.lock().await;
        if self.state() == ServiceState::Stopped {
            return Err(ServiceError::NotRunning);
        }
        self.stop_locked(&mut control).await;
        Ok(())
    }

    /// Best-effort teardown regardless of state. Used on process exit.
    pub async fn shutdown(&self) {
        let mut control = self.inner.control.lock().await;
        self.stop_locked(&mut control).await;
    }

    /// Point the system proxy at the relay. `Ok(false)` if it already was.
    pub async fn enable_system_proxy(&self) -> Result<bool, ServiceError> {
        let _control = self.inner.control.lock().await;
        if !self.state().is_running() {
            return Err(ServiceError::NotRunning);
        }
        let proxy = self.inner.proxy.as_ref().ok_or(ConfigError::Unsupported)?;

        let result = proxy.enable().await;
        if let Err(e) = &result {
            self.inner.events.error(e.to_string());
        }
        self.emit_status();
        Ok(result?)
    }

    /// Turn off the system proxy if we own it. `Ok(false)` if nothing changed.
    pub async fn disable_system_proxy(&self) -> Result<bool, ServiceError> {
        let _control = self.inner.control.lock().await;
        let Some(proxy) = &self.inner.proxy else {
            return Ok(false);
        };

        let result = proxy.disable().await;
        if let Err(e) = &result {
            self.inner.events.error(e.to_string());
        }
        self.emit_status();
        Ok(result?)
    }

    /// Re-read the live OS setting. `Ok(true)` if it points at the relay.
    pub async fn refresh_system_proxy(&self) -> Result<bool, ServiceError> {
        let _control = self.inner.control.lock().await;
        let Some(proxy) = &self.inner.proxy else {
            return Ok(false);
        };

        let result = proxy.refresh().await;
        self.emit_status();
        Ok(result?)
    }

    /// Crash recovery. Run before anything else on startup.
    pub async fn recover(&self) -> Result<bool, ServiceError> {
        let _control = self.inner.control.lock().await;
        let Some(proxy) = &self.inner.proxy else {
            return Ok(false);
        };

        let restored = proxy.recover().await?;
        if restored {
            info!("Restored system proxy left behind by a previous run");
            self.inner.events.log("Restored system proxy left behind by a previous run");
        }
        Ok(restored)
    }

    /// Fetch the probe URL through the running relay
    pub async fn probe_relay(&self) -> Result<ProbeReport, ServiceError> {
        let addr = {
            let control = self.inner.control.lock().await;
            match (&control.relay, self.state().is_running()) {
                (Some(relay), true) => relay.local_addr(),
                _ => return Err(ServiceError::NotRunning),
            }
        };

        match relay::probe(addr, &self.inner.config.probe_url, self.inner.config.probe_timeout).await {
            Ok(report) => {
                self.inner.events.log(format!(
                    "Relay self-test OK: egress {} in {} ms",
                    report.origin,
                    report.elapsed.as_millis()
                ));
                Ok(report)
            }
            Err(e) => {
                self.inner.events.error(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Persist and apply the relay's verbose flag
    pub fn set_verbose(&self, verbose: bool) {
        self.inner.settings.update(|s| s.verbose = verbose);
        self.inner.verbosity.set(verbose);
        debug!("Verbose relay logging {}", if verbose { "on" } else { "off" });
    }

    /// Persist SOCKS5 credentials; the next relayed connection uses them
    pub fn set_socks5_auth(&self, enabled: bool, username: &str, password: &str) {
        self.inner.settings.update(|s| {
            s.socks5_auth_enabled = enabled;
            s.socks5_auth_username = username.to_string();
            s.socks5_auth_password = password.to_string();
        });
        self.inner
            .auth
            .send_replace(Socks5Auth::from_parts(enabled, username, password));
    }

    async fn stop_locked(&self, control: &mut Control) {
        info!("Stopping service");
        self.set_state(ServiceState::Stopping);

        if let Some(proxy) = &self.inner.proxy {
            if let Err(e) = proxy.disable().await {
                warn!("System proxy teardown failed: {}", e);
                self.inner.events.error(e.to_string());
            }
        }

        if let Some(mut relay) = control.relay.take() {
            relay.close().await;
        }
        self.inner.relay_listening.store(false, Ordering::Relaxed);

        control.supervisor.stop().await;
        control.run = None;

        self.set_state(ServiceState::Stopped);
        self.emit_status();
        info!("Service stopped");
    }

    /// Tunnel client `run` exited on its own
    async fn on_tunnel_exit(&self, run: u64, code: Option<i32>) {
        let mut control = self.inner.control.lock().await;
        if !self.state().is_running() || control.run != Some(run) {
            return;
        }

        warn!("Tunnel client exited unexpectedly (code {:?}), stopping service", code);
        self.inner
            .events
            .error(format!("Tunnel client exited unexpectedly (code {code:?})"));
        self.stop_locked(&mut control).await;
    }

    fn set_state(&self, state: ServiceState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!("Service state {:?} -> {:?}", previous, state);
        }
    }

    fn emit_status(&self) -> StatusSnapshot {
        let status = self.status();
        self.inner.events.emit(ServiceEvent::StatusUpdate(status));
        status
    }
}

/// Forward process events to the UI and react to exits
async fn monitor(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let service = ServiceManager { inner };

        match event {
            ProcessEvent::Output(line) => service.inner.events.log(line),
            ProcessEvent::Fault(line) => service.inner.events.error(line),
            ProcessEvent::Exited { run, code } => {
                service.inner.events.emit(ServiceEvent::Exit(code));
                service.on_tunnel_exit(run, code).await;
            }
        }
    }
    debug!("Process monitor finished");
}
