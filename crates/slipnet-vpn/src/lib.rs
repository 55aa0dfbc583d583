//! slipnet VPN - DNS Tunnel Client with Local HTTP Proxy
//!
//! Runs an external DNS-tunnel client that exposes SOCKS5 on loopback,
//! fronts it with an HTTP/1.1 proxy that browsers and the OS can use, and
//! optionally points the system proxy at that relay.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         slipnet process                          │
//! │                                                                  │
//! │  ┌──────────┐   ┌──────────────┐   ┌────────────┐   ┌─────────┐  │
//! │  │ Browser  │──▶│  HTTP Relay  │──▶│  SOCKS5    │──▶│ tunnel  │  │
//! │  │ / OS app │   │ 127.0.0.1:   │   │ 127.0.0.1: │   │ client  │  │
//! │  └──────────┘   │    8080      │   │   5201     │   │ (child) │  │
//! │       ▲         └──────────────┘   └────────────┘   └────┬────┘  │
//! │       │                                                  │       │
//! │  ┌────┴─────────────┐   ┌────────────────────┐           │       │
//! │  │ System Proxy     │◀──│ Service Manager    │── spawn ──┘       │
//! │  │ Configurator     │   │ (state machine)    │                   │
//! │  └──────────────────┘   └────────────────────┘                   │
//! └──────────────────────────────────────────────────────────────────┘
//!                                                  │
//!                                                  ▼ DNS
//!                                      ┌─────────────────────┐
//!                                      │ Resolver → tunnel   │
//!                                      │ server (domain)     │
//!                                      └─────────────────────┘
//! ```
//!
//! # Features
//!
//! - **HTTP relay**: plain requests, `CONNECT` tunnels and protocol upgrades
//! - **SOCKS5 hop**: optional username/password, changeable at runtime
//! - **System proxy**: only ever undoes what this process set
//! - **Crash recovery**: a proxy left behind by a crashed run is restored on startup

pub mod config;
pub mod events;
pub mod relay;
pub mod service;
pub mod settings;
pub mod socks;
pub mod supervisor;
pub mod system_proxy;
pub mod teardown;

#[cfg(test)]
mod testing;

pub use config::{ProxyEndpoint, Resolver, ServiceConfig};
pub use events::{EventSink, ServiceEvent, ServiceMode, StatusSnapshot, Verbosity};
pub use relay::{ProbeReport, RelayError, RelayHandle, RelayServer};
pub use service::{ServiceError, ServiceManager, ServiceState};
pub use settings::{JsonFileStore, Settings, SettingsError, SettingsStore, SharedSettings};
pub use socks::{Socks5Auth, Socks5Connector};
pub use supervisor::{BinaryLocator, ProcessEvent, Supervisor, SupervisorError};
pub use system_proxy::{ConfigError, SystemProxyConfigurator, SystemProxyDriver, default_driver};
pub use teardown::{ExitSignal, Teardown, wait_for_signal};
