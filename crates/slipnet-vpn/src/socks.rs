//! SOCKS5 Relay Client
//!
//! Dials destinations through the tunnel client's loopback SOCKS5
//! endpoint. Credentials are optional and may change at run time; the
//! active connection descriptor is compared against the desired one on
//! every dial and rebuilt when they differ, so stale credentials are
//! never reused.

use crate::relay::RelayError;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info};

/// Stream established through the SOCKS5 hop
pub type SocksStream = Socks5Stream<TcpStream>;

/// Username/password for the SOCKS5 auth subnegotiation
#[derive(Clone, PartialEq, Eq)]
pub struct Socks5Auth {
    pub username: String,
    pub password: String,
}

impl Socks5Auth {
    /// Credentials only when enabled and both parts are present
    pub fn from_parts(enabled: bool, username: &str, password: &str) -> Option<Self> {
        if enabled && !username.is_empty() && !password.is_empty() {
            Some(Self {
                username: username.to_string(),
                password: password.to_string(),
            })
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Socks5Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5Auth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Connection parameters for one SOCKS5 hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksDescriptor {
    endpoint: SocketAddr,
    auth: Option<Socks5Auth>,
}

impl SocksDescriptor {
    pub fn new(endpoint: SocketAddr, auth: Option<Socks5Auth>) -> Self {
        Self { endpoint, auth }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn auth(&self) -> Option<&Socks5Auth> {
        self.auth.as_ref()
    }

    /// `socks5://[user:pass@]host:port`, userinfo percent-encoded
    pub fn url(&self) -> String {
        let base = format!("socks5://{}", self.endpoint);
        let Some(auth) = &self.auth else {
            return base;
        };
        match url::Url::parse(&base) {
            Ok(mut url) => {
                if url.set_username(&auth.username).is_err()
                    || url.set_password(Some(&auth.password)).is_err()
                {
                    return base;
                }
                url.to_string()
            }
            Err(_) => base,
        }
    }

    /// Same as [`url`](Self::url) with the password masked
    pub fn redacted(&self) -> String {
        match &self.auth {
            Some(auth) => format!("socks5://{}:***@{}", auth.username, self.endpoint),
            None => format!("socks5://{}", self.endpoint),
        }
    }
}

/// Source of the desired SOCKS5 credentials
pub type AuthWatch = watch::Receiver<Option<Socks5Auth>>;

/// Dialer for the SOCKS5 hop
pub struct Socks5Connector {
    endpoint: SocketAddr,
    desired: AuthWatch,
    active: Mutex<Option<Arc<SocksDescriptor>>>,
}

impl Socks5Connector {
    pub fn new(endpoint: SocketAddr, desired: AuthWatch) -> Self {
        Self {
            endpoint,
            desired,
            active: Mutex::new(None),
        }
    }

    /// Anonymous connector with fixed parameters
    pub fn anonymous(endpoint: SocketAddr) -> Self {
        let (_tx, rx) = watch::channel(None);
        Self::new(endpoint, rx)
    }

    /// Current descriptor, rebuilt if the desired parameters changed
    pub fn descriptor(&self) -> Arc<SocksDescriptor> {
        let desired = SocksDescriptor::new(self.endpoint, self.desired.borrow().clone());

        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match active.as_ref() {
            Some(current) if current.url() == desired.url() => current.clone(),
            previous => {
                if previous.is_some() {
                    info!("SOCKS5 parameters changed, now using {}", desired.redacted());
                } else {
                    debug!("SOCKS5 hop via {}", desired.redacted());
                }
                let fresh = Arc::new(desired);
                *active = Some(fresh.clone());
                fresh
            }
        }
    }

    /// CONNECT to `host:port` through the hop
    pub async fn connect(&self, host: &str, port: u16) -> Result<SocksStream, RelayError> {
        let descriptor = self.descriptor();
        let target = (host, port);

        let result = match descriptor.auth() {
            Some(auth) => {
                Socks5Stream::connect_with_password(
                    descriptor.endpoint(),
                    target,
                    &auth.username,
                    &auth.password,
                )
                .await
            }
            None => Socks5Stream::connect(descriptor.endpoint(), target).await,
        };

        let stream = result.map_err(|e| RelayError::UpstreamHandshakeFailed {
            target: format!("{host}:{port}"),
            reason: e.to_string(),
        })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}
