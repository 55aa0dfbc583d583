//! Service Configuration
//!
//! Immutable run-time parameters for the relay, the SOCKS5 hop and the
//! tunnel-client supervisor. Built once and passed explicitly into every
//! component; nothing reads ambient process state for configuration.

use crate::supervisor::BinaryLocator;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Loopback port of the HTTP relay
pub const RELAY_PORT: u16 = 8080;

/// Loopback port of the tunnel client's SOCKS5 endpoint
pub const SOCKS5_PORT: u16 = 5201;

/// Default DNS port when a resolver is given without one
pub const DNS_PORT: u16 = 53;

/// Loopback `{host, port}` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Host (always a loopback literal in practice)
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ProxyEndpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `127.0.0.1:<port>`
    pub fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST.to_string(), port)
    }

    /// Resolve to a socket address (host must be an IP literal)
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::InvalidEndpoint(self.to_string()))
    }

    /// Does `host:port` name this endpoint?
    pub fn matches(&self, host: &str, port: u16) -> bool {
        port == self.port && host.trim() == self.host
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// DNS resolver handed to the tunnel client (`--resolver <ip:port>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolver {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Resolver {
    /// Parse `a.b.c.d` or `a.b.c.d:port`. Only IPv4 is accepted.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let (ip, port) = match raw.split_once(':') {
            Some((ip, port)) => {
                if port.is_empty() || port.len() > 5 || !port.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let port: u16 = port.parse().ok()?;
                if port == 0 {
                    return None;
                }
                (ip, port)
            }
            None => (raw, DNS_PORT),
        };

        Some(Self {
            ip: ip.parse().ok()?,
            port,
        })
    }

    /// Same resolver on the standard DNS port
    pub fn normalized(&self) -> Self {
        Self {
            ip: self.ip,
            port: DNS_PORT,
        }
    }
}

impl std::fmt::Display for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Complete service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Where the HTTP relay listens
    pub relay: ProxyEndpoint,
    /// Where the tunnel client exposes SOCKS5
    pub socks: ProxyEndpoint,
    /// How to find the tunnel-client binary
    pub locator: BinaryLocator,
    /// Time the tunnel client gets to bind its SOCKS5 port
    pub startup_grace: Duration,
    /// Bound on plain-HTTP inbound and outbound legs
    pub http_timeout: Duration,
    /// Bound on the shutdown teardown path
    pub teardown_timeout: Duration,
    /// URL fetched through the relay by the self-test
    pub probe_url: String,
    /// Bound on the self-test request
    pub probe_timeout: Duration,
}

impl ServiceConfig {
    /// Create a configuration with the given binary locator and defaults
    pub fn new(locator: BinaryLocator) -> Self {
        Self {
            relay: ProxyEndpoint::loopback(RELAY_PORT),
            socks: ProxyEndpoint::loopback(SOCKS5_PORT),
            locator,
            startup_grace: Duration::from_secs(2),
            http_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(8),
            probe_url: "http://httpbin.org/ip".to_string(),
            probe_timeout: Duration::from_secs(10),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay.socket_addr()?;
        self.socks.socket_addr()?;
        if self.socks.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.startup_grace.is_zero() {
            return Err(ConfigError::ZeroGrace);
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new(BinaryLocator::default())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid SOCKS5 port")]
    InvalidPort,

    #[error("Startup grace interval must be non-zero")]
    ZeroGrace,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let ep = ProxyEndpoint::loopback(8080);
        assert_eq!(ep.to_string(), "127.0.0.1:8080");
        assert!(ep.matches("127.0.0.1", 8080));
        assert!(!ep.matches("127.0.0.1", 3128));
        assert!(!ep.matches("10.0.0.1", 8080));
    }

    #[test]
    fn test_resolver_parse() {
        let r = Resolver::parse("1.1.1.1:53").unwrap();
        assert_eq!(r.to_string(), "1.1.1.1:53");

        let r = Resolver::parse(" 8.8.4.4 ").unwrap();
        assert_eq!(r.port, 53);

        let r = Resolver::parse("9.9.9.9:5353").unwrap();
        assert_eq!(r.normalized().to_string(), "9.9.9.9:53");
    }

    #[test]
    fn test_resolver_rejects_garbage() {
        for bad in ["", "dns.google", "1.1.1", "256.1.1.1", "1.1.1.1:", "1.1.1.1:0", "1.1.1.1:70000", "::1", "01.1.1.1", "1.1.1.01:53"] {
            assert!(Resolver::parse(bad).is_none(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_config_default() {
        let config = ServiceConfig::default();

        assert_eq!(config.relay.port, RELAY_PORT);
        assert_eq!(config.socks.port, SOCKS5_PORT);
        assert_eq!(config.startup_grace, Duration::from_secs(2));
        assert_eq!(config.teardown_timeout, Duration::from_secs(8));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_hostname_socks() {
        let mut config = ServiceConfig::default();
        config.socks = ProxyEndpoint::new("localhost", 5201);
        assert!(config.validate().is_err());
    }
}
