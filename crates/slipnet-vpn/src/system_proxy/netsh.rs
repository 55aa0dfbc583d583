//! Windows WinHTTP driver. There is a single machine-wide target.

use super::{ApplyOutcome, ConfigError, ProxySetting, ProxyState, SystemProxyDriver, run_command};
use crate::config::ProxyEndpoint;
use async_trait::async_trait;

const NETSH: &str = "netsh";
const TARGET: &str = "winhttp";

#[derive(Debug, Default)]
pub struct NetshDriver;

impl NetshDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SystemProxyDriver for NetshDriver {
    fn name(&self) -> &'static str {
        "netsh"
    }

    async fn targets(&self) -> Result<Vec<String>, ConfigError> {
        Ok(vec![TARGET.to_string()])
    }

    async fn apply(&self, _target: &str, endpoint: &ProxyEndpoint) -> Result<ApplyOutcome, ConfigError> {
        let server = format!("proxy-server={endpoint}");
        let out = run_command(NETSH, &["winhttp", "set", "proxy", &server]).await?;
        if out.contains(&endpoint.to_string()) {
            Ok(ApplyOutcome::Applied)
        } else {
            Ok(ApplyOutcome::Ambiguous(out.trim().to_string()))
        }
    }

    async fn read_back(&self, _target: &str) -> Result<ProxyState, ConfigError> {
        let out = run_command(NETSH, &["winhttp", "show", "proxy"]).await?;
        Ok(parse_show_proxy(&out))
    }

    async fn clear(&self, _target: &str) -> Result<(), ConfigError> {
        run_command(NETSH, &["winhttp", "reset", "proxy"]).await?;
        Ok(())
    }
}

/// `netsh winhttp show proxy` output.
///
/// The server list is either `host:port` for every scheme or
/// `http=host:port;https=host:port`. "Direct access" means off.
fn parse_show_proxy(out: &str) -> ProxyState {
    let Some(servers) = out
        .lines()
        .find(|line| line.trim_start().starts_with("Proxy Server"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim())
    else {
        return ProxyState::default();
    };

    let mut state = ProxyState::default();
    for entry in servers.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((scheme, addr)) if scheme.eq_ignore_ascii_case("http") => state.web = parse_addr(addr),
            Some((scheme, addr)) if scheme.eq_ignore_ascii_case("https") => state.secure = parse_addr(addr),
            Some(_) => {}
            None => {
                state.web = parse_addr(entry);
                state.secure = state.web.clone();
            }
        }
    }
    state
}

fn parse_addr(addr: &str) -> ProxySetting {
    let (host, port) = addr.rsplit_once(':').unwrap_or((addr, "80"));
    ProxySetting {
        enabled: true,
        host: host.to_string(),
        port: port.parse().unwrap_or(80),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_server() {
        let out = "\nCurrent WinHTTP proxy settings:\n\n    Proxy Server(s) :  127.0.0.1:8080\n    Bypass List     :  (none)\n";
        let state = parse_show_proxy(out);
        assert!(state.fully_points_at(&ProxyEndpoint::loopback(8080)));
    }

    #[test]
    fn test_parse_per_scheme() {
        let out = "    Proxy Server(s) :  http=127.0.0.1:8080;https=corp-proxy:3128\n";
        let state = parse_show_proxy(out);
        assert!(state.web.points_at(&ProxyEndpoint::loopback(8080)));
        assert_eq!(state.secure.host, "corp-proxy");
        assert_eq!(state.secure.port, 3128);
    }

    #[test]
    fn test_parse_direct_access() {
        let out = "\nCurrent WinHTTP proxy settings:\n\n    Direct access (no proxy server).\n";
        assert_eq!(parse_show_proxy(out), ProxyState::default());
    }
}
