//! GNOME `gsettings` driver. One desktop-wide target.

use super::{ApplyOutcome, ConfigError, ProxySetting, ProxyState, SystemProxyDriver, run_command};
use crate::config::ProxyEndpoint;
use async_trait::async_trait;

const GSETTINGS: &str = "gsettings";
const TARGET: &str = "gsettings";
const PROXY: &str = "org.gnome.system.proxy";
const HTTP: &str = "org.gnome.system.proxy.http";
const HTTPS: &str = "org.gnome.system.proxy.https";

#[derive(Debug, Default)]
pub struct GsettingsDriver;

impl GsettingsDriver {
    pub fn new() -> Self {
        Self
    }

    async fn get(schema: &str, key: &str) -> Result<String, ConfigError> {
        Ok(unquote(&run_command(GSETTINGS, &["get", schema, key]).await?))
    }

    async fn set(schema: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        run_command(GSETTINGS, &["set", schema, key, value]).await?;
        Ok(())
    }
}

#[async_trait]
impl SystemProxyDriver for GsettingsDriver {
    fn name(&self) -> &'static str {
        "gsettings"
    }

    async fn targets(&self) -> Result<Vec<String>, ConfigError> {
        Ok(vec![TARGET.to_string()])
    }

    async fn apply(&self, _target: &str, endpoint: &ProxyEndpoint) -> Result<ApplyOutcome, ConfigError> {
        let port = endpoint.port.to_string();
        Self::set(HTTP, "host", &endpoint.host).await?;
        Self::set(HTTP, "port", &port).await?;
        Self::set(HTTPS, "host", &endpoint.host).await?;
        Self::set(HTTPS, "port", &port).await?;
        Self::set(PROXY, "mode", "manual").await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn read_back(&self, _target: &str) -> Result<ProxyState, ConfigError> {
        let (mode, http_host, http_port, https_host, https_port) = tokio::join!(
            Self::get(PROXY, "mode"),
            Self::get(HTTP, "host"),
            Self::get(HTTP, "port"),
            Self::get(HTTPS, "host"),
            Self::get(HTTPS, "port"),
        );
        let manual = mode? == "manual";

        Ok(ProxyState {
            web: setting(manual, http_host?, &http_port?),
            secure: setting(manual, https_host?, &https_port?),
        })
    }

    async fn clear(&self, _target: &str) -> Result<(), ConfigError> {
        Self::set(PROXY, "mode", "none").await
    }
}

fn setting(manual: bool, host: String, port: &str) -> ProxySetting {
    ProxySetting {
        enabled: manual && !host.is_empty(),
        host,
        port: parse_port(port),
    }
}

/// `'127.0.0.1'` -> `127.0.0.1`
fn unquote(value: &str) -> String {
    value.trim().trim_matches('\'').to_string()
}

/// `8080` or `uint32 8080`
fn parse_port(value: &str) -> u16 {
    value
        .split_whitespace()
        .last()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
