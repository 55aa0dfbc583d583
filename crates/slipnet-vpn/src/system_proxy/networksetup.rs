//! macOS `networksetup` driver. Targets are network services.

use super::{ApplyOutcome, ConfigError, ProxySetting, ProxyState, SystemProxyDriver, run_command};
use crate::config::ProxyEndpoint;
use async_trait::async_trait;

const NETWORKSETUP: &str = "networksetup";

/// Services tried first, in order
const PREFERRED_SERVICES: [&str; 4] = ["Wi-Fi", "Ethernet", "USB 10/100/1000 LAN", "Thunderbolt Bridge"];

#[derive(Debug, Default)]
pub struct NetworkSetupDriver;

impl NetworkSetupDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SystemProxyDriver for NetworkSetupDriver {
    fn name(&self) -> &'static str {
        "networksetup"
    }

    async fn targets(&self) -> Result<Vec<String>, ConfigError> {
        let listing = run_command(NETWORKSETUP, &["-listallnetworkservices"]).await?;
        Ok(parse_services(&listing))
    }

    fn preferred_targets(&self) -> &[&'static str] {
        &PREFERRED_SERVICES
    }

    async fn apply(&self, target: &str, endpoint: &ProxyEndpoint) -> Result<ApplyOutcome, ConfigError> {
        let port = endpoint.port.to_string();
        let mut complaints = Vec::new();

        let steps: [&[&str]; 4] = [
            &["-setwebproxy", target, endpoint.host.as_str(), port.as_str()],
            &["-setsecurewebproxy", target, endpoint.host.as_str(), port.as_str()],
            &["-setwebproxystate", target, "on"],
            &["-setsecurewebproxystate", target, "on"],
        ];
        for args in steps {
            // networksetup reports some failures on stdout with a zero exit
            let out = run_command(NETWORKSETUP, args).await?;
            if out.contains("Error") || out.contains("not a recognized network service") {
                complaints.push(out.trim().to_string());
            }
        }

        if complaints.is_empty() {
            Ok(ApplyOutcome::Applied)
        } else {
            Ok(ApplyOutcome::Ambiguous(complaints.join("; ")))
        }
    }

    async fn read_back(&self, target: &str) -> Result<ProxyState, ConfigError> {
        let web_args = ["-getwebproxy", target];
        let secure_args = ["-getsecurewebproxy", target];
        let (web, secure) = tokio::join!(
            run_command(NETWORKSETUP, &web_args),
            run_command(NETWORKSETUP, &secure_args),
        );
        Ok(ProxyState {
            web: parse_proxy_info(&web?),
            secure: parse_proxy_info(&secure?),
        })
    }

    async fn clear(&self, target: &str) -> Result<(), ConfigError> {
        run_command(NETWORKSETUP, &["-setwebproxystate", target, "off"]).await?;
        run_command(NETWORKSETUP, &["-setsecurewebproxystate", target, "off"]).await?;
        Ok(())
    }
}

/// `-listallnetworkservices` output, minus the legend and disabled (`*`) services
fn parse_services(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains('*'))
        .map(str::to_string)
        .collect()
}

/// `-getwebproxy` / `-getsecurewebproxy` output
fn parse_proxy_info(info: &str) -> ProxySetting {
    let mut setting = ProxySetting::default();
    for line in info.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Enabled" => setting.enabled = value.eq_ignore_ascii_case("yes"),
            "Server" => setting.host = value.to_string(),
            "Port" => setting.port = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    setting
}
