//! System Proxy Configurator
//!
//! Points the operating system's web-proxy settings at the relay and
//! restores them afterwards, touching only what this process enabled.
//!
//! The platform-agnostic discipline lives in [`SystemProxyConfigurator`];
//! the side effects go through a [`SystemProxyDriver`]:
//!
//! | Platform | Driver                 | Target                    |
//! |----------|------------------------|---------------------------|
//! | macOS    | [`NetworkSetupDriver`] | network service (`Wi-Fi`) |
//! | Windows  | [`NetshDriver`]        | `winhttp`                 |
//! | Linux    | [`GsettingsDriver`]    | `gsettings`               |

mod configurator;
mod gsettings;
mod netsh;
mod networksetup;

pub use configurator::SystemProxyConfigurator;
pub use gsettings::GsettingsDriver;
pub use netsh::NetshDriver;
pub use networksetup::NetworkSetupDriver;

use crate::config::ProxyEndpoint;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Bound on a single configuration command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// One proxy setting (plain or secure) as the OS reports it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySetting {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl ProxySetting {
    /// Enabled and aimed at `endpoint`
    pub fn points_at(&self, endpoint: &ProxyEndpoint) -> bool {
        self.enabled && endpoint.matches(&self.host, self.port)
    }
}

/// Live web-proxy state of one target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyState {
    pub web: ProxySetting,
    pub secure: ProxySetting,
}

impl ProxyState {
    /// Both settings on and aimed at `host:port`
    pub fn enabled(host: impl Into<String>, port: u16) -> Self {
        let setting = ProxySetting {
            enabled: true,
            host: host.into(),
            port,
        };
        Self {
            web: setting.clone(),
            secure: setting,
        }
    }

    /// Both settings aimed at `endpoint`
    pub fn fully_points_at(&self, endpoint: &ProxyEndpoint) -> bool {
        self.web.points_at(endpoint) && self.secure.points_at(endpoint)
    }

    /// Either setting aimed at `endpoint`
    pub fn points_at(&self, endpoint: &ProxyEndpoint) -> bool {
        self.web.points_at(endpoint) || self.secure.points_at(endpoint)
    }
}

/// How sure a driver is that `apply` worked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every step reported success
    Applied,
    /// Commands exited cleanly but their output was not what success looks like
    Ambiguous(String),
}

/// Platform-native proxy configuration.
///
/// Implementations only perform side effects; ownership rules live in the
/// configurator.
#[async_trait]
pub trait SystemProxyDriver: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Every target that can carry a proxy setting
    async fn targets(&self) -> Result<Vec<String>, ConfigError>;

    /// Target names to try first, most preferred first
    fn preferred_targets(&self) -> &[&'static str] {
        &[]
    }

    /// Point plain and secure web proxy of `target` at `endpoint` and turn them on
    async fn apply(&self, target: &str, endpoint: &ProxyEndpoint) -> Result<ApplyOutcome, ConfigError>;

    /// Read the live setting of `target`
    async fn read_back(&self, target: &str) -> Result<ProxyState, ConfigError>;

    /// Turn the web proxy of `target` off
    async fn clear(&self, target: &str) -> Result<(), ConfigError>;
}

/// Driver for the platform this binary was built for
pub fn default_driver() -> Option<Arc<dyn SystemProxyDriver>> {
    #[cfg(target_os = "macos")]
    return Some(Arc::new(NetworkSetupDriver::new()));

    #[cfg(target_os = "windows")]
    return Some(Arc::new(NetshDriver::new()));

    #[cfg(target_os = "linux")]
    return Some(Arc::new(GsettingsDriver::new()));

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    None
}

/// Configurator errors. Never fatal; the caller may retry by hand.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to configure system proxy on {target}: {reason}")]
    ApplyFailed { target: String, reason: String },

    #[error("Could not verify the system proxy on {target}: {reason}")]
    VerifyInconclusive { target: String, reason: String },

    #[error("System proxy on {target} now points at {found}, not at the relay")]
    OwnershipMismatch { target: String, found: String },

    #[error("`{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("No network service available for proxy configuration")]
    NoTargets,

    #[error("`{0}` timed out")]
    Timeout(String),

    #[error("System proxy configuration is not supported on this platform")]
    Unsupported,
}

/// Run a configuration command and return its stdout
pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<String, ConfigError> {
    let command_line = format!("{} {}", program, args.join(" "));
    debug!("Running {}", command_line);

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let output = tokio::time::timeout(COMMAND_TIMEOUT, command.output())
        .await
        .map_err(|_| ConfigError::Timeout(command_line.clone()))?
        .map_err(|e| ConfigError::Command {
            command: command_line.clone(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match stderr.trim() {
            "" => output.status.to_string(),
            text => text.to_string(),
        };
        return Err(ConfigError::Command {
            command: command_line,
            reason,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_matching() {
        let relay = ProxyEndpoint::loopback(8080);
        let ours = ProxySetting {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        };
        let theirs = ProxySetting {
            enabled: true,
            host: "10.0.0.5".to_string(),
            port: 3128,
        };
        let off = ProxySetting {
            enabled: false,
            ..ours.clone()
        };

        assert!(ours.points_at(&relay));
        assert!(!theirs.points_at(&relay));
        assert!(!off.points_at(&relay));

        let mixed = ProxyState {
            web: ours.clone(),
            secure: theirs,
        };
        assert!(mixed.points_at(&relay));
        assert!(!mixed.fully_points_at(&relay));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_reports_failure() {
        assert_eq!(run_command("echo", &["hi"]).await.unwrap().trim(), "hi");
        assert!(matches!(
            run_command("false", &[]).await,
            Err(ConfigError::Command { .. })
        ));
        assert!(run_command("/nonexistent/tool", &[]).await.is_err());
    }
}
