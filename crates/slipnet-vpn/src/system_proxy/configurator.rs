//! Ownership-aware enable/disable on top of a [`SystemProxyDriver`].
//!
//! Rules:
//! - only a target whose live setting points at the relay is ever cleared
//! - ownership is recorded (and persisted) only after the setting is verified
//! - disabling with nothing owned is a no-op

use super::{ApplyOutcome, ConfigError, ProxyState, SystemProxyDriver};
use crate::config::ProxyEndpoint;
use crate::settings::{SharedSettings, SystemProxyBinding};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

pub struct SystemProxyConfigurator {
    driver: Arc<dyn SystemProxyDriver>,
    relay: ProxyEndpoint,
    settings: SharedSettings,
    configured: Arc<AtomicBool>,
}

impl SystemProxyConfigurator {
    pub fn new(driver: Arc<dyn SystemProxyDriver>, relay: ProxyEndpoint, settings: SharedSettings) -> Self {
        let configured = settings.get().system_proxy_enabled_by_app;
        Self {
            driver,
            relay,
            settings,
            configured: Arc::new(AtomicBool::new(configured)),
        }
    }

    /// Shared "system proxy points at us" flag, for status reads
    pub fn configured_flag(&self) -> Arc<AtomicBool> {
        self.configured.clone()
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Relaxed)
    }

    pub fn relay(&self) -> &ProxyEndpoint {
        &self.relay
    }

    /// Point a target at the relay. `Ok(false)` if it already was, by us.
    pub async fn enable(&self) -> Result<bool, ConfigError> {
        let binding = self.settings.get().binding();
        if let (true, Some(target)) = (binding.owned_by_us, binding.target.as_deref()) {
            if let Ok(state) = self.driver.read_back(target).await {
                if state.fully_points_at(&self.relay) {
                    debug!("System proxy on {} already points at the relay", target);
                    self.configured.store(true, Ordering::Relaxed);
                    return Ok(false);
                }
            }
        }

        let targets = self.driver.targets().await?;
        let candidates = order_candidates(&targets, self.driver.preferred_targets());
        if candidates.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        let mut last_error = None;
        for target in candidates {
            match self.enable_on(&target).await {
                Ok(()) => {
                    self.settings
                        .update(|s| s.set_binding(&SystemProxyBinding::owned(target.clone())));
                    self.configured.store(true, Ordering::Relaxed);
                    info!("System proxy on {} now points at {} (via {})", target, self.relay, self.driver.name());
                    return Ok(true);
                }
                Err(e) => {
                    warn!("{}", e);
                    last_error = Some(e);
                }
            }
        }

        self.configured.store(false, Ordering::Relaxed);
        Err(last_error.unwrap_or(ConfigError::NoTargets))
    }

    /// Apply and verify on one target, rolling back on a positive mismatch
    async fn enable_on(&self, target: &str) -> Result<(), ConfigError> {
        let outcome = match self.driver.apply(target, &self.relay).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.roll_back(target).await;
                return Err(ConfigError::ApplyFailed {
                    target: target.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        match (self.driver.read_back(target).await, outcome) {
            (Ok(state), _) if state.fully_points_at(&self.relay) => Ok(()),
            (Ok(state), _) => {
                self.roll_back(target).await;
                Err(ConfigError::ApplyFailed {
                    target: target.to_string(),
                    reason: format!("setting reads back as {}", describe(&state)),
                })
            }
            (Err(e), ApplyOutcome::Applied) => {
                warn!("Could not read back system proxy on {} ({}), trusting apply", target, e);
                Ok(())
            }
            (Err(e), ApplyOutcome::Ambiguous(output)) => Err(ConfigError::VerifyInconclusive {
                target: target.to_string(),
                reason: format!("{e}; apply said: {output}"),
            }),
        }
    }

    /// Undo a partial apply, but only the parts that point at us
    async fn roll_back(&self, target: &str) {
        if let Ok(state) = self.driver.read_back(target).await {
            if state.points_at(&self.relay) {
                if let Err(e) = self.driver.clear(target).await {
                    warn!("Rollback on {} failed: {}", target, e);
                }
            }
        }
    }

    /// Turn off every proxy setting that points at the relay.
    ///
    /// `Ok(true)` if something was switched off.
    pub async fn disable(&self) -> Result<bool, ConfigError> {
        let binding = self.settings.get().binding();
        if !binding.owned_by_us {
            debug!("No owned system proxy binding, nothing to disable");
            self.configured.store(false, Ordering::Relaxed);
            return Ok(false);
        }

        let mut changed = false;
        if let Some(target) = binding.target.as_deref() {
            changed = self.disable_owned(target).await?;
        }

        if !changed {
            for target in self.driver.targets().await.unwrap_or_default() {
                if binding.target.as_deref() == Some(target.as_str()) {
                    continue;
                }
                match self.driver.read_back(&target).await {
                    Ok(state) if state.points_at(&self.relay) => {
                        self.driver.clear(&target).await?;
                        info!("System proxy on {} switched off", target);
                        changed = true;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Skipping {}: {}", target, e),
                }
            }
        }

        self.settings
            .update(|s| s.set_binding(&SystemProxyBinding::none()));
        self.configured.store(false, Ordering::Relaxed);
        Ok(changed)
    }

    async fn disable_owned(&self, target: &str) -> Result<bool, ConfigError> {
        match self.driver.read_back(target).await {
            Ok(state) if state.points_at(&self.relay) => {}
            Ok(state) => {
                let mismatch = ConfigError::OwnershipMismatch {
                    target: target.to_string(),
                    found: describe(&state),
                };
                info!("{}; leaving it alone", mismatch);
                return Ok(false);
            }
            Err(e) => warn!("Could not read system proxy on {} ({}), clearing our binding anyway", target, e),
        }

        self.driver.clear(target).await?;
        info!("System proxy on {} switched off", target);
        Ok(true)
    }

    /// Crash recovery: undo a binding a previous run left behind
    pub async fn recover(&self) -> Result<bool, ConfigError> {
        let binding = self.settings.get().binding();
        if !binding.owned_by_us {
            return Ok(false);
        }
        warn!(
            "System proxy on {} was left enabled by a previous run, disabling",
            binding.target.as_deref().unwrap_or("<unknown>")
        );
        self.disable().await
    }

    /// Re-read the owned target and update the configured flag
    pub async fn refresh(&self) -> Result<bool, ConfigError> {
        let binding = self.settings.get().binding();
        let (true, Some(target)) = (binding.owned_by_us, binding.target) else {
            self.configured.store(false, Ordering::Relaxed);
            return Ok(false);
        };

        let state = self.driver.read_back(&target).await?;
        let live = state.points_at(&self.relay);
        self.configured.store(live, Ordering::Relaxed);
        if live || (!state.web.enabled && !state.secure.enabled) {
            return Ok(live);
        }
        Err(ConfigError::OwnershipMismatch {
            target,
            found: describe(&state),
        })
    }
}

/// Preferred names that exist (substring, case-insensitive), then the first target
fn order_candidates(targets: &[String], preferred: &[&str]) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::new();
    for wanted in preferred {
        let wanted = wanted.to_ascii_lowercase();
        if let Some(found) = targets
            .iter()
            .find(|t| t.to_ascii_lowercase().contains(&wanted))
        {
            if !ordered.contains(found) {
                ordered.push(found.clone());
            }
        }
    }
    if let Some(first) = targets.first() {
        if !ordered.contains(first) {
            ordered.push(first.clone());
        }
    }
    ordered
}

fn describe(state: &ProxyState) -> String {
    let one = |s: &super::ProxySetting| {
        if s.enabled {
            format!("{}:{}", s.host, s.port)
        } else {
            "off".to_string()
        }
    };
    format!("web {}, secure {}", one(&state.web), one(&state.secure))
}
