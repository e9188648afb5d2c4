//! Health supervisor
//!
//! Periodically checks every loaded or enabled plugin. Each check runs in its own
//! task under a timeout, so a hanging plugin never delays the others. Persistent
//! failure is reported, never acted on: the supervisor does not disable plugins.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::contract::Plugin;
use super::manager::PluginManager;
use super::types::HealthState;
use crate::config::HealthConfig;
use crate::error::PluginSystemError;

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Passed,
    Failed(String),
    TimedOut(Duration),
}

impl HealthOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// What a check changed about the reported health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    BecameUnhealthy,
    Recovered,
}

/// Health bookkeeping for one plugin.
#[derive(Debug, Clone, Default)]
pub struct HealthRecord {
    pub state: HealthState,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
}

impl HealthRecord {
    /// Fold a check result into the record.
    ///
    /// Failures below `threshold` keep the last known state; reaching it flips the
    /// state to unhealthy exactly once. A pass always reports healthy.
    pub fn observe(&mut self, outcome: &HealthOutcome, threshold: u32) -> HealthTransition {
        self.last_check = Some(Utc::now());

        match outcome {
            HealthOutcome::Passed => {
                let was_unhealthy = self.state == HealthState::Unhealthy;
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.last_error = None;
                self.state = HealthState::Healthy;
                if was_unhealthy {
                    HealthTransition::Recovered
                } else {
                    HealthTransition::Unchanged
                }
            }
            HealthOutcome::Failed(_) | HealthOutcome::TimedOut(_) => {
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = Some(describe(outcome));
                if self.consecutive_failures >= threshold && self.state != HealthState::Unhealthy {
                    self.state = HealthState::Unhealthy;
                    HealthTransition::BecameUnhealthy
                } else {
                    HealthTransition::Unchanged
                }
            }
        }
    }
}

pub(crate) fn describe(outcome: &HealthOutcome) -> String {
    match outcome {
        HealthOutcome::Passed => "healthy".to_string(),
        HealthOutcome::Failed(message) => message.clone(),
        HealthOutcome::TimedOut(after) => {
            format!("health check timed out after {}ms", after.as_millis())
        }
    }
}

/// Run `plugin.health()` in its own task, abandoning it after `timeout`.
///
/// Failures are described through the plugin's own `handle_error`.
pub async fn run_check(plugin: Arc<dyn Plugin>, timeout: Duration) -> HealthOutcome {
    let mut task = tokio::spawn(async move {
        plugin
            .health()
            .await
            .map_err(|err| plugin.handle_error(&err))
    });

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(Ok(()))) => HealthOutcome::Passed,
        Ok(Ok(Err(error))) => HealthOutcome::Failed(error.message),
        Ok(Err(join_err)) => HealthOutcome::Failed(format!("health check panicked: {}", join_err)),
        Err(_) => {
            task.abort();
            HealthOutcome::TimedOut(timeout)
        }
    }
}

pub struct HealthSupervisor {
    manager: Arc<PluginManager>,
    config: HealthConfig,
}

impl HealthSupervisor {
    pub fn new(manager: Arc<PluginManager>, config: HealthConfig) -> Self {
        Self { manager, config }
    }

    /// Run check cycles on the configured interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval().as_secs(),
            timeout_secs = self.config.timeout().as_secs(),
            threshold = self.config.unhealthy_threshold,
            "Health supervisor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        tracing::info!("Health supervisor stopped");
    }

    /// Check every eligible plugin concurrently and apply the results.
    pub async fn run_cycle(&self) -> Vec<(String, HealthState)> {
        let targets = self.manager.health_targets();
        let timeout = self.config.timeout();

        let checks = targets.into_iter().map(|(plugin_id, plugin)| async move {
            let outcome = run_check(plugin, timeout).await;
            (plugin_id, outcome)
        });

        join_all(checks)
            .await
            .into_iter()
            .filter_map(|(plugin_id, outcome)| {
                self.manager
                    .apply_health(&plugin_id, &outcome, self.config.unhealthy_threshold)
                    .map(|state| (plugin_id, state))
            })
            .collect()
    }

    /// Check one plugin immediately, outside the regular schedule.
    ///
    /// The result is recorded like a scheduled check; a timeout is also returned
    /// to the caller as `HealthCheckTimeout`.
    pub async fn check_now(&self, plugin_id: &str) -> Result<HealthState, PluginSystemError> {
        let plugin = self.manager.live_instance(plugin_id)?;
        let outcome = run_check(plugin, self.config.timeout()).await;
        let state = self
            .manager
            .apply_health(plugin_id, &outcome, self.config.unhealthy_threshold)
            .ok_or_else(|| PluginSystemError::NotFound(plugin_id.to_string()))?;

        match outcome {
            HealthOutcome::TimedOut(after) => Err(PluginSystemError::HealthCheckTimeout {
                plugin_id: plugin_id.to_string(),
                timeout_ms: after.as_millis() as u64,
            }),
            _ => Ok(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_after_threshold_consecutive_failures() {
        let mut record = HealthRecord::default();
        let failure = HealthOutcome::Failed("down".to_string());

        assert_eq!(record.observe(&failure, 3), HealthTransition::Unchanged);
        assert_eq!(record.observe(&failure, 3), HealthTransition::Unchanged);
        assert_eq!(record.state, HealthState::Unknown);
        assert_eq!(record.observe(&failure, 3), HealthTransition::BecameUnhealthy);
        assert_eq!(record.state, HealthState::Unhealthy);
        assert_eq!(record.observe(&failure, 3), HealthTransition::Unchanged);

        assert_eq!(
            record.observe(&HealthOutcome::Passed, 3),
            HealthTransition::Recovered
        );
        assert_eq!(record.state, HealthState::Healthy);
        assert_eq!(record.consecutive_failures, 0);
    }

    #[test]
    fn timeout_keeps_last_known_state() {
        let mut record = HealthRecord::default();
        record.observe(&HealthOutcome::Passed, 3);

        let timeout = HealthOutcome::TimedOut(Duration::from_millis(50));
        assert_eq!(record.observe(&timeout, 3), HealthTransition::Unchanged);
        assert_eq!(record.state, HealthState::Healthy);
        assert!(record
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("timed out"));
    }
}
