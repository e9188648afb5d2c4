//! Lifecycle state machine.
//!
//! ```text
//! Unloaded -> Validating -> Loaded -> {Enabled, Disabled} -> Unloading -> Unloaded
//!                  |                      ^         |
//!                  +--> Unloaded          +---------+
//! ```

use super::types::LifecycleState;
use crate::error::PluginSystemError;

impl LifecycleState {
    /// True when the transition `self -> next` is part of the state machine.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (self, next),
            (Unloaded, Validating)
                | (Validating, Loaded)
                | (Validating, Unloaded)
                | (Loaded, Enabled)
                | (Loaded, Disabled)
                | (Loaded, Unloading)
                | (Enabled, Disabled)
                | (Disabled, Enabled)
                | (Enabled, Unloading)
                | (Disabled, Unloading)
                | (Unloading, Unloaded)
        )
    }

    /// States in which the plugin object is instantiated and initialized.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            LifecycleState::Loaded | LifecycleState::Enabled | LifecycleState::Disabled
        )
    }
}

/// Apply a transition, failing with `InvalidState` if the table forbids it.
pub fn transition(
    plugin_id: &str,
    from: LifecycleState,
    to: LifecycleState,
) -> Result<LifecycleState, PluginSystemError> {
    if !from.can_transition_to(to) {
        return Err(PluginSystemError::InvalidState {
            plugin_id: plugin_id.to_string(),
            from,
            to,
        });
    }
    tracing::debug!(plugin_id = %plugin_id, from = %from, to = %to, "Plugin state transition");
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    const ALL: [LifecycleState; 6] = [Unloaded, Validating, Loaded, Enabled, Disabled, Unloading];

    #[test]
    fn enabled_and_disabled_only_reachable_from_loaded_or_each_other() {
        for from in ALL {
            for to in [Enabled, Disabled] {
                let expected = matches!(
                    (from, to),
                    (Loaded, _) | (Enabled, Disabled) | (Disabled, Enabled)
                );
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn validation_failure_returns_to_unloaded() {
        assert_eq!(
            transition("p", Validating, Unloaded).expect("allowed"),
            Unloaded
        );
        assert!(matches!(
            transition("p", Unloaded, Loaded),
            Err(PluginSystemError::InvalidState { .. })
        ));
    }

    #[test]
    fn full_cycle_is_allowed() {
        let path = [Unloaded, Validating, Loaded, Enabled, Disabled, Unloading, Unloaded];
        for pair in path.windows(2) {
            transition("p", pair[0], pair[1]).expect("cycle transition allowed");
        }
        assert!(!Unloading.can_transition_to(Enabled));
        assert!(Enabled.is_live());
        assert!(!Unloading.is_live());
    }
}
