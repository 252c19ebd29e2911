use super::types::{ProcessInstance, TerminationEvent};
use crate::config::{ProcessSpec, SupervisorSettings};
use std::time::Duration;

/// What the supervisor should do after a life ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Leave the instance stopped
    Stop,
    /// Relaunch without waiting
    RestartNow,
    /// Relaunch once the delay has elapsed
    RestartAfter(Duration),
}

/// Delay after `failures` consecutive failures: `initial * 2^failures`, capped at `max_delay`
pub fn backoff_delay(initial_delay: Duration, max_delay: Duration, failures: u32) -> Duration {
    let factor = 2_u32.checked_pow(failures).unwrap_or(u32::MAX);
    initial_delay.saturating_mul(factor).min(max_delay)
}

/// Restart rules shared by every instance of a supervisor
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay before the first automatic restart
    pub initial_delay: Duration,
    /// Upper bound for the exponential backoff
    pub max_delay: Duration,
    /// A life at least this long resets the failure streak
    pub min_uptime: Duration,
}

impl RestartPolicy {
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.restart_delay_ms),
            max_delay: Duration::from_millis(
                settings.max_restart_delay_ms.max(settings.restart_delay_ms),
            ),
            min_uptime: Duration::from_millis(settings.min_uptime_ms),
        }
    }

    /// Consecutive failures that count towards the next delay.
    ///
    /// The streak stored on the instance is discarded when the life that
    /// just ended ran for at least `min_uptime`.
    pub fn effective_failures(&self, instance: &ProcessInstance) -> u32 {
        match instance.last_run_duration() {
            Some(ran) if ran >= self.min_uptime => 0,
            _ => instance.consecutive_failures,
        }
    }

    /// Calculate the delay before the next restart attempt
    pub fn calculate_delay(&self, instance: &ProcessInstance) -> Duration {
        backoff_delay(
            self.initial_delay,
            self.max_delay,
            self.effective_failures(instance),
        )
    }

    /// Decide what happens after `event`.
    ///
    /// Pure: reads the process spec and the instance history, never mutates either.
    /// Manual stops never reach this function.
    pub fn decide(
        &self,
        spec: &ProcessSpec,
        instance: &ProcessInstance,
        event: &TerminationEvent,
    ) -> RestartDecision {
        // A memory breach restarts even when autorestart is off
        if !event.is_memory_breach() && !spec.autorestart {
            return RestartDecision::Stop;
        }

        let delay = self.calculate_delay(instance);
        if delay.is_zero() {
            RestartDecision::RestartNow
        } else {
            RestartDecision::RestartAfter(delay)
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}
