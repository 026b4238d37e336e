use std::time::Duration;

use error_stack::report;
use serde::Deserialize;
use serde::Serialize;

use crate::error::SchedError;
use crate::Result;

/// Tunables shared by every device the scheduler manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Period of the dispatcher when nothing wakes it earlier.
    pub dispatch_interval_ms: u64,
    /// Length of one balance interval.
    pub balance_interval_ms: u64,
    /// Added to every priority class when computing budget weights.
    pub priority_bias: u64,
    /// Requests added to an exhausted cap each dispatch round the device is idle.
    pub idle_increment: u64,
    /// Busy percentage at or above which the device counts as saturated.
    pub saturated_percent: u32,
    /// Busy percentage below which a capped binding may be released.
    pub relaxed_percent: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 60,
            balance_interval_ms: 500,
            priority_bias: 5,
            idle_increment: 5,
            saturated_percent: 90,
            relaxed_percent: 80,
        }
    }
}

impl SchedulerConfig {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn balance_interval(&self) -> Duration {
        Duration::from_millis(self.balance_interval_ms)
    }

    pub fn validate(&self) -> Result<(), SchedError> {
        if self.dispatch_interval_ms == 0 {
            return Err(report!(SchedError::invalid_config(
                "dispatch_interval_ms must be greater than 0"
            )));
        }
        if self.balance_interval_ms == 0 {
            return Err(report!(SchedError::invalid_config(
                "balance_interval_ms must be greater than 0"
            )));
        }
        if self.saturated_percent > 100 || self.relaxed_percent > 100 {
            return Err(report!(SchedError::invalid_config(format!(
                "busy thresholds must be percentages, got saturated={} relaxed={}",
                self.saturated_percent, self.relaxed_percent
            ))));
        }
        if self.relaxed_percent > self.saturated_percent {
            return Err(report!(SchedError::invalid_config(format!(
                "relaxed_percent ({}) must not exceed saturated_percent ({})",
                self.relaxed_percent, self.saturated_percent
            ))));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch_interval(), Duration::from_millis(60));
        assert_eq!(config.balance_interval(), Duration::from_millis(500));
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"balanceIntervalMs": 250, "priorityBias": 3}"#)
                .expect("should deserialize");
        assert_eq!(config.balance_interval_ms, 250);
        assert_eq!(config.priority_bias, 3);
        assert_eq!(config.dispatch_interval_ms, 60);
        assert_eq!(config.saturated_percent, 90);
    }

    #[test]
    fn rejects_zero_intervals() {
        let config = SchedulerConfig {
            dispatch_interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().expect_err("zero dispatch interval");
        assert!(matches!(
            err.current_context(),
            SchedError::InvalidConfiguration { .. }
        ));

        let config = SchedulerConfig {
            balance_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config = SchedulerConfig {
            saturated_percent: 70,
            relaxed_percent: 80,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            saturated_percent: 120,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
