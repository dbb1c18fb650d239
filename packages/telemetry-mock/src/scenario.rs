//! Injectable fault scenarios for the synthetic source.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MockScenario {
    /// Realistic smooth simulation, no faults
    Normal,
    /// Sensors intermittently freeze at zero or report corrupted values
    SensorFailures,
    /// The stream pauses entirely for multi-second windows
    DataStalls,
    /// Individual messages and short bursts go missing
    Intermittent,
    /// GPS drift, degraded accuracy and sudden position jumps
    GpsIssues,
    /// All problems combined at moderate levels
    Chaos,
}

impl MockScenario {
    /// Tag used in the sample's `data_source` field, e.g. `MOCK_CHAOS`.
    pub fn source_tag(&self) -> String {
        let name = match self {
            Self::Normal => "NORMAL",
            Self::SensorFailures => "SENSOR_FAILURES",
            Self::DataStalls => "DATA_STALLS",
            Self::Intermittent => "INTERMITTENT",
            Self::GpsIssues => "GPS_ISSUES",
            Self::Chaos => "CHAOS",
        };
        format!("MOCK_{name}")
    }
}

/// Per-scenario fault probabilities and durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockModeConfig {
    pub scenario: MockScenario,

    // Sensor failures
    /// Chance per message to start a failure window.
    pub sensor_failure_probability: f64,
    /// Messages a failure window lasts.
    pub sensor_failure_duration: u32,

    // Data stalls
    /// Chance per message to start a stall.
    pub stall_probability: f64,
    pub stall_duration_min_s: f64,
    pub stall_duration_max_s: f64,

    // Intermittent connection
    pub drop_probability: f64,
    pub burst_drop_probability: f64,

    // GPS issues
    pub gps_drift_active: bool,
    pub gps_accuracy_degraded: bool,
    pub gps_jump_probability: f64,
}

impl Default for MockModeConfig {
    fn default() -> Self {
        Self {
            scenario: MockScenario::Normal,
            sensor_failure_probability: 0.0,
            sensor_failure_duration: 0,
            stall_probability: 0.0,
            stall_duration_min_s: 3.0,
            stall_duration_max_s: 15.0,
            drop_probability: 0.0,
            burst_drop_probability: 0.0,
            gps_drift_active: false,
            gps_accuracy_degraded: false,
            gps_jump_probability: 0.0,
        }
    }
}

impl MockModeConfig {
    pub fn from_scenario(scenario: MockScenario) -> Self {
        let mut config = Self { scenario, ..Self::default() };

        match scenario {
            MockScenario::Normal => {}

            MockScenario::SensorFailures => {
                config.sensor_failure_probability = 0.08;
                config.sensor_failure_duration = 25;
            }

            MockScenario::DataStalls => {
                config.stall_probability = 0.02;
                config.stall_duration_min_s = 5.0;
                config.stall_duration_max_s = 20.0;
            }

            MockScenario::Intermittent => {
                config.drop_probability = 0.05;
                config.burst_drop_probability = 0.02;
            }

            MockScenario::GpsIssues => {
                config.gps_drift_active = true;
                config.gps_accuracy_degraded = true;
                config.gps_jump_probability = 0.01;
            }

            MockScenario::Chaos => {
                // Every fault class at once, but each dialed down from its
                // dedicated scenario so the combined stream still delivers
                // at least 80% of its ticks.
                config.sensor_failure_probability = 0.04;
                config.sensor_failure_duration = 15;
                config.stall_probability = 0.005;
                config.stall_duration_min_s = 1.0;
                config.stall_duration_max_s = 3.0;
                config.drop_probability = 0.02;
                config.burst_drop_probability = 0.005;
                config.gps_drift_active = true;
                config.gps_jump_probability = 0.005;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_scenario_has_no_faults() {
        let c = MockModeConfig::from_scenario(MockScenario::Normal);
        assert_eq!(c.sensor_failure_probability, 0.0);
        assert_eq!(c.stall_probability, 0.0);
        assert_eq!(c.drop_probability, 0.0);
        assert!(!c.gps_drift_active);
    }

    #[test]
    fn chaos_enables_every_fault_class() {
        let c = MockModeConfig::from_scenario(MockScenario::Chaos);
        assert!(c.sensor_failure_probability > 0.0);
        assert!(c.stall_probability > 0.0);
        assert!(c.drop_probability > 0.0);
        assert!(c.burst_drop_probability > 0.0);
        assert!(c.gps_drift_active);
        assert!(c.gps_jump_probability > 0.0);
    }

    #[test]
    fn source_tags() {
        assert_eq!(MockScenario::Chaos.source_tag(), "MOCK_CHAOS");
        assert_eq!(MockScenario::SensorFailures.source_tag(), "MOCK_SENSOR_FAILURES");
    }
}
