//! Threshold alerting with hysteresis.
//!
//! Each monitored metric runs through the same three-state machine. An
//! alert is emitted on the transition into or out of an out-of-range
//! condition, never repeated while the condition persists. All state is
//! process-local and resets to `Normal` on restart, so a reading that is
//! already out of range right after startup still alerts.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::Reading;

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Alert bounds for the three monitored metrics, loaded once at startup.
pub struct Thresholds {
    /// Lower temperature bound in degrees celsius.
    pub temp_min: f64,
    /// Upper temperature bound in degrees celsius.
    pub temp_max: f64,
    /// Lower pressure bound in hPa.
    pub press_min: f64,
    /// Upper pressure bound in hPa.
    pub press_max: f64,
    /// Lower relative humidity bound in percent.
    pub hum_min: i64,
    /// Upper relative humidity bound in percent.
    pub hum_max: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The metric an alert refers to.
pub enum Metric {
    Temperature,
    Pressure,
    Humidity,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Temperature => write!(f, "temperature"),
            Metric::Pressure => write!(f, "pressure"),
            Metric::Humidity => write!(f, "humidity"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which edge of the state machine was crossed.
pub enum Direction {
    /// The value dropped below the lower bound.
    Low,
    /// The value rose above the upper bound.
    High,
    /// The value returned inside the bounds.
    Normal,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Low => write!(f, "LOW"),
            Direction::High => write!(f, "HIGH"),
            Direction::Normal => write!(f, "NORMAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A single edge-triggered alert, handed to the log sink.
pub struct AlertEvent {
    pub metric: Metric,
    pub direction: Direction,
    /// The reading value that caused the transition.
    pub value: f64,
    /// The bound that was crossed. For a return to normal this is the
    /// bound of the range that was previously violated.
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricState {
    Normal,
    LowActive,
    HighActive,
}

/// Stateful hysteresis evaluator over all three metrics.
///
/// Owned by the pipeline thread; mutated only from there.
pub struct AlertEngine {
    thresholds: Thresholds,
    temperature: MetricState,
    pressure: MetricState,
    humidity: MetricState,
}

impl AlertEngine {
    pub fn new(thresholds: Thresholds) -> AlertEngine {
        AlertEngine {
            thresholds,
            temperature: MetricState::Normal,
            pressure: MetricState::Normal,
            humidity: MetricState::Normal,
        }
    }

    /// Runs one reading through all three state machines and returns the
    /// alerts for every metric that changed state. Metrics are evaluated
    /// independently; a reading can transition several at once.
    pub fn evaluate(&mut self, reading: &Reading) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        let thresholds = self.thresholds.clone();
        Self::transition(
            &mut self.temperature,
            Metric::Temperature,
            reading.temperature,
            thresholds.temp_min,
            thresholds.temp_max,
            reading.timestamp,
            &mut events,
        );
        Self::transition(
            &mut self.pressure,
            Metric::Pressure,
            reading.pressure,
            thresholds.press_min,
            thresholds.press_max,
            reading.timestamp,
            &mut events,
        );
        Self::transition(
            &mut self.humidity,
            Metric::Humidity,
            reading.humidity,
            thresholds.hum_min as f64,
            thresholds.hum_max as f64,
            reading.timestamp,
            &mut events,
        );

        events
    }

    fn transition(
        state: &mut MetricState,
        metric: Metric,
        value: f64,
        min: f64,
        max: f64,
        timestamp: DateTime<Utc>,
        events: &mut Vec<AlertEvent>,
    ) {
        let (next, direction, threshold) = if value < min {
            (MetricState::LowActive, Direction::Low, min)
        } else if value > max {
            (MetricState::HighActive, Direction::High, max)
        } else {
            // Report the bound we are coming back from so the log line
            // reads "returned to normal from below min / above max".
            let threshold = match *state {
                MetricState::HighActive => max,
                _ => min,
            };
            (MetricState::Normal, Direction::Normal, threshold)
        };

        if next == *state {
            return;
        }

        *state = next;
        events.push(AlertEvent {
            metric,
            direction,
            value,
            threshold,
            timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn thresholds() -> Thresholds {
        Thresholds {
            temp_min: 10.0,
            temp_max: 30.0,
            press_min: 950.0,
            press_max: 1050.0,
            hum_min: 30,
            hum_max: 70,
        }
    }

    fn reading(temperature: f64, pressure: f64, humidity: f64) -> Reading {
        Reading {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            device_id: None,
            temperature,
            pressure,
            humidity,
            luminosity: None,
        }
    }

    #[test]
    fn repeated_out_of_range_readings_alert_once() {
        let mut engine = AlertEngine::new(thresholds());

        let mut log = Vec::new();
        for temperature in [5.0, 5.0, 35.0, 35.0, 20.0] {
            for event in engine.evaluate(&reading(temperature, 1000.0, 50.0)) {
                log.push(event.direction);
            }
        }

        assert_eq!(log, vec![Direction::Low, Direction::High, Direction::Normal]);
    }

    #[test]
    fn first_reading_after_start_can_alert() {
        let mut engine = AlertEngine::new(thresholds());

        let events = engine.evaluate(&reading(5.0, 1000.0, 50.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metric, Metric::Temperature);
        assert_eq!(events[0].direction, Direction::Low);
        assert_eq!(events[0].value, 5.0);
        assert_eq!(events[0].threshold, 10.0);
    }

    #[test]
    fn in_range_first_reading_is_silent() {
        let mut engine = AlertEngine::new(thresholds());
        assert!(engine.evaluate(&reading(20.0, 1000.0, 50.0)).is_empty());
    }

    #[test]
    fn metrics_transition_independently() {
        let mut engine = AlertEngine::new(thresholds());

        let events = engine.evaluate(&reading(5.0, 1100.0, 50.0));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].metric, Metric::Temperature);
        assert_eq!(events[0].direction, Direction::Low);
        assert_eq!(events[1].metric, Metric::Pressure);
        assert_eq!(events[1].direction, Direction::High);

        // Temperature recovers while pressure stays high: one event only.
        let events = engine.evaluate(&reading(20.0, 1100.0, 50.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metric, Metric::Temperature);
        assert_eq!(events[0].direction, Direction::Normal);
    }

    #[test]
    fn low_to_high_crossing_skips_normal() {
        let mut engine = AlertEngine::new(thresholds());

        engine.evaluate(&reading(20.0, 1000.0, 20.0));
        let events = engine.evaluate(&reading(20.0, 1000.0, 90.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metric, Metric::Humidity);
        assert_eq!(events[0].direction, Direction::High);
        assert_eq!(events[0].threshold, 70.0);
    }

    #[test]
    fn boundary_values_count_as_in_range() {
        let mut engine = AlertEngine::new(thresholds());
        assert!(engine.evaluate(&reading(10.0, 950.0, 70.0)).is_empty());
        assert!(engine.evaluate(&reading(30.0, 1050.0, 30.0)).is_empty());
    }
}
