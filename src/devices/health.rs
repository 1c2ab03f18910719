use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// `rate` is a percentage.
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= 95.0 {
            HealthStatus::Healthy
        } else if rate >= 80.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl SensorStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total as f64 * 100.0
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_success_rate(self.success_rate())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total_sensors: usize,
    pub total_reads: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub success_rate: f64,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub last_update: Option<DateTime<Utc>>,
}

/// Per-field read statistics for one equipment.
#[derive(Debug, Clone, Default)]
pub struct SensorHealth {
    sensors: BTreeMap<String, SensorStats>,
    total_reads: u64,
    successful_reads: u64,
    last_update: Option<DateTime<Utc>>,
}

impl SensorHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sensor_id: &str, success: bool) {
        let now = Utc::now();
        let stats = self.sensors.entry(sensor_id.to_string()).or_default();
        stats.total += 1;
        if success {
            stats.successful += 1;
            stats.last_success = Some(now);
            self.successful_reads += 1;
        } else {
            stats.failed += 1;
            stats.last_failure = Some(now);
        }
        self.total_reads += 1;
        self.last_update = Some(now);
    }

    pub fn sensor(&self, sensor_id: &str) -> Option<&SensorStats> {
        self.sensors.get(sensor_id)
    }

    pub fn summary(&self) -> HealthSummary {
        let count = |status: HealthStatus| self.sensors.values().filter(|s| s.status() == status).count();
        let success_rate = if self.total_reads == 0 {
            0.0
        } else {
            self.successful_reads as f64 / self.total_reads as f64 * 100.0
        };

        HealthSummary {
            total_sensors: self.sensors.len(),
            total_reads: self.total_reads,
            successful_reads: self.successful_reads,
            failed_reads: self.total_reads - self.successful_reads,
            success_rate: (success_rate * 100.0).round() / 100.0,
            healthy: count(HealthStatus::Healthy),
            degraded: count(HealthStatus::Degraded),
            unhealthy: count(HealthStatus::Unhealthy),
            last_update: self.last_update,
        }
    }

    /// Sensors below the healthy threshold, worst first.
    pub fn problem_sensors(&self) -> Vec<(&str, &SensorStats)> {
        let mut problems: Vec<(&str, &SensorStats)> = self
            .sensors
            .iter()
            .filter(|(_, stats)| stats.status() != HealthStatus::Healthy)
            .map(|(id, stats)| (id.as_str(), stats))
            .collect();
        problems.sort_by(|a, b| a.1.success_rate().total_cmp(&b.1.success_rate()));
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_thresholds() {
        assert_eq!(HealthStatus::from_success_rate(100.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_success_rate(95.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_success_rate(94.9), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_success_rate(80.0), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_success_rate(79.9), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_summary_counts() {
        let mut health = SensorHealth::new();
        for _ in 0..10 {
            health.record("voltage", true);
        }
        for i in 0..10 {
            health.record("current", i != 0); // 90%
        }
        for i in 0..10 {
            health.record("temperature", i % 2 == 0); // 50%
        }

        let summary = health.summary();
        assert_eq!(summary.total_sensors, 3);
        assert_eq!(summary.total_reads, 30);
        assert_eq!(summary.failed_reads, 6);
        assert_eq!(summary.success_rate, 80.0);
        assert_eq!((summary.healthy, summary.degraded, summary.unhealthy), (1, 1, 1));

        let problems: Vec<&str> = health.problem_sensors().into_iter().map(|(id, _)| id).collect();
        assert_eq!(problems, vec!["temperature", "current"]);
        assert_eq!(health.sensor("current").unwrap().failed, 1);
        assert!(health.sensor("missing").is_none());
    }
}
