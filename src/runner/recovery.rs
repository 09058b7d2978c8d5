//! Synthetic recovery: when the control plane cannot act, write the metric
//! trajectory a successful remediation of that kind would produce.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::metrics::{self, MetricPoint, MetricType};
use crate::queue::ActionKind;
use crate::storage::{Pool, StoreError};

/// Per-minute readings for one action kind, eight points each.
struct Profile {
    memory_percent: [f64; 8],
    error_rate: [f64; 8],
    latency_ms: [f64; 8],
    cpu_percent: [f64; 8],
}

const ROLLBACK: Profile = Profile {
    memory_percent: [88.0, 82.0, 74.0, 66.0, 58.0, 52.0, 48.0, 45.0],
    error_rate: [18.0, 12.0, 6.0, 2.0, 1.0, 0.4, 0.3, 0.2],
    latency_ms: [980.0, 820.0, 650.0, 480.0, 320.0, 220.0, 165.0, 150.0],
    cpu_percent: [82.0, 76.0, 68.0, 60.0, 54.0, 50.0, 48.0, 47.0],
};

const RESTART: Profile = Profile {
    memory_percent: [85.0, 78.0, 65.0, 55.0, 50.0, 47.0, 45.0, 44.0],
    error_rate: [22.0, 15.0, 4.0, 1.0, 0.5, 0.3, 0.2, 0.2],
    latency_ms: [950.0, 700.0, 450.0, 280.0, 200.0, 165.0, 152.0, 148.0],
    cpu_percent: [79.0, 70.0, 62.0, 55.0, 50.0, 48.0, 47.0, 46.0],
};

const SCALE_CACHE: Profile = Profile {
    memory_percent: [72.0, 68.0, 64.0, 60.0, 57.0, 55.0, 53.0, 52.0],
    error_rate: [5.0, 3.5, 2.0, 1.2, 0.8, 0.5, 0.3, 0.2],
    latency_ms: [1100.0, 850.0, 600.0, 380.0, 250.0, 190.0, 162.0, 150.0],
    cpu_percent: [75.0, 70.0, 65.0, 60.0, 56.0, 53.0, 51.0, 49.0],
};

const RESTART_DEPENDENCY: Profile = Profile {
    memory_percent: [70.0, 65.0, 60.0, 56.0, 53.0, 51.0, 50.0, 49.0],
    error_rate: [28.0, 18.0, 8.0, 3.0, 1.0, 0.5, 0.3, 0.2],
    latency_ms: [1200.0, 900.0, 650.0, 400.0, 250.0, 180.0, 155.0, 148.0],
    cpu_percent: [80.0, 72.0, 64.0, 57.0, 52.0, 50.0, 48.0, 47.0],
};

fn profile(kind: ActionKind) -> &'static Profile {
    match kind {
        ActionKind::RollbackDeployment => &ROLLBACK,
        ActionKind::RestartService => &RESTART,
        ActionKind::ScaleCache => &SCALE_CACHE,
        ActionKind::RestartDependency => &RESTART_DEPENDENCY,
    }
}

#[derive(Clone)]
pub struct RecoveryWriter {
    pool: Pool,
    regions: HashMap<String, String>,
    default_region: String,
}

impl RecoveryWriter {
    pub fn new(pool: Pool, regions: HashMap<String, String>, default_region: String) -> Self {
        Self { pool, regions, default_region }
    }

    pub fn region_for(&self, service: &str) -> &str {
        self.regions
            .get(service)
            .map(String::as_str)
            .unwrap_or(&self.default_region)
    }

    /// Points for `kind`, one per minute starting at `start`.
    pub fn points(&self, service: &str, kind: ActionKind, start: DateTime<Utc>) -> Vec<MetricPoint> {
        let p = profile(kind);
        let region = self.region_for(service);
        let mut points = Vec::with_capacity(32);

        for i in 0..8 {
            let recorded_at = start + Duration::minutes(i as i64);
            for (metric_type, value) in [
                (MetricType::MemoryPercent, p.memory_percent[i]),
                (MetricType::CpuPercent, p.cpu_percent[i]),
                (MetricType::ErrorRate, p.error_rate[i]),
                (MetricType::RequestLatencyMs, p.latency_ms[i]),
            ] {
                points.push(MetricPoint {
                    service: service.to_string(),
                    region: region.to_string(),
                    metric_type,
                    value,
                    recorded_at,
                });
            }
        }
        points
    }

    /// Write the recovery trajectory in one transaction; returns the number
    /// of points written.
    pub fn write(&self, service: &str, kind: ActionKind) -> Result<usize, StoreError> {
        let points = self.points(service, kind, Utc::now());
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let n = metrics::insert_points(&tx, &points)?;
        tx.commit()?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    fn writer(pool: Pool) -> RecoveryWriter {
        let regions = [("auth-service".to_string(), "us-west-2".to_string())]
            .into_iter()
            .collect();
        RecoveryWriter::new(pool, regions, "us-east-1".to_string())
    }

    #[test]
    fn test_points_follow_profile() {
        let (_dir, pool) = test_pool();
        let w = writer(pool);
        let start = Utc::now();
        let points = w.points("auth-service", ActionKind::ScaleCache, start);

        assert_eq!(points.len(), 32);
        assert!(points.iter().all(|p| p.region == "us-west-2"));
        let latency: Vec<f64> = points
            .iter()
            .filter(|p| p.metric_type == MetricType::RequestLatencyMs)
            .map(|p| p.value)
            .collect();
        assert_eq!(latency.first(), Some(&1100.0));
        assert_eq!(latency.last(), Some(&150.0));
        assert_eq!(points[31].recorded_at, start + Duration::minutes(7));
    }

    #[test]
    fn test_every_profile_ends_healthy() {
        for kind in ActionKind::ALL {
            let p = profile(kind);
            assert!(p.memory_percent[7] < 65.0, "{}", kind);
            assert!(p.error_rate[7] < 2.5, "{}", kind);
            assert!(p.latency_ms[7] < 250.0, "{}", kind);
        }
    }

    #[test]
    fn test_write_persists_points() {
        let (_dir, pool) = test_pool();
        let w = writer(pool.clone());
        assert_eq!(w.write("payment-service", ActionKind::RestartService).unwrap(), 32);
        let stored = metrics::for_service(&pool, "payment-service").unwrap();
        assert_eq!(stored.len(), 32);
        assert!(stored.iter().all(|m| m.region == "us-east-1"));
    }
}
