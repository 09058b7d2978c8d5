//! Service metric readings: written by the synthetic-recovery fallback,
//! aggregated by the health endpoint.

use crate::storage::{encode_ts, ts_column, Pool, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    MemoryPercent,
    CpuPercent,
    ErrorRate,
    RequestLatencyMs,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::MemoryPercent => "memory_percent",
            MetricType::CpuPercent => "cpu_percent",
            MetricType::ErrorRate => "error_rate",
            MetricType::RequestLatencyMs => "request_latency_ms",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricType::MemoryPercent | MetricType::CpuPercent => "percent",
            MetricType::ErrorRate => "errors/min",
            MetricType::RequestLatencyMs => "ms",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub service: String,
    pub region: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Stored reading, as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMetric {
    pub service: String,
    pub region: String,
    pub metric_type: String,
    pub value: f64,
    pub unit: String,
    pub recorded_at: DateTime<Utc>,
}

/// Averages per service over a recent window.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub error_rate: Option<f64>,
    pub latency_ms: Option<f64>,
}

pub fn insert_points(conn: &Connection, points: &[MetricPoint]) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO metrics (service, region, metric_type, value, unit, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for p in points {
        stmt.execute(params![
            p.service,
            p.region,
            p.metric_type.as_str(),
            p.value,
            p.metric_type.unit(),
            encode_ts(p.recorded_at),
        ])?;
    }
    Ok(points.len())
}

pub fn for_service(pool: &Pool, service: &str) -> Result<Vec<StoredMetric>, StoreError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT service, region, metric_type, value, unit, recorded_at FROM metrics
         WHERE service = ?1 ORDER BY recorded_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![service], |row| {
        Ok(StoredMetric {
            service: row.get(0)?,
            region: row.get(1)?,
            metric_type: row.get(2)?,
            value: row.get(3)?,
            unit: row.get(4)?,
            recorded_at: ts_column(row, 5)?,
        })
    })?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Average readings per service recorded at or after `since`.
pub fn service_health(pool: &Pool, since: DateTime<Utc>) -> Result<Vec<ServiceHealth>, StoreError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT service,
                AVG(CASE WHEN metric_type = 'cpu_percent' THEN value END),
                AVG(CASE WHEN metric_type = 'memory_percent' THEN value END),
                AVG(CASE WHEN metric_type = 'error_rate' THEN value END),
                AVG(CASE WHEN metric_type = 'request_latency_ms' THEN value END)
         FROM metrics WHERE recorded_at >= ?1
         GROUP BY service ORDER BY service",
    )?;
    let rows = stmt.query_map(params![encode_ts(since)], |row| {
        Ok(ServiceHealth {
            service: row.get(0)?,
            cpu_percent: row.get::<_, Option<f64>>(1)?.map(round2),
            memory_percent: row.get::<_, Option<f64>>(2)?.map(round2),
            error_rate: row.get::<_, Option<f64>>(3)?.map(round2),
            latency_ms: row.get::<_, Option<f64>>(4)?.map(round2),
        })
    })?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
