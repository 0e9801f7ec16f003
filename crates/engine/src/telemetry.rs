//! Read-only access to metric and log stores.
//!
//! The engine never talks to a backend directly. Everything it observes goes
//! through [`Telemetry`], which lets the CLI plug in Prometheus and tests plug
//! in [`StaticTelemetry`].

use crate::models::{LogRecord, MetricSeries};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryRange {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl QueryRange {
    pub fn contains(&self, ts: DateTime<FixedOffset>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Metric signals addressed by entity (service or host name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    PodCpu,
    PodMemory,
    HostCpu,
    HostMemory,
    HostDisk,
    TcpOutResets,
    TcpSynRetrans,
    TcpRetransSegments,
    TcpInErrors,
    JvmGcDelta,
    /// Golden-signal series of a single pod, used to detect gaps.
    PodGolden,
}

impl Signal {
    pub const TCP_COUNTERS: [Signal; 4] = [
        Signal::TcpOutResets,
        Signal::TcpSynRetrans,
        Signal::TcpRetransSegments,
        Signal::TcpInErrors,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::PodCpu => "pod_cpu",
            Signal::PodMemory => "pod_memory",
            Signal::HostCpu => "host_cpu",
            Signal::HostMemory => "host_memory",
            Signal::HostDisk => "host_disk",
            Signal::TcpOutResets => "tcp_out_resets",
            Signal::TcpSynRetrans => "tcp_syn_retrans",
            Signal::TcpRetransSegments => "tcp_retrans_segments",
            Signal::TcpInErrors => "tcp_in_errors",
            Signal::JvmGcDelta => "jvm_gc_delta",
            Signal::PodGolden => "pod_golden",
        }
    }
}

/// Aggregated log/trace queries addressed by service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogQuery {
    /// Per-minute span duration of every span emitted by the service.
    SpanDuration,
    /// Per-minute duration of entry spans only.
    EntrySpanDuration,
    /// Per-minute error span counts.
    ErrorCount,
    /// Per-minute count of gRPC `14 UNAVAILABLE` error spans.
    GrpcUnavailable,
    /// Invocation counts grouped by host; `label` carries the hostname.
    HostInvocations,
}

impl LogQuery {
    pub fn as_str(self) -> &'static str {
        match self {
            LogQuery::SpanDuration => "span_duration",
            LogQuery::EntrySpanDuration => "entry_span_duration",
            LogQuery::ErrorCount => "error_count",
            LogQuery::GrpcUnavailable => "grpc_unavailable",
            LogQuery::HostInvocations => "host_invocations",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("unparseable response: {0}")]
    Parse(String),
    #[error("no template configured for {0}")]
    Unsupported(String),
    #[error("fixture error: {0}")]
    Fixture(String),
}

/// Backend returning raw observations for an entity over a range.
///
/// An empty series or record list means the backend had no data; errors mean
/// the backend could not be asked. Callers treat both as "no evidence".
#[async_trait]
pub trait Telemetry: Send + Sync {
    async fn fetch_series(
        &self,
        entity: &str,
        signal: Signal,
        range: QueryRange,
    ) -> Result<MetricSeries, TelemetryError>;

    async fn fetch_logs(
        &self,
        service: &str,
        query: LogQuery,
        range: QueryRange,
    ) -> Result<Vec<LogRecord>, TelemetryError>;
}

/// In-memory backend loaded from fixtures.
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetry {
    series: HashMap<(String, Signal), MetricSeries>,
    logs: HashMap<(String, LogQuery), Vec<LogRecord>>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
}

#[derive(Debug, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    series: Vec<SeriesFixture>,
    #[serde(default)]
    logs: Vec<LogFixture>,
}

#[derive(Debug, Deserialize)]
struct SeriesFixture {
    entity: String,
    signal: Signal,
    points: Vec<(DateTime<FixedOffset>, f64)>,
}

#[derive(Debug, Deserialize)]
struct LogFixture {
    service: String,
    query: LogQuery,
    records: Vec<LogRecord>,
}

impl StaticTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, TelemetryError> {
        let fixture: FixtureFile =
            serde_json::from_str(raw).map_err(|e| TelemetryError::Fixture(e.to_string()))?;

        let mut telemetry = Self::new();
        for entry in fixture.series {
            let (timestamps, values) = entry.points.into_iter().unzip();
            telemetry.insert_series(entry.entity, entry.signal, MetricSeries::new(timestamps, values));
        }
        for entry in fixture.logs {
            telemetry.insert_logs(entry.service, entry.query, entry.records);
        }
        Ok(telemetry)
    }

    pub fn from_path(path: &Path) -> Result<Self, TelemetryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TelemetryError::Fixture(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn insert_series(&mut self, entity: impl Into<String>, signal: Signal, series: MetricSeries) {
        self.series.insert((entity.into(), signal), series);
    }

    pub fn insert_logs(
        &mut self,
        service: impl Into<String>,
        query: LogQuery,
        records: Vec<LogRecord>,
    ) {
        self.logs.insert((service.into(), query), records);
    }

    /// Every query for `entity` fails with a request error.
    pub fn fail_entity(&mut self, entity: impl Into<String>) {
        self.failing.insert(entity.into());
    }

    /// Every query for `entity` sleeps for `delay` before answering.
    pub fn delay_entity(&mut self, entity: impl Into<String>, delay: Duration) {
        self.delays.insert(entity.into(), delay);
    }

    async fn gate(&self, entity: &str) -> Result<(), TelemetryError> {
        if let Some(delay) = self.delays.get(entity) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(entity) {
            return Err(TelemetryError::Request(format!("{entity} is unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl Telemetry for StaticTelemetry {
    async fn fetch_series(
        &self,
        entity: &str,
        signal: Signal,
        range: QueryRange,
    ) -> Result<MetricSeries, TelemetryError> {
        self.gate(entity).await?;
        let Some(series) = self.series.get(&(entity.to_owned(), signal)) else {
            return Ok(MetricSeries::default());
        };
        let (timestamps, values) = series
            .points()
            .filter(|(ts, _)| range.contains(*ts))
            .unzip();
        Ok(MetricSeries::new(timestamps, values))
    }

    async fn fetch_logs(
        &self,
        service: &str,
        query: LogQuery,
        range: QueryRange,
    ) -> Result<Vec<LogRecord>, TelemetryError> {
        self.gate(service).await?;
        Ok(self
            .logs
            .get(&(service.to_owned(), query))
            .map(|records| {
                records
                    .iter()
                    .filter(|record| range.contains(record.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "series": [
            {"entity": "cart", "signal": "pod_cpu", "points": [
                ["2025-09-16T10:00:00+08:00", 1.0],
                ["2025-09-16T10:01:00+08:00", 2.0],
                ["2025-09-16T11:00:00+08:00", 3.0]
            ]}
        ],
        "logs": [
            {"service": "cart", "query": "span_duration", "records": [
                {"timestamp": "2025-09-16T10:00:30+08:00", "value": 12.5}
            ]}
        ]
    }"#;

    fn range() -> QueryRange {
        QueryRange {
            start: DateTime::parse_from_rfc3339("2025-09-16T10:00:00+08:00").unwrap(),
            end: DateTime::parse_from_rfc3339("2025-09-16T10:30:00+08:00").unwrap(),
        }
    }

    #[tokio::test]
    async fn fixture_series_are_clipped_to_range() {
        let telemetry = StaticTelemetry::from_json_str(FIXTURE).unwrap();
        let range = range();

        let series = telemetry.fetch_series("cart", Signal::PodCpu, range).await;
        assert!(matches!(series, Ok(ref s) if s.values() == [1.0, 2.0]));

        let logs = telemetry.fetch_logs("cart", LogQuery::SpanDuration, range).await;
        assert!(matches!(logs, Ok(ref records) if records.len() == 1));
    }

    #[tokio::test]
    async fn unknown_entity_is_empty_not_error() {
        let telemetry = StaticTelemetry::new();
        let range = range();
        let series = telemetry.fetch_series("ghost", Signal::HostDisk, range).await;
        assert!(matches!(series, Ok(ref s) if s.is_empty()));
    }

    #[tokio::test]
    async fn failing_entity_returns_error() {
        let mut telemetry = StaticTelemetry::new();
        telemetry.fail_entity("cart");
        let range = range();
        let logs = telemetry.fetch_logs("cart", LogQuery::ErrorCount, range).await;
        assert!(matches!(logs, Err(TelemetryError::Request(_))));
    }

    #[test]
    fn rejects_malformed_fixture() {
        let result = StaticTelemetry::from_json_str("{\"series\": 3}");
        assert!(matches!(result, Err(TelemetryError::Fixture(_))));
    }
}
