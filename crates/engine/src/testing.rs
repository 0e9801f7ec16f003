//! Fixture builders shared by unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::{
    config::FaultlineConfig,
    models::{LogRecord, MetricSeries, TimeRange},
    probe::Prober,
    telemetry::StaticTelemetry,
};
use chrono::{DateTime, Duration, FixedOffset, TimeZone};
use std::sync::Arc;

/// Alarm start used by every fixture.
pub fn alarm_start() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(8 * 3600)
        .unwrap()
        .with_ymd_and_hms(2025, 9, 16, 10, 20, 0)
        .single()
        .unwrap()
}

/// Five-minute alarm.
pub fn alarm_range() -> TimeRange {
    let start = alarm_start();
    TimeRange::new(start, start + Duration::minutes(5)).unwrap()
}

/// Minute samples from ten minutes before the alarm to ten after it,
/// `high` inside the alarm and `base` elsewhere.
pub fn spike(base: f64, high: f64) -> MetricSeries {
    let start = alarm_start();
    let (stamps, values) = (-10..=15)
        .map(|m| {
            let value = if (1..=5).contains(&m) { high } else { base };
            (start + Duration::minutes(m), value)
        })
        .unzip();
    MetricSeries::new(stamps, values)
}

/// Same shape as [`spike`], as log records.
pub fn spike_records(base: f64, high: f64) -> Vec<LogRecord> {
    spike(base, high)
        .points()
        .map(|(timestamp, value)| LogRecord {
            timestamp,
            value,
            label: None,
        })
        .collect()
}

pub fn prober(telemetry: StaticTelemetry) -> Prober {
    Prober::new(
        Arc::new(telemetry),
        Arc::new(FaultlineConfig::default()),
        &alarm_range(),
    )
}
