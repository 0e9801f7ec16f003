use crate::{models::MetricSeries, models::TimeRange, telemetry::QueryRange};
use chrono::{DateTime, Duration, FixedOffset};

/// Observations of one series split around the alarm interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentedSeries {
    pub pre: Vec<f64>,
    pub target: Vec<f64>,
    pub post: Vec<f64>,
}

/// Query span plus the two boundaries that split it into pre/target/post.
///
/// A point at `ts` falls into `pre` when `ts <= pre_boundary`, into `target`
/// when `ts <= target_boundary`, and into `post` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub query_start: DateTime<FixedOffset>,
    pub pre_boundary: DateTime<FixedOffset>,
    pub target_boundary: DateTime<FixedOffset>,
    pub query_end: DateTime<FixedOffset>,
}

impl AnalysisWindow {
    pub fn from_range(range: &TimeRange, lead: Duration, tail: Duration) -> Self {
        Self {
            query_start: range.start - lead,
            pre_boundary: range.start,
            target_boundary: range.end,
            query_end: range.end + tail,
        }
    }

    /// Moves both boundaries outward by `margin`, widening the target bucket.
    ///
    /// Log aggregates are bucketed by minute, so the alarm edges are blurred
    /// by one bucket on either side.
    pub fn widened(&self, margin: Duration) -> Self {
        Self {
            pre_boundary: self.pre_boundary - margin,
            target_boundary: self.target_boundary + margin,
            ..*self
        }
    }

    pub fn query_range(&self) -> QueryRange {
        QueryRange {
            start: self.query_start,
            end: self.query_end,
        }
    }

    pub fn target_minutes(&self) -> f64 {
        (self.target_boundary - self.pre_boundary).num_seconds() as f64 / 60.0
    }

    pub fn span_minutes(&self) -> i64 {
        (self.query_end - self.query_start).num_minutes()
    }

    pub fn segment(&self, series: &MetricSeries) -> SegmentedSeries {
        split(series, self.pre_boundary, self.target_boundary)
    }
}

pub fn split(
    series: &MetricSeries,
    pre_boundary: DateTime<FixedOffset>,
    target_boundary: DateTime<FixedOffset>,
) -> SegmentedSeries {
    let mut segments = SegmentedSeries::default();
    for (ts, value) in series.points() {
        if ts <= pre_boundary {
            segments.pre.push(value);
        } else if ts <= target_boundary {
            segments.target.push(value);
        } else {
            segments.post.push(value);
        }
    }
    segments
}
