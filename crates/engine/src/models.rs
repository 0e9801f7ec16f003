use crate::error::EngineError;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const RANGE_SEPARATOR: &str = "~";

/// One alarm to localize, as read from a JSONL input line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub problem_id: String,
    pub time_range: String,
    #[serde(default)]
    pub candidate_root_causes: Vec<String>,
    #[serde(default)]
    pub alarm_rules: Vec<String>,
}

impl Problem {
    /// The first alarm rule drives the investigation plan.
    pub fn alarm_rule(&self) -> Result<AlarmRule, EngineError> {
        let raw = self
            .alarm_rules
            .first()
            .ok_or_else(|| EngineError::UnknownAlarmRule("<none>".to_owned()))?;
        raw.parse()
    }

    pub fn parse_time_range(&self, offset: FixedOffset) -> Result<TimeRange, EngineError> {
        TimeRange::parse(&self.time_range, offset)
    }

    /// Distinct services named by `<service>.cpu` keys, in first-seen order.
    /// Malformed keys and other categories are skipped.
    pub fn candidate_services(&self) -> Vec<String> {
        let mut services: Vec<String> = Vec::new();
        for raw in &self.candidate_root_causes {
            let Ok(key) = raw.parse::<CandidateKey>() else {
                continue;
            };
            if key.category == Category::Cpu && !services.contains(&key.service) {
                services.push(key.service);
            }
        }
        services
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmRule {
    #[serde(rename = "frontend_avg_rt")]
    FrontendAvgRt,
    #[serde(rename = "service_avg_rt")]
    ServiceAvgRt,
    #[serde(rename = "greyFailure")]
    GreyFailure,
    #[serde(rename = "overall_error_count")]
    OverallErrorCount,
}

impl AlarmRule {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmRule::FrontendAvgRt => "frontend_avg_rt",
            AlarmRule::ServiceAvgRt => "service_avg_rt",
            AlarmRule::GreyFailure => "greyFailure",
            AlarmRule::OverallErrorCount => "overall_error_count",
        }
    }

    pub fn is_latency(self) -> bool {
        matches!(self, AlarmRule::FrontendAvgRt | AlarmRule::ServiceAvgRt)
    }
}

impl FromStr for AlarmRule {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "frontend_avg_rt" => Ok(AlarmRule::FrontendAvgRt),
            "service_avg_rt" => Ok(AlarmRule::ServiceAvgRt),
            "greyFailure" => Ok(AlarmRule::GreyFailure),
            "overall_error_count" => Ok(AlarmRule::OverallErrorCount),
            other => Err(EngineError::UnknownAlarmRule(other.to_owned())),
        }
    }
}

impl fmt::Display for AlarmRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open alarm interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl TimeRange {
    pub fn new(
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<Self, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidTimeRange {
                raw: format!("{start} ~ {end}"),
                reason: "start must precede end".to_owned(),
            });
        }
        Ok(Self { start, end })
    }

    /// Parses `"YYYY-MM-DD HH:MM:SS ~ YYYY-MM-DD HH:MM:SS"` in the given offset.
    pub fn parse(raw: &str, offset: FixedOffset) -> Result<Self, EngineError> {
        let invalid = |reason: &str| EngineError::InvalidTimeRange {
            raw: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let (start_raw, end_raw) = raw
            .split_once(RANGE_SEPARATOR)
            .ok_or_else(|| invalid("missing '~' separator"))?;

        let start = parse_local(start_raw.trim(), offset).ok_or_else(|| invalid("bad start"))?;
        let end = parse_local(end_raw.trim(), offset).ok_or_else(|| invalid("bad end"))?;

        Self::new(start, end)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

fn parse_local(raw: &str, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let naive = NaiveDateTime::parse_from_str(raw, TIME_FORMAT).ok()?;
    offset.from_local_datetime(&naive).single()
}

/// Failure categories, in the order the arbiter visits candidate lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "cpu")]
    Cpu,
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "networkLatency")]
    NetworkLatency,
    #[serde(rename = "jvmChaos")]
    JvmChaos,
    #[serde(rename = "disk")]
    Disk,
    #[serde(rename = "networkLoss")]
    NetworkLoss,
    #[serde(rename = "podKiller")]
    PodKiller,
    #[serde(rename = "Failure")]
    Failure,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Cpu,
        Category::Memory,
        Category::NetworkLatency,
        Category::JvmChaos,
        Category::Disk,
        Category::NetworkLoss,
        Category::PodKiller,
        Category::Failure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Cpu => "cpu",
            Category::Memory => "memory",
            Category::NetworkLatency => "networkLatency",
            Category::JvmChaos => "jvmChaos",
            Category::Disk => "disk",
            Category::NetworkLoss => "networkLoss",
            Category::PodKiller => "podKiller",
            Category::Failure => "Failure",
        }
    }
}

impl FromStr for Category {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == raw)
            .ok_or_else(|| EngineError::MalformedCandidateKey(raw.to_owned()))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `"<service>.<category>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandidateKey {
    pub service: String,
    pub category: Category,
}

impl CandidateKey {
    pub fn new(service: impl Into<String>, category: Category) -> Self {
        Self {
            service: service.into(),
            category,
        }
    }
}

impl FromStr for CandidateKey {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.split('.');
        let (Some(service), Some(category), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(EngineError::MalformedCandidateKey(raw.to_owned()));
        };
        if service.is_empty() {
            return Err(EngineError::MalformedCandidateKey(raw.to_owned()));
        }
        let category = category
            .parse::<Category>()
            .map_err(|_| EngineError::MalformedCandidateKey(raw.to_owned()))?;
        Ok(Self::new(service, category))
    }
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.category)
    }
}

impl Serialize for CandidateKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CandidateKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A fetched time series. Timestamps are monotonic but not necessarily evenly spaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    timestamps: Vec<DateTime<FixedOffset>>,
    values: Vec<f64>,
}

impl MetricSeries {
    /// Extra trailing entries on the longer side are dropped.
    pub fn new(mut timestamps: Vec<DateTime<FixedOffset>>, mut values: Vec<f64>) -> Self {
        let len = timestamps.len().min(values.len());
        timestamps.truncate(len);
        values.truncate(len);
        Self { timestamps, values }
    }

    pub fn from_records(records: &[LogRecord]) -> Self {
        let mut sorted: Vec<&LogRecord> = records.iter().collect();
        sorted.sort_by_key(|record| record.timestamp);
        Self::new(
            sorted.iter().map(|record| record.timestamp).collect(),
            sorted.iter().map(|record| record.value).collect(),
        )
    }

    pub fn timestamps(&self) -> &[DateTime<FixedOffset>] {
        &self.timestamps
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn points(&self) -> impl Iterator<Item = (DateTime<FixedOffset>, f64)> + '_ {
        self.timestamps.iter().copied().zip(self.values.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One aggregated row from a log/trace store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub value: f64,
    #[serde(default)]
    pub label: Option<String>,
}

/// Final verdict for one problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub problem_id: String,
    pub root_causes: Vec<CandidateKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "evidences")]
    pub evidence: Vec<String>,
}

impl Diagnosis {
    pub fn empty(problem_id: impl Into<String>) -> Self {
        Self {
            problem_id: problem_id.into(),
            root_causes: Vec::new(),
            evidence: Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn beijing() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[test]
    fn parses_candidate_keys() {
        let key = "checkout.networkLatency".parse::<CandidateKey>();
        assert!(matches!(
            key,
            Ok(CandidateKey { ref service, category: Category::NetworkLatency }) if service == "checkout"
        ));
    }

    #[test]
    fn rejects_keys_without_exactly_one_separator() {
        assert!("checkout".parse::<CandidateKey>().is_err());
        assert!("a.b.cpu".parse::<CandidateKey>().is_err());
        assert!(".cpu".parse::<CandidateKey>().is_err());
        assert!("checkout.gpu".parse::<CandidateKey>().is_err());
    }

    #[test]
    fn candidate_key_display_round_trips_failure_category() {
        let key = CandidateKey::new("ad", Category::Failure);
        assert_eq!(key.to_string(), "ad.Failure");
    }

    #[test]
    fn parses_time_range_in_offset() {
        let offset = beijing();
        let range =
            TimeRange::parse("2025-09-16 23:03:22 ~ 2025-09-16 23:08:22", offset).unwrap();
        assert_eq!(range.duration(), chrono::Duration::minutes(5));
        assert_eq!(range.start.offset().local_minus_utc(), 8 * 3600);
    }

    #[test]
    fn rejects_inverted_time_range() {
        let offset = beijing();
        let range = TimeRange::parse("2025-09-16 23:08:22 ~ 2025-09-16 23:03:22", offset);
        assert!(matches!(range, Err(EngineError::InvalidTimeRange { .. })));
    }

    #[test]
    fn candidate_services_come_from_cpu_keys_only() {
        let problem = Problem {
            problem_id: "001".to_owned(),
            time_range: String::new(),
            candidate_root_causes: vec![
                "cart.cpu".to_owned(),
                "cart.memory".to_owned(),
                "broken".to_owned(),
                "payment.memory".to_owned(),
                "ad.cpu".to_owned(),
            ],
            alarm_rules: vec!["greyFailure".to_owned()],
        };
        assert_eq!(problem.candidate_services(), vec!["cart", "ad"]);
        assert_eq!(problem.alarm_rule().unwrap(), AlarmRule::GreyFailure);
    }

    #[test]
    fn series_constructor_truncates_to_shorter_side() {
        let offset = beijing();
        let ts = offset.with_ymd_and_hms(2025, 9, 16, 0, 0, 0).single().unwrap();
        let series = MetricSeries::new(vec![ts], vec![1.0, 2.0]);
        assert_eq!(series.len(), 1);
    }
}
