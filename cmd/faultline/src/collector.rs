use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone};
use faultline_engine::{
    LogQuery, QueryRange, Signal, Telemetry, TelemetryError,
    models::{LogRecord, MetricSeries},
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const ENTITY_PLACEHOLDER: &str = "{entity}";

/// Labels tried, in order, for the host of an invocation series.
const HOST_LABELS: [&str; 3] = ["hostname", "host", "instance"];

/// PromQL templates with an `{entity}` placeholder. An empty template marks
/// the signal as unsupported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryTemplates {
    /// Resolution of `query_range` requests in seconds (default: 60)
    pub step_secs: u64,
    pub pod_cpu: String,
    pub pod_memory: String,
    pub host_cpu: String,
    pub host_memory: String,
    pub host_disk: String,
    pub tcp_out_resets: String,
    pub tcp_syn_retrans: String,
    pub tcp_retrans_segments: String,
    pub tcp_in_errors: String,
    pub jvm_gc_delta: String,
    pub pod_golden: String,
    pub span_duration: String,
    pub entry_span_duration: String,
    pub error_count: String,
    pub grpc_unavailable: String,
    pub host_invocations: String,
}

impl Default for QueryTemplates {
    fn default() -> Self {
        Self {
            step_secs: 60,
            pod_cpu: r#"avg(rate(container_cpu_usage_seconds_total{pod=~"{entity}-.*",container!=""}[1m])) * 100"#.to_owned(),
            pod_memory: r#"avg(container_memory_working_set_bytes{pod=~"{entity}-.*",container!=""} / container_spec_memory_limit_bytes{pod=~"{entity}-.*",container!=""}) * 100"#.to_owned(),
            host_cpu: r#"100 - avg(rate(node_cpu_seconds_total{mode="idle",hostname="{entity}"}[1m])) * 100"#.to_owned(),
            host_memory: r#"(1 - node_memory_MemAvailable_bytes{hostname="{entity}"} / node_memory_MemTotal_bytes{hostname="{entity}"}) * 100"#.to_owned(),
            host_disk: r#"max(1 - node_filesystem_avail_bytes{hostname="{entity}",fstype!="tmpfs"} / node_filesystem_size_bytes{hostname="{entity}",fstype!="tmpfs"}) * 100"#.to_owned(),
            tcp_out_resets: r#"sum(rate(node_netstat_Tcp_OutRsts{hostname="{entity}"}[1m]))"#.to_owned(),
            tcp_syn_retrans: r#"sum(rate(node_netstat_TcpExt_TCPSynRetrans{hostname="{entity}"}[1m]))"#.to_owned(),
            tcp_retrans_segments: r#"sum(rate(node_netstat_Tcp_RetransSegs{hostname="{entity}"}[1m]))"#.to_owned(),
            tcp_in_errors: r#"sum(rate(node_netstat_Tcp_InErrs{hostname="{entity}"}[1m]))"#.to_owned(),
            jvm_gc_delta: r#"sum(increase(jvm_gc_collection_seconds_count{service="{entity}"}[1m]))"#.to_owned(),
            pod_golden: r#"sum(rate(traces_spanmetrics_calls_total{host_name="{entity}"}[1m]))"#.to_owned(),
            span_duration: r#"sum(rate(traces_spanmetrics_latency_sum{service_name="{entity}"}[1m])) / sum(rate(traces_spanmetrics_latency_count{service_name="{entity}"}[1m]))"#.to_owned(),
            entry_span_duration: r#"sum(rate(traces_spanmetrics_latency_sum{service_name="{entity}",span_kind="SPAN_KIND_SERVER"}[1m])) / sum(rate(traces_spanmetrics_latency_count{service_name="{entity}",span_kind="SPAN_KIND_SERVER"}[1m]))"#.to_owned(),
            error_count: r#"sum(increase(traces_spanmetrics_calls_total{service_name="{entity}",status_code="STATUS_CODE_ERROR"}[1m]))"#.to_owned(),
            grpc_unavailable: r#"sum(increase(traces_spanmetrics_calls_total{service_name="{entity}",rpc_grpc_status_code="14"}[1m]))"#.to_owned(),
            host_invocations: r#"sum by (hostname) (increase(traces_spanmetrics_calls_total{service_name="{entity}"}[1m]))"#.to_owned(),
        }
    }
}

impl QueryTemplates {
    pub fn signal(&self, signal: Signal) -> &str {
        match signal {
            Signal::PodCpu => &self.pod_cpu,
            Signal::PodMemory => &self.pod_memory,
            Signal::HostCpu => &self.host_cpu,
            Signal::HostMemory => &self.host_memory,
            Signal::HostDisk => &self.host_disk,
            Signal::TcpOutResets => &self.tcp_out_resets,
            Signal::TcpSynRetrans => &self.tcp_syn_retrans,
            Signal::TcpRetransSegments => &self.tcp_retrans_segments,
            Signal::TcpInErrors => &self.tcp_in_errors,
            Signal::JvmGcDelta => &self.jvm_gc_delta,
            Signal::PodGolden => &self.pod_golden,
        }
    }

    pub fn log(&self, query: LogQuery) -> &str {
        match query {
            LogQuery::SpanDuration => &self.span_duration,
            LogQuery::EntrySpanDuration => &self.entry_span_duration,
            LogQuery::ErrorCount => &self.error_count,
            LogQuery::GrpcUnavailable => &self.grpc_unavailable,
            LogQuery::HostInvocations => &self.host_invocations,
        }
    }
}

/// Substitutes `entity` into `template`, or `None` for an empty template.
pub fn render(template: &str, entity: &str) -> Option<String> {
    if template.trim().is_empty() {
        return None;
    }
    Some(template.replace(ENTITY_PLACEHOLDER, entity))
}

/// [`Telemetry`] backed by the Prometheus HTTP API.
#[derive(Debug, Clone)]
pub struct PrometheusTelemetry {
    client: Client,
    base_url: String,
    queries: QueryTemplates,
}

impl PrometheusTelemetry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            queries: QueryTemplates::default(),
        }
    }

    pub fn with_queries(mut self, queries: QueryTemplates) -> Self {
        self.queries = queries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self, TelemetryError> {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Request(e.to_string()))?;
        Ok(self)
    }

    async fn query_range(
        &self,
        query: &str,
        range: QueryRange,
    ) -> Result<Vec<RangeSeries>, TelemetryError> {
        let url = format!("{}/api/v1/query_range", self.base_url.trim_end_matches('/'));
        let step = self.queries.step_secs.max(1).to_string();
        let start = range.start.timestamp().to_string();
        let end = range.end.timestamp().to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("query", query),
                ("start", start.as_str()),
                ("end", end.as_str()),
                ("step", step.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TelemetryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| TelemetryError::Request(e.to_string()))?;
        parse_matrix(&body, *range.start.offset())
    }
}

#[async_trait]
impl Telemetry for PrometheusTelemetry {
    async fn fetch_series(
        &self,
        entity: &str,
        signal: Signal,
        range: QueryRange,
    ) -> Result<MetricSeries, TelemetryError> {
        let query = render(self.queries.signal(signal), entity)
            .ok_or_else(|| TelemetryError::Unsupported(signal.as_str().to_owned()))?;
        let series = self.query_range(&query, range).await?;
        debug!(entity, signal = signal.as_str(), series = series.len(), "Fetched series");

        Ok(series
            .into_iter()
            .next()
            .map(|first| {
                let (timestamps, values) = first.points.into_iter().unzip();
                MetricSeries::new(timestamps, values)
            })
            .unwrap_or_default())
    }

    async fn fetch_logs(
        &self,
        service: &str,
        query: LogQuery,
        range: QueryRange,
    ) -> Result<Vec<LogRecord>, TelemetryError> {
        let promql = render(self.queries.log(query), service)
            .ok_or_else(|| TelemetryError::Unsupported(query.as_str().to_owned()))?;
        let series = self.query_range(&promql, range).await?;
        debug!(service, query = query.as_str(), series = series.len(), "Fetched logs");

        let mut records: Vec<LogRecord> = series
            .into_iter()
            .flat_map(|entry| {
                let label = entry.host;
                entry.points.into_iter().map(move |(timestamp, value)| LogRecord {
                    timestamp,
                    value,
                    label: label.clone(),
                })
            })
            .collect();
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }
}

/// One series of a `matrix` result, host label extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSeries {
    pub host: Option<String>,
    pub points: Vec<(DateTime<FixedOffset>, f64)>,
}

/// Parses a `query_range` response body. Samples that are not finite
/// numbers (`NaN`, `+Inf`) are dropped.
pub fn parse_matrix(body: &str, offset: FixedOffset) -> Result<Vec<RangeSeries>, TelemetryError> {
    let response: PrometheusResponse =
        serde_json::from_str(body).map_err(|e| TelemetryError::Parse(e.to_string()))?;

    if response.status != "success" {
        return Err(TelemetryError::Parse(format!(
            "prometheus returned status {}: {}",
            response.status,
            response.error.unwrap_or_default()
        )));
    }
    let data = response
        .data
        .ok_or_else(|| TelemetryError::Parse("response missing data".to_owned()))?;
    if data.result_type != "matrix" {
        return Err(TelemetryError::Parse(format!(
            "expected matrix result, got {}",
            data.result_type
        )));
    }

    data.result
        .into_iter()
        .map(|result| {
            let host = HOST_LABELS
                .iter()
                .find_map(|label| result.metric.get(*label))
                .and_then(|value| value.as_str())
                .map(str::to_owned);
            let points = result
                .values
                .into_iter()
                .map(|(ts, raw)| sample(ts, &raw, offset))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .collect();
            Ok(RangeSeries { host, points })
        })
        .collect()
}

fn sample(
    ts: f64,
    raw: &str,
    offset: FixedOffset,
) -> Result<Option<(DateTime<FixedOffset>, f64)>, TelemetryError> {
    let value: f64 = raw
        .parse()
        .map_err(|_| TelemetryError::Parse(format!("invalid sample value {raw:?}")))?;
    if !value.is_finite() {
        return Ok(None);
    }

    let secs = ts.trunc() as i64;
    let nanos = ((ts - ts.trunc()) * 1e9).round() as u32;
    let timestamp = offset
        .timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| TelemetryError::Parse(format!("invalid sample timestamp {ts}")))?;
    Ok(Some((timestamp, value)))
}

#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: Option<PrometheusData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    #[serde(default)]
    metric: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}
