//! Per-service signal probes.
//!
//! Every probe fetches one signal over the analysis window and classifies it.
//! Missing data, fetch errors and timeouts all degrade to
//! [`ProbeOutcome::NoData`]; a probe never fails the investigation.

use crate::{
    candidates::Candidate,
    classifier::{
        AnomalyVerdict, ClassifierProfile, Direction, Statistic, StatisticRule, classify,
        classify_rate, classify_statistic,
    },
    config::{FaultlineConfig, ProbeConfig, ProbeKind},
    models::{AlarmRule, Category, LogRecord, MetricSeries, TimeRange},
    telemetry::{LogQuery, Signal, Telemetry},
    window::AnalysisWindow,
};
use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinSet, time};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Median latency statistic.
    Strict,
    /// Mean latency statistic, used when a strict round finds nothing.
    Relaxed,
}

impl ProbeMode {
    pub fn statistic(self) -> Statistic {
        match self {
            ProbeMode::Strict => Statistic::Median,
            ProbeMode::Relaxed => Statistic::Mean,
        }
    }
}

/// Which probes a round runs on each service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSet {
    pub cpu: bool,
    pub memory: bool,
    pub latency: bool,
    pub errors: bool,
    /// Host utilization, disk and TCP counters instead of pod signals.
    pub host: bool,
}

impl SignalSet {
    pub const LATENCY_ALARM: Self = Self {
        cpu: true,
        memory: true,
        latency: true,
        errors: false,
        host: false,
    };
    pub const POD_UTILIZATION: Self = Self {
        cpu: true,
        memory: true,
        latency: false,
        errors: false,
        host: false,
    };
    pub const LATENCY_ONLY: Self = Self {
        cpu: false,
        memory: false,
        latency: true,
        errors: false,
        host: false,
    };
    pub const ERRORS: Self = Self {
        cpu: false,
        memory: false,
        latency: false,
        errors: true,
        host: false,
    };
    pub const HOST: Self = Self {
        cpu: false,
        memory: false,
        latency: false,
        errors: false,
        host: true,
    };
}

/// Magnitudes a reading must exceed before it becomes a candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Floors {
    pub cpu: f64,
    pub memory: f64,
    pub host: f64,
    pub error_rate: f64,
    pub network_loss_signals: usize,
}

impl Floors {
    pub fn for_rule(rule: AlarmRule, probe: &ProbeConfig) -> Self {
        let memory = match rule {
            AlarmRule::GreyFailure => probe.grey_memory_floor,
            _ => probe.memory_floor,
        };
        Self {
            cpu: probe.cpu_floor,
            memory,
            host: probe.host_floor,
            error_rate: probe.error_rate_floor,
            network_loss_signals: probe.network_loss_min_signals,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub verdict: AnomalyVerdict,
    pub series: MetricSeries,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Verdict(Reading),
    NoData,
}

impl ProbeOutcome {
    pub fn is_anomalous(&self) -> bool {
        self.verdict().is_some_and(|verdict| verdict.is_anomalous)
    }

    pub fn verdict(&self) -> Option<AnomalyVerdict> {
        self.reading().map(|reading| reading.verdict)
    }

    pub fn reading(&self) -> Option<&Reading> {
        match self {
            ProbeOutcome::Verdict(reading) => Some(reading),
            ProbeOutcome::NoData => None,
        }
    }

    fn into_reading(self) -> Option<Reading> {
        match self {
            ProbeOutcome::Verdict(reading) => Some(reading),
            ProbeOutcome::NoData => None,
        }
    }
}

/// A candidate proposed by a probe, with the sentence explaining it.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub candidate: Candidate,
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReport {
    pub service: String,
    pub findings: Vec<Finding>,
}

impl ServiceReport {
    pub fn empty(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            findings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodKillSummary {
    pub hosts: usize,
    pub killed: usize,
}

/// Runs probes for one problem. Cheap to clone; clones share the limiter.
#[derive(Clone)]
pub struct Prober {
    telemetry: Arc<dyn Telemetry>,
    config: Arc<FaultlineConfig>,
    window: AnalysisWindow,
    log_window: AnalysisWindow,
    limiter: Arc<Semaphore>,
}

impl Prober {
    pub fn new(telemetry: Arc<dyn Telemetry>, config: Arc<FaultlineConfig>, range: &TimeRange) -> Self {
        let window = AnalysisWindow::from_range(range, config.window.lead(), config.window.tail());
        let log_window = window.widened(config.window.log_margin());
        let limiter = Arc::new(Semaphore::new(config.probe.max_parallel_probes.max(1)));
        Self {
            telemetry,
            config,
            window,
            log_window,
            limiter,
        }
    }

    pub fn config(&self) -> &FaultlineConfig {
        &self.config
    }

    pub fn window(&self) -> &AnalysisWindow {
        &self.window
    }

    async fn series(&self, entity: &str, signal: Signal) -> Option<MetricSeries> {
        let range = self.window.query_range();
        match self.telemetry.fetch_series(entity, signal, range).await {
            Ok(series) if !series.is_empty() => Some(series),
            Ok(_) => {
                debug!(entity, signal = signal.as_str(), "no data");
                None
            }
            Err(error) => {
                warn!(entity, signal = signal.as_str(), %error, "Telemetry fetch failed");
                None
            }
        }
    }

    async fn records(&self, service: &str, query: LogQuery) -> Option<Vec<LogRecord>> {
        let range = self.window.query_range();
        match self.telemetry.fetch_logs(service, query, range).await {
            Ok(records) if !records.is_empty() => Some(records),
            Ok(_) => {
                debug!(service, query = query.as_str(), "no data");
                None
            }
            Err(error) => {
                warn!(service, query = query.as_str(), %error, "Log fetch failed");
                None
            }
        }
    }

    async fn probe_metric(
        &self,
        entity: &str,
        signal: Signal,
        profile: &ClassifierProfile,
    ) -> ProbeOutcome {
        let Some(series) = self.series(entity, signal).await else {
            return ProbeOutcome::NoData;
        };
        let segments = self.window.segment(&series);
        let verdict = classify(&segments.pre, &segments.target, &segments.post, profile);
        debug!(
            entity,
            signal = signal.as_str(),
            anomalous = verdict.is_anomalous,
            target = verdict.target_avg,
            pre = verdict.pre_avg,
            post = verdict.post_avg,
            "metric probe"
        );
        ProbeOutcome::Verdict(Reading { verdict, series })
    }

    async fn probe_log(&self, service: &str, query: LogQuery, rule: &StatisticRule) -> ProbeOutcome {
        let Some(records) = self.records(service, query).await else {
            return ProbeOutcome::NoData;
        };
        let series = MetricSeries::from_records(&records);
        let segments = self.log_window.segment(&series);
        let verdict = classify_statistic(&segments.pre, &segments.target, &segments.post, rule);
        debug!(
            service,
            query = query.as_str(),
            anomalous = verdict.is_anomalous,
            target = verdict.target_avg,
            pre = verdict.pre_avg,
            post = verdict.post_avg,
            "log probe"
        );
        ProbeOutcome::Verdict(Reading { verdict, series })
    }

    pub async fn probe_cpu(&self, service: &str) -> ProbeOutcome {
        self.probe_metric(service, Signal::PodCpu, &self.config.classifier.utilization)
            .await
    }

    pub async fn probe_memory(&self, service: &str) -> ProbeOutcome {
        self.probe_metric(service, Signal::PodMemory, &self.config.classifier.utilization)
            .await
    }

    /// Host cpu, memory or disk.
    pub async fn probe_host(&self, host: &str, signal: Signal) -> ProbeOutcome {
        self.probe_metric(host, signal, &self.config.classifier.saturation)
            .await
    }

    pub async fn probe_gc(&self, service: &str) -> ProbeOutcome {
        self.probe_metric(service, Signal::JvmGcDelta, &self.config.classifier.saturation)
            .await
    }

    pub async fn probe_latency(&self, service: &str, mode: ProbeMode) -> ProbeOutcome {
        let rule = StatisticRule {
            statistic: mode.statistic(),
            ratio: self.config.classifier.latency_ratio,
            direction: Direction::Rise,
            allow_missing_baseline: false,
        };
        self.probe_log(service, LogQuery::SpanDuration, &rule).await
    }

    /// Latency of entry spans only, with the relaxed statistic.
    pub async fn probe_entry_latency(&self, service: &str) -> ProbeOutcome {
        let rule = StatisticRule {
            statistic: Statistic::Mean,
            ratio: self.config.classifier.latency_ratio,
            direction: Direction::Rise,
            allow_missing_baseline: false,
        };
        self.probe_log(service, LogQuery::EntrySpanDuration, &rule)
            .await
    }

    pub async fn probe_latency_drop(&self, service: &str) -> ProbeOutcome {
        let rule = StatisticRule {
            statistic: Statistic::Median,
            ratio: self.config.classifier.drop_ratio,
            direction: Direction::Drop,
            allow_missing_baseline: false,
        };
        self.probe_log(service, LogQuery::SpanDuration, &rule).await
    }

    pub async fn probe_cpu_drop(&self, service: &str) -> ProbeOutcome {
        let Some(series) = self.series(service, Signal::PodCpu).await else {
            return ProbeOutcome::NoData;
        };
        let rule = StatisticRule {
            statistic: Statistic::Mean,
            ratio: self.config.classifier.drop_ratio,
            direction: Direction::Drop,
            allow_missing_baseline: false,
        };
        let segments = self.window.segment(&series);
        let verdict = classify_statistic(&segments.pre, &segments.target, &segments.post, &rule);
        ProbeOutcome::Verdict(Reading { verdict, series })
    }

    /// Error spans per minute of the alarm range.
    pub async fn probe_errors(&self, service: &str) -> ProbeOutcome {
        let Some(records) = self.records(service, LogQuery::ErrorCount).await else {
            return ProbeOutcome::NoData;
        };
        let series = MetricSeries::from_records(&records);
        let segments = self.log_window.segment(&series);
        let verdict = classify_rate(
            &segments.pre,
            &segments.target,
            &segments.post,
            self.window.target_minutes(),
            self.config.classifier.error_ratio,
        );
        debug!(
            service,
            anomalous = verdict.is_anomalous,
            rate = verdict.target_avg,
            "error probe"
        );
        ProbeOutcome::Verdict(Reading { verdict, series })
    }

    /// Rise of gRPC `14 UNAVAILABLE` error spans.
    pub async fn probe_grpc_unavailable(&self, service: &str) -> ProbeOutcome {
        let rule = StatisticRule {
            statistic: Statistic::Median,
            ratio: self.config.classifier.span_error_ratio,
            direction: Direction::Rise,
            allow_missing_baseline: true,
        };
        self.probe_log(service, LogQuery::GrpcUnavailable, &rule)
            .await
    }

    /// Number of anomalous TCP counters on a host. Counters without data are skipped.
    pub async fn probe_network_loss(&self, host: &str) -> usize {
        let mut anomalous = 0;
        for counter in Signal::TCP_COUNTERS {
            if self
                .probe_metric(host, counter, &self.config.classifier.count)
                .await
                .is_anomalous()
            {
                anomalous += 1;
            }
        }
        anomalous
    }

    /// Counts hosts serving `service` whose golden series has gaps.
    ///
    /// A host with no golden data at all is not counted as killed: the
    /// store simply does not know it.
    pub async fn probe_pod_kill(&self, service: &str) -> Option<PodKillSummary> {
        let records = self.records(service, LogQuery::HostInvocations).await?;

        let mut hosts: Vec<&str> = Vec::new();
        for label in records.iter().filter_map(|record| record.label.as_deref()) {
            if !hosts.contains(&label) {
                hosts.push(label);
            }
        }
        if hosts.is_empty() {
            return None;
        }

        let expected = usize::try_from(self.window.span_minutes()).unwrap_or_default();
        let mut killed = 0;
        for host in &hosts {
            if let Some(series) = self.series(host, Signal::PodGolden).await {
                if series.len() < expected {
                    debug!(service, host, points = series.len(), expected, "pod series has gaps");
                    killed += 1;
                }
            }
        }
        Some(PodKillSummary {
            hosts: hosts.len(),
            killed,
        })
    }

    /// Runs the probes of `signals` on one service and keeps the readings
    /// that clear their floors.
    pub async fn probe_service(
        &self,
        service: &str,
        mode: ProbeMode,
        signals: SignalSet,
        floors: Floors,
    ) -> ServiceReport {
        if signals.host {
            return self.probe_host_entity(service, floors).await;
        }

        let probe = &self.config.probe;
        let enabled = |wanted: bool, kind: ProbeKind| wanted && !probe.is_exempt(service, kind);

        let cpu = async {
            if enabled(signals.cpu, ProbeKind::Cpu) {
                self.probe_cpu(service).await
            } else {
                ProbeOutcome::NoData
            }
        };
        let memory = async {
            if enabled(signals.memory, ProbeKind::Memory) {
                self.probe_memory(service).await
            } else {
                ProbeOutcome::NoData
            }
        };
        let latency = async {
            if enabled(signals.latency, ProbeKind::Latency) {
                self.probe_latency(service, mode).await
            } else {
                ProbeOutcome::NoData
            }
        };
        let errors = async {
            if signals.errors {
                self.probe_errors(service).await
            } else {
                ProbeOutcome::NoData
            }
        };
        let (cpu, memory, latency, errors) = tokio::join!(cpu, memory, latency, errors);

        let mut report = ServiceReport::empty(service);
        if let Some(reading) = above_peak(cpu, floors.cpu) {
            report.push(service, Category::Cpu, reading, "CPU usage");
        }
        if let Some(reading) = above_peak(memory, floors.memory) {
            report.push(service, Category::Memory, reading, "memory usage");
        }
        if let Some(reading) = latency.into_reading().filter(|r| r.verdict.is_anomalous) {
            report.push(service, Category::NetworkLatency, reading, "span latency");
        }
        if let Some(reading) = errors
            .into_reading()
            .filter(|r| r.verdict.is_anomalous && r.verdict.target_avg > floors.error_rate)
        {
            report.push(service, Category::Failure, reading, "error rate");
        }
        report
    }

    async fn probe_host_entity(&self, host: &str, floors: Floors) -> ServiceReport {
        let mut report = ServiceReport::empty(host);
        let utilization = [
            (Signal::HostCpu, Category::Cpu, "host CPU usage"),
            (Signal::HostMemory, Category::Memory, "host memory usage"),
            (Signal::HostDisk, Category::Disk, "host disk usage"),
        ];
        for (signal, category, label) in utilization {
            if let Some(reading) = above_peak(self.probe_host(host, signal).await, floors.host) {
                report.push(host, category, reading, label);
            }
        }

        let anomalous = self.probe_network_loss(host).await;
        if anomalous >= floors.network_loss_signals {
            report.findings.push(Finding {
                candidate: Candidate::new(host, Category::NetworkLoss).with_score(anomalous as f64),
                evidence: format!(
                    "{host} shows anomalies on {anomalous} of {} TCP error counters",
                    Signal::TCP_COUNTERS.len()
                ),
            });
        }
        report
    }

    /// Probes every service concurrently, one task per service.
    ///
    /// Reports come back in the order of `services`. A task that times out
    /// or panics contributes an empty report.
    pub async fn probe_all(
        &self,
        services: &[String],
        mode: ProbeMode,
        signals: SignalSet,
        floors: Floors,
    ) -> Vec<ServiceReport> {
        let timeout = self.config.probe.timeout();
        let mut tasks = JoinSet::new();

        for (index, service) in services.iter().enumerate() {
            let prober = self.clone();
            let service = service.clone();
            tasks.spawn(async move {
                let _permit = prober.limiter.clone().acquire_owned().await.ok();
                let probed =
                    time::timeout(timeout, prober.probe_service(&service, mode, signals, floors))
                        .await;
                let report = match probed {
                    Ok(report) => report,
                    Err(_) => {
                        warn!(service = %service, ?timeout, "Probe timed out");
                        ServiceReport::empty(service)
                    }
                };
                (index, report)
            });
        }

        let mut slots: Vec<Option<ServiceReport>> = vec![None; services.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(report);
                    }
                }
                Err(error) => warn!(%error, "Probe task failed"),
            }
        }

        services
            .iter()
            .zip(slots)
            .map(|(service, slot)| slot.unwrap_or_else(|| ServiceReport::empty(service.clone())))
            .collect()
    }
}

impl ServiceReport {
    fn push(&mut self, entity: &str, category: Category, reading: Reading, label: &str) {
        let verdict = reading.verdict;
        let score = match category {
            Category::NetworkLatency => verdict.amplitude().unwrap_or_default(),
            Category::Failure => verdict.target_avg,
            _ => verdict.peak,
        };
        let evidence = describe(entity, label, &verdict);
        self.findings.push(Finding {
            candidate: Candidate::new(entity, category)
                .with_verdict(verdict)
                .with_snapshot(reading.series)
                .with_score(score),
            evidence,
        });
    }
}

fn above_peak(outcome: ProbeOutcome, floor: f64) -> Option<Reading> {
    outcome
        .into_reading()
        .filter(|reading| reading.verdict.is_anomalous && reading.verdict.peak > floor)
}

/// One sentence summarizing a verdict.
pub fn describe(entity: &str, label: &str, verdict: &AnomalyVerdict) -> String {
    format!(
        "{entity} {label} averaged {:.2} during the alarm against {:.2} before and {:.2} after (peak {:.2})",
        verdict.target_avg, verdict.pre_avg, verdict.post_avg, verdict.peak
    )
}
