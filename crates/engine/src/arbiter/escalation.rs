//! Steps tried, in order, when arbitration leaves nothing.

use super::{ArbitrationContext, stages::amplitude_winner};
use crate::{
    candidates::Candidate,
    models::{AlarmRule, CandidateKey, Category},
    probe::{Floors, ProbeMode, SignalSet, describe},
};
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait Escalation: Send + Sync {
    fn name(&self) -> &'static str;

    /// An empty result means the step found nothing and the next one runs.
    async fn attempt(&self, ctx: &mut ArbitrationContext<'_>) -> Vec<CandidateKey>;
}

/// Grey failures only: a few missing pods behind an otherwise healthy
/// service.
#[derive(Debug, Clone, Copy, Default)]
pub struct PodKill;

#[async_trait]
impl Escalation for PodKill {
    fn name(&self) -> &'static str {
        "PodKill"
    }

    async fn attempt(&self, ctx: &mut ArbitrationContext<'_>) -> Vec<CandidateKey> {
        if ctx.rule != AlarmRule::GreyFailure {
            return Vec::new();
        }
        let prober = ctx.prober;
        let arbiter = &prober.config().arbiter;

        let mut killed = Vec::new();
        for service in &arbiter.pod_kill_services {
            let Some(summary) = prober.probe_pod_kill(service).await else {
                continue;
            };
            debug!(service = %service, hosts = summary.hosts, killed = summary.killed, "Pod kill check");
            if summary.killed > 0
                && summary.killed <= arbiter.pod_kill_max_killed
                && summary.hosts >= arbiter.pod_kill_min_hosts
            {
                let key = CandidateKey::new(service.clone(), Category::PodKiller);
                ctx.ledger.record(
                    &key,
                    format!(
                        "{} of {} {service} pods stopped reporting during the alarm",
                        summary.killed, summary.hosts
                    ),
                );
                killed.push(key);
            }
        }
        killed
    }
}

/// The JVM service misbehaving at all is blamed on JVM chaos.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackJvm;

#[async_trait]
impl Escalation for FallbackJvm {
    fn name(&self) -> &'static str {
        "FallbackJvm"
    }

    async fn attempt(&self, ctx: &mut ArbitrationContext<'_>) -> Vec<CandidateKey> {
        let prober = ctx.prober;
        let service = &prober.config().arbiter.jvm_service;

        let (cpu, memory) = tokio::join!(prober.probe_cpu(service), prober.probe_memory(service));
        let Some((label, verdict)) = [("CPU usage", cpu), ("memory usage", memory)]
            .into_iter()
            .find_map(|(label, outcome)| {
                outcome
                    .verdict()
                    .filter(|verdict| verdict.is_anomalous)
                    .map(|verdict| (label, verdict))
            })
        else {
            return Vec::new();
        };

        let key = CandidateKey::new(service.clone(), Category::JvmChaos);
        ctx.ledger.record(&key, describe(service, label, &verdict));
        vec![key]
    }
}

/// Latency and CPU both collapsing on the watched service means its pods
/// were OOM-killed and restarted.
#[derive(Debug, Clone, Copy, Default)]
pub struct OomSignature;

#[async_trait]
impl Escalation for OomSignature {
    fn name(&self) -> &'static str {
        "OomSignature"
    }

    async fn attempt(&self, ctx: &mut ArbitrationContext<'_>) -> Vec<CandidateKey> {
        let prober = ctx.prober;
        let service = &prober.config().arbiter.oom_service;

        let (latency, cpu) = tokio::join!(
            prober.probe_latency_drop(service),
            prober.probe_cpu_drop(service)
        );
        let (Some(latency), Some(cpu)) = (latency.verdict(), cpu.verdict()) else {
            return Vec::new();
        };
        if !(latency.is_anomalous && cpu.is_anomalous) {
            return Vec::new();
        }

        let key = CandidateKey::new(service.clone(), Category::Memory);
        ctx.ledger.record(
            &key,
            format!(
                "{service} span latency fell to {:.2} from {:.2} before and {:.2} after",
                latency.target_avg, latency.pre_avg, latency.post_avg
            ),
        );
        ctx.ledger.record(
            &key,
            format!(
                "{service} CPU usage fell to {:.2} from {:.2} before and {:.2} after, consistent with restarted pods",
                cpu.target_avg, cpu.pre_avg, cpu.post_avg
            ),
        );
        vec![key]
    }
}

/// Last resort: the slowest service by relaxed latency amplitude, or every
/// confirmed service when none has a usable amplitude.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelaxedLatency;

#[async_trait]
impl Escalation for RelaxedLatency {
    fn name(&self) -> &'static str {
        "RelaxedLatency"
    }

    async fn attempt(&self, ctx: &mut ArbitrationContext<'_>) -> Vec<CandidateKey> {
        let prober = ctx.prober;
        let floors = Floors::for_rule(ctx.rule, &prober.config().probe);
        let reports = prober
            .probe_all(ctx.services, ProbeMode::Relaxed, SignalSet::LATENCY_ONLY, floors)
            .await;

        let mut confirmed: Vec<Candidate> = Vec::new();
        for finding in reports.into_iter().flat_map(|report| report.findings) {
            ctx.ledger.record(&finding.candidate.key, finding.evidence);
            confirmed.push(finding.candidate);
        }

        match amplitude_winner(&confirmed) {
            Some((winner, _)) => vec![winner.key.clone()],
            None => confirmed.into_iter().map(|candidate| candidate.key).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        evidence::EvidenceLedger,
        models::LogRecord,
        telemetry::{LogQuery, Signal, StaticTelemetry},
        testing,
        topology::Topology,
    };
    use chrono::Duration;

    async fn run(
        step: &dyn Escalation,
        telemetry: StaticTelemetry,
        rule: AlarmRule,
        services: &[String],
    ) -> Vec<CandidateKey> {
        let prober = testing::prober(telemetry);
        let topology = Topology::demo_shop();
        let mut ledger = EvidenceLedger::new();
        let mut ctx = ArbitrationContext {
            rule,
            services,
            topology: &topology,
            prober: &prober,
            ledger: &mut ledger,
            frontend_confirmed: false,
        };
        step.attempt(&mut ctx).await
    }

    #[tokio::test]
    async fn fallback_service_anomaly_becomes_jvm_chaos() {
        let mut telemetry = StaticTelemetry::new();
        let series = testing::spike(20.0, 45.0);
        telemetry.insert_series("inventory", Signal::PodMemory, series);

        let result = run(&FallbackJvm, telemetry, AlarmRule::ServiceAvgRt, &[]).await;
        assert_eq!(
            result,
            vec![CandidateKey::new("inventory", Category::JvmChaos)]
        );
    }

    #[tokio::test]
    async fn healthy_fallback_service_yields_nothing() {
        let mut telemetry = StaticTelemetry::new();
        let series = testing::spike(20.0, 21.0);
        telemetry.insert_series("inventory", Signal::PodCpu, series);

        let result = run(&FallbackJvm, telemetry, AlarmRule::ServiceAvgRt, &[]).await;
        assert_eq!(result, Vec::new());
    }

    #[tokio::test]
    async fn latency_and_cpu_drop_is_an_oom_signature() {
        let mut telemetry = StaticTelemetry::new();
        let records = testing::spike_records(100.0, 10.0);
        telemetry.insert_logs("email", LogQuery::SpanDuration, records);
        let series = testing::spike(40.0, 5.0);
        telemetry.insert_series("email", Signal::PodCpu, series);

        let result = run(&OomSignature, telemetry, AlarmRule::ServiceAvgRt, &[]).await;
        assert_eq!(result, vec![CandidateKey::new("email", Category::Memory)]);
    }

    #[tokio::test]
    async fn latency_drop_alone_is_not_enough() {
        let mut telemetry = StaticTelemetry::new();
        let records = testing::spike_records(100.0, 10.0);
        telemetry.insert_logs("email", LogQuery::SpanDuration, records);

        let result = run(&OomSignature, telemetry, AlarmRule::ServiceAvgRt, &[]).await;
        assert_eq!(result, Vec::new());
    }

    #[tokio::test]
    async fn relaxed_pass_picks_largest_amplitude() {
        let mut telemetry = StaticTelemetry::new();
        for (service, high) in [("ad", 30.0), ("quote", 70.0)] {
            let records = testing::spike_records(10.0, high);
            telemetry.insert_logs(service, LogQuery::SpanDuration, records);
        }
        let services: Vec<String> = ["ad", "quote", "cart"].map(String::from).to_vec();

        let result = run(&RelaxedLatency, telemetry, AlarmRule::GreyFailure, &services).await;
        assert_eq!(
            result,
            vec![CandidateKey::new("quote", Category::NetworkLatency)]
        );
    }

    #[tokio::test]
    async fn relaxed_pass_without_amplitude_keeps_every_confirmed_service() {
        // zero latency around the alarm leaves no usable amplitude
        let mut telemetry = StaticTelemetry::new();
        for service in ["ad", "quote"] {
            let records = testing::spike_records(0.0, 70.0);
            telemetry.insert_logs(service, LogQuery::SpanDuration, records);
        }
        let services: Vec<String> = ["quote", "ad"].map(String::from).to_vec();

        let result = run(&RelaxedLatency, telemetry, AlarmRule::GreyFailure, &services).await;
        assert_eq!(
            result,
            vec![
                CandidateKey::new("quote", Category::NetworkLatency),
                CandidateKey::new("ad", Category::NetworkLatency),
            ]
        );
    }

    #[tokio::test]
    async fn pod_kill_needs_few_killed_among_many_hosts() {
        let start = testing::alarm_start();
        let mut telemetry = StaticTelemetry::new();
        let hosts = ["checkout-a", "checkout-b", "checkout-c"];
        let records = hosts
            .iter()
            .map(|host| LogRecord {
                timestamp: start,
                value: 10.0,
                label: Some((*host).to_owned()),
            })
            .collect();
        telemetry.insert_logs("checkout", LogQuery::HostInvocations, records);
        for host in hosts {
            let series = testing::spike(1.0, 1.0);
            telemetry.insert_series(host, Signal::PodGolden, series);
        }
        // checkout-c reports only until the alarm starts
        let full = testing::spike(1.0, 1.0);
        let (stamps, values): (Vec<_>, Vec<_>) = full
            .points()
            .filter(|(ts, _)| *ts <= start + Duration::minutes(1))
            .unzip();
        telemetry.insert_series(
            "checkout-c",
            Signal::PodGolden,
            crate::models::MetricSeries::new(stamps, values),
        );

        let grey = run(&PodKill, telemetry.clone(), AlarmRule::GreyFailure, &[]).await;
        assert_eq!(
            grey,
            vec![CandidateKey::new("checkout", Category::PodKiller)]
        );

        let latency = run(&PodKill, telemetry, AlarmRule::ServiceAvgRt, &[]).await;
        assert_eq!(latency, Vec::new());
    }
}
