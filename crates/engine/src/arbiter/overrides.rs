//! Ordered replacements applied to the reduced result.
//!
//! Each rule is a predicate over the current result plus an action that may
//! re-probe and replace it. Rules run in table order.

use super::{ArbitrationContext, stages::amplitude_winner};
use crate::{
    candidates::Candidate,
    models::{CandidateKey, Category},
    probe::{Floors, ProbeMode, SignalSet, describe},
};
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait OverrideRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies(&self, result: &[CandidateKey], ctx: &ArbitrationContext<'_>) -> bool;

    async fn apply(
        &self,
        result: Vec<CandidateKey>,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Vec<CandidateKey>;
}

/// Any result naming the JVM service becomes `<jvm service>.jvmChaos`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JvmService;

#[async_trait]
impl OverrideRule for JvmService {
    fn name(&self) -> &'static str {
        "JvmService"
    }

    fn applies(&self, result: &[CandidateKey], ctx: &ArbitrationContext<'_>) -> bool {
        let service = &ctx.prober.config().arbiter.jvm_service;
        result.iter().any(|key| &key.service == service)
    }

    async fn apply(
        &self,
        result: Vec<CandidateKey>,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Vec<CandidateKey> {
        let service = ctx.prober.config().arbiter.jvm_service.clone();
        let key = CandidateKey::new(service, Category::JvmChaos);
        let replaced: Vec<String> = result.iter().map(ToString::to_string).collect();
        ctx.ledger.record(
            &key,
            format!(
                "{} anomalies ({}) are attributed to JVM chaos",
                key.service,
                replaced.join(", ")
            ),
        );
        vec![key]
    }
}

/// A lone cpu verdict on the gRPC service is really a network fault when its
/// callers see `UNAVAILABLE` errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcUnavailable;

#[async_trait]
impl OverrideRule for GrpcUnavailable {
    fn name(&self) -> &'static str {
        "GrpcUnavailable"
    }

    fn applies(&self, result: &[CandidateKey], ctx: &ArbitrationContext<'_>) -> bool {
        let service = &ctx.prober.config().arbiter.grpc_service;
        matches!(result, [only] if &only.service == service && only.category == Category::Cpu)
    }

    async fn apply(
        &self,
        result: Vec<CandidateKey>,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Vec<CandidateKey> {
        let prober = ctx.prober;
        let service = &prober.config().arbiter.grpc_service;
        let outcome = prober.probe_grpc_unavailable(service).await;
        let Some(verdict) = outcome.verdict().filter(|verdict| verdict.is_anomalous) else {
            return result;
        };

        let key = CandidateKey::new(service.clone(), Category::NetworkLatency);
        ctx.ledger
            .record(&key, describe(service, "gRPC UNAVAILABLE span count", &verdict));
        vec![key]
    }
}

/// A lone latency verdict on an entry service is checked against its
/// callees: when few of them are slow too, the slowest callee is the origin
/// and the entry service only propagated it. When none is slow the verdict
/// is dropped and the escalation ladder takes over.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalleeExpansion;

#[async_trait]
impl OverrideRule for CalleeExpansion {
    fn name(&self) -> &'static str {
        "CalleeExpansion"
    }

    fn applies(&self, result: &[CandidateKey], ctx: &ArbitrationContext<'_>) -> bool {
        if ctx.frontend_confirmed {
            return false;
        }
        let services = &ctx.prober.config().arbiter.expansion_services;
        matches!(result, [only] if only.category == Category::NetworkLatency && services.contains(&only.service))
    }

    async fn apply(
        &self,
        result: Vec<CandidateKey>,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Vec<CandidateKey> {
        let Some(upstream) = result.first().cloned() else {
            return result;
        };
        let prober = ctx.prober;
        let config = prober.config();
        let callees: Vec<String> = ctx
            .topology
            .callees(&upstream.service)
            .into_iter()
            .filter(|callee| !ctx.topology.is_denied(callee))
            .collect();
        if callees.is_empty() {
            return result;
        }

        let floors = Floors::for_rule(ctx.rule, &config.probe);
        let reports = prober
            .probe_all(&callees, ProbeMode::Relaxed, SignalSet::LATENCY_ONLY, floors)
            .await;

        let mut confirmed: Vec<Candidate> = Vec::new();
        for finding in reports.into_iter().flat_map(|report| report.findings) {
            if finding.candidate.category() == Category::NetworkLatency {
                ctx.ledger.record(&finding.candidate.key, finding.evidence);
                confirmed.push(finding.candidate);
            }
        }

        let minimum = config.arbiter.expansion_min_confirmations;
        if confirmed.len() >= minimum {
            ctx.ledger.record(
                &upstream,
                format!(
                    "{} of {} callees of {} are slow as well, so {} is the origin",
                    confirmed.len(),
                    callees.len(),
                    upstream.service,
                    upstream.service
                ),
            );
            return result;
        }

        let Some((winner, amplitude)) = amplitude_winner(&confirmed) else {
            if confirmed.is_empty() {
                info!(
                    service = %upstream.service,
                    "No callee confirms the latency, dropping the upstream verdict"
                );
            }
            return confirmed.into_iter().map(|candidate| candidate.key).collect();
        };
        ctx.ledger.record(
            &winner.key,
            format!(
                "{} latency propagated from callee {} (amplitude {amplitude:.2})",
                upstream.service,
                winner.service()
            ),
        );
        vec![winner.key.clone()]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        evidence::EvidenceLedger,
        models::AlarmRule,
        telemetry::{LogQuery, StaticTelemetry},
        testing,
        topology::Topology,
    };

    fn key(raw: &str) -> CandidateKey {
        raw.parse().unwrap()
    }

    #[tokio::test]
    async fn inventory_result_becomes_jvm_chaos_whatever_came_before() {
        let prober = testing::prober(StaticTelemetry::new());
        let topology = Topology::demo_shop();
        let mut ledger = EvidenceLedger::new();
        let mut ctx = ArbitrationContext {
            rule: AlarmRule::ServiceAvgRt,
            services: &[],
            topology: &topology,
            prober: &prober,
            ledger: &mut ledger,
            frontend_confirmed: false,
        };

        let result: Vec<CandidateKey> =
            ["cart.memory", "inventory.memory"].into_iter().map(key).collect();
        assert!(JvmService.applies(&result, &ctx));
        let replaced = JvmService.apply(result, &mut ctx).await;
        assert_eq!(replaced, vec![CandidateKey::new("inventory", Category::JvmChaos)]);

        let other = key("cart.cpu");
        assert!(!JvmService.applies(&[other], &ctx));
    }

    #[tokio::test]
    async fn currency_cpu_turns_into_latency_when_grpc_errors_rise() {
        let mut telemetry = StaticTelemetry::new();
        let records = testing::spike_records(1.0, 30.0);
        telemetry.insert_logs("currency", LogQuery::GrpcUnavailable, records);
        let prober = testing::prober(telemetry);
        let topology = Topology::demo_shop();
        let mut ledger = EvidenceLedger::new();
        let mut ctx = ArbitrationContext {
            rule: AlarmRule::ServiceAvgRt,
            services: &[],
            topology: &topology,
            prober: &prober,
            ledger: &mut ledger,
            frontend_confirmed: false,
        };

        let result = vec![CandidateKey::new("currency", Category::Cpu)];
        assert!(GrpcUnavailable.applies(&result, &ctx));
        let replaced = GrpcUnavailable.apply(result, &mut ctx).await;
        assert_eq!(
            replaced,
            vec![CandidateKey::new("currency", Category::NetworkLatency)]
        );
    }

    #[tokio::test]
    async fn currency_cpu_stays_without_grpc_signature() {
        let prober = testing::prober(StaticTelemetry::new());
        let topology = Topology::demo_shop();
        let mut ledger = EvidenceLedger::new();
        let mut ctx = ArbitrationContext {
            rule: AlarmRule::ServiceAvgRt,
            services: &[],
            topology: &topology,
            prober: &prober,
            ledger: &mut ledger,
            frontend_confirmed: false,
        };

        let result = vec![CandidateKey::new("currency", Category::Cpu)];
        let kept = GrpcUnavailable.apply(result.clone(), &mut ctx).await;
        assert_eq!(kept, result);
    }

    #[tokio::test]
    async fn few_slow_callees_move_blame_to_the_slowest() {
        let mut telemetry = StaticTelemetry::new();
        for (service, high) in [("ad", 40.0), ("cart", 90.0)] {
            let records = testing::spike_records(10.0, high);
            telemetry.insert_logs(service, LogQuery::SpanDuration, records);
        }
        let prober = testing::prober(telemetry);
        let topology = Topology::demo_shop();
        let mut ledger = EvidenceLedger::new();
        let mut ctx = ArbitrationContext {
            rule: AlarmRule::FrontendAvgRt,
            services: &[],
            topology: &topology,
            prober: &prober,
            ledger: &mut ledger,
            frontend_confirmed: false,
        };

        let result = vec![CandidateKey::new("frontend", Category::NetworkLatency)];
        assert!(CalleeExpansion.applies(&result, &ctx));
        let replaced = CalleeExpansion.apply(result, &mut ctx).await;
        assert_eq!(replaced, vec![CandidateKey::new("cart", Category::NetworkLatency)]);
    }

    #[tokio::test]
    async fn many_slow_callees_keep_the_upstream_verdict() {
        let mut telemetry = StaticTelemetry::new();
        for service in ["ad", "cart", "currency", "recommendation"] {
            let records = testing::spike_records(10.0, 80.0);
            telemetry.insert_logs(service, LogQuery::SpanDuration, records);
        }
        let prober = testing::prober(telemetry);
        let topology = Topology::demo_shop();
        let mut ledger = EvidenceLedger::new();
        let mut ctx = ArbitrationContext {
            rule: AlarmRule::FrontendAvgRt,
            services: &[],
            topology: &topology,
            prober: &prober,
            ledger: &mut ledger,
            frontend_confirmed: false,
        };

        let result = vec![CandidateKey::new("frontend", Category::NetworkLatency)];
        let kept = CalleeExpansion.apply(result.clone(), &mut ctx).await;
        assert_eq!(kept, result);
    }

    #[tokio::test]
    async fn no_slow_callee_drops_the_upstream_verdict() {
        let prober = testing::prober(StaticTelemetry::new());
        let topology = Topology::demo_shop();
        let mut ledger = EvidenceLedger::new();
        let mut ctx = ArbitrationContext {
            rule: AlarmRule::FrontendAvgRt,
            services: &[],
            topology: &topology,
            prober: &prober,
            ledger: &mut ledger,
            frontend_confirmed: false,
        };

        let result = vec![CandidateKey::new("frontend", Category::NetworkLatency)];
        assert!(CalleeExpansion.applies(&result, &ctx));
        let replaced = CalleeExpansion.apply(result, &mut ctx).await;
        assert!(replaced.is_empty());
    }

    #[tokio::test]
    async fn expansion_is_disabled_once_frontend_is_confirmed() {
        let prober = testing::prober(StaticTelemetry::new());
        let topology = Topology::demo_shop();
        let mut ledger = EvidenceLedger::new();
        let ctx = ArbitrationContext {
            rule: AlarmRule::FrontendAvgRt,
            services: &[],
            topology: &topology,
            prober: &prober,
            ledger: &mut ledger,
            frontend_confirmed: true,
        };
        let result = vec![CandidateKey::new("frontend", Category::NetworkLatency)];
        assert!(!CalleeExpansion.applies(&result, &ctx));
    }
}
