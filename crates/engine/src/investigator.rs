use crate::{
    arbiter::{ArbitrationContext, Arbiter, stages},
    candidates::{Candidate, CandidatePool},
    config::FaultlineConfig,
    error::EngineError,
    evidence::EvidenceLedger,
    models::{AlarmRule, Category, Diagnosis, Problem},
    probe::{Floors, ProbeMode, Prober, ServiceReport, SignalSet, describe},
    resolver::{AmbiguityResolver, KeepAll},
    telemetry::Telemetry,
    topology::Topology,
};
use std::sync::Arc;
use tracing::{Instrument, info, info_span};

/// Entry point of the engine: one [`Diagnosis`] per [`Problem`].
#[derive(Clone)]
pub struct Investigator {
    telemetry: Arc<dyn Telemetry>,
    config: Arc<FaultlineConfig>,
    topology: Arc<Topology>,
    resolver: Arc<dyn AmbiguityResolver>,
}

impl Investigator {
    pub fn new(telemetry: Arc<dyn Telemetry>, config: FaultlineConfig) -> Self {
        let topology = Arc::new(config.topology.build());
        Self {
            telemetry,
            config: Arc::new(config),
            topology,
            resolver: Arc::new(KeepAll),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AmbiguityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &FaultlineConfig {
        &self.config
    }

    /// Probes the problem's candidates and arbitrates their findings.
    ///
    /// Fails only on malformed problems (unknown alarm rule, bad time range).
    /// Missing telemetry yields an empty diagnosis.
    pub async fn diagnose(&self, problem: &Problem) -> Result<Diagnosis, EngineError> {
        let rule = problem.alarm_rule()?;
        let span = info_span!("diagnose", problem_id = %problem.problem_id, rule = %rule);
        self.run(problem, rule).instrument(span).await
    }

    async fn run(&self, problem: &Problem, rule: AlarmRule) -> Result<Diagnosis, EngineError> {
        let hours = self.config.window.utc_offset_hours;
        let offset = self
            .config
            .window
            .offset()
            .ok_or(EngineError::InvalidOffset(hours))?;
        let range = problem.parse_time_range(offset)?;
        let prober = Prober::new(self.telemetry.clone(), self.config.clone(), &range);

        let named = problem.candidate_services();
        let services: Vec<String> = named
            .iter()
            .filter(|service| !self.topology.is_denied(service))
            .cloned()
            .collect();
        let hosts: Vec<String> = named
            .iter()
            .filter(|service| self.topology.is_host(service))
            .cloned()
            .collect();
        info!(services = services.len(), hosts = hosts.len(), "Investigating");

        let mut ledger = EvidenceLedger::new();
        let floors = Floors::for_rule(rule, &self.config.probe);
        let pool = match rule {
            AlarmRule::FrontendAvgRt | AlarmRule::ServiceAvgRt => {
                self.latency_round(&prober, &services, floors, &mut ledger)
                    .await
            }
            AlarmRule::GreyFailure => {
                self.grey_round(&prober, &services, &hosts, floors, &mut ledger)
                    .await
            }
            AlarmRule::OverallErrorCount => {
                let reports = prober
                    .probe_all(&services, ProbeMode::Strict, SignalSet::ERRORS, floors)
                    .await;
                let mut pool = CandidatePool::new();
                merge(&mut pool, &mut ledger, reports);
                pool
            }
        };

        let arbiter = Arbiter::for_rule(rule, self.resolver.clone());
        let mut ctx = ArbitrationContext {
            rule,
            services: &services,
            topology: &self.topology,
            prober: &prober,
            ledger: &mut ledger,
            frontend_confirmed: false,
        };
        let root_causes = arbiter.arbitrate(pool, &mut ctx).await;
        let evidence = ledger.collect(&root_causes);

        info!(
            root_causes = ?root_causes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Diagnosis complete"
        );
        Ok(Diagnosis {
            problem_id: problem.problem_id.clone(),
            root_causes,
            evidence,
        })
    }

    /// cpu, memory and latency on every service, retried with the relaxed
    /// statistic when nothing stands out, plus the JVM GC probe.
    async fn latency_round(
        &self,
        prober: &Prober,
        services: &[String],
        floors: Floors,
        ledger: &mut EvidenceLedger,
    ) -> CandidatePool {
        let mut pool = CandidatePool::new();
        let reports = prober
            .probe_all(services, ProbeMode::Strict, SignalSet::LATENCY_ALARM, floors)
            .await;
        merge(&mut pool, ledger, reports);

        if pool.is_empty() {
            info!("Strict round found nothing, retrying with relaxed statistics");
            let reports = prober
                .probe_all(services, ProbeMode::Relaxed, SignalSet::LATENCY_ALARM, floors)
                .await;
            merge(&mut pool, ledger, reports);
        }

        let jvm = &self.config.arbiter.jvm_service;
        if let Some(verdict) = prober
            .probe_gc(jvm)
            .await
            .verdict()
            .filter(|verdict| verdict.is_anomalous)
        {
            let candidate = Candidate::new(jvm.clone(), Category::JvmChaos)
                .with_verdict(verdict)
                .with_score(verdict.peak);
            ledger.record(&candidate.key, describe(jvm, "JVM GC time", &verdict));
            pool.insert(candidate);
        }
        pool
    }

    /// Pod utilization first; host utilization, disk and TCP counters only
    /// when no pod stands out.
    async fn grey_round(
        &self,
        prober: &Prober,
        services: &[String],
        hosts: &[String],
        floors: Floors,
        ledger: &mut EvidenceLedger,
    ) -> CandidatePool {
        let mut pool = CandidatePool::new();
        let reports = prober
            .probe_all(services, ProbeMode::Strict, SignalSet::POD_UTILIZATION, floors)
            .await;
        merge(&mut pool, ledger, reports);
        stages::filter_cpu_ramps(&mut pool, &self.config.ramp, ledger);

        if pool.len_of(Category::Cpu) == 0 && pool.len_of(Category::Memory) == 0 && !hosts.is_empty() {
            info!(hosts = hosts.len(), "No pod anomaly, probing hosts");
            let reports = prober
                .probe_all(hosts, ProbeMode::Strict, SignalSet::HOST, floors)
                .await;
            merge(&mut pool, ledger, reports);
        }
        pool
    }
}

fn merge(pool: &mut CandidatePool, ledger: &mut EvidenceLedger, reports: Vec<ServiceReport>) {
    for finding in reports.into_iter().flat_map(|report| report.findings) {
        let key = finding.candidate.key.clone();
        if pool.insert(finding.candidate) {
            ledger.record(&key, finding.evidence);
        }
    }
}
