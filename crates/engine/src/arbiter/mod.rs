//! Reduces the candidate pool of one problem to its root causes.
//!
//! ```text
//! pool ─▶ stages (amplitude, ramp, frequency, downstream, corroboration,
//!         per-service priority, global priority)
//!      ─▶ ambiguity resolver (ties only)
//!      ─▶ override table (ordered, each may replace the result)
//!      ─▶ escalation ladder (only when the result is empty)
//! ```

pub mod escalation;
pub mod overrides;
pub mod stages;

use crate::{
    candidates::{Candidate, CandidatePool},
    evidence::EvidenceLedger,
    models::{AlarmRule, CandidateKey, Category},
    probe::{Prober, describe},
    resolver::AmbiguityResolver,
    topology::Topology,
};
use std::sync::Arc;
use tracing::{debug, info};

pub use escalation::{Escalation, FallbackJvm, OomSignature, PodKill, RelaxedLatency};
pub use overrides::{CalleeExpansion, GrpcUnavailable, JvmService, OverrideRule};

/// Everything an arbitration step may read or record into.
pub struct ArbitrationContext<'a> {
    pub rule: AlarmRule,
    /// Application services named by the problem, in input order.
    pub services: &'a [String],
    pub topology: &'a Topology,
    pub prober: &'a Prober,
    pub ledger: &'a mut EvidenceLedger,
    /// Set when the entry-span probe confirmed the frontend itself.
    pub frontend_confirmed: bool,
}

/// Which reductions run before the override table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Resource and latency candidates.
    Signals,
    /// Failure candidates ranked by error rate.
    Errors,
}

pub struct Arbiter {
    plan: Plan,
    overrides: Vec<Box<dyn OverrideRule>>,
    ladder: Vec<Box<dyn Escalation>>,
    resolver: Arc<dyn AmbiguityResolver>,
}

impl Arbiter {
    pub fn new(
        plan: Plan,
        overrides: Vec<Box<dyn OverrideRule>>,
        ladder: Vec<Box<dyn Escalation>>,
        resolver: Arc<dyn AmbiguityResolver>,
    ) -> Self {
        Self {
            plan,
            overrides,
            ladder,
            resolver,
        }
    }

    /// The standard rule table and ladder for an alarm rule.
    pub fn for_rule(rule: AlarmRule, resolver: Arc<dyn AmbiguityResolver>) -> Self {
        let overrides: Vec<Box<dyn OverrideRule>> = vec![
            Box::new(JvmService),
            Box::new(GrpcUnavailable),
            Box::new(CalleeExpansion),
        ];
        let (plan, ladder): (Plan, Vec<Box<dyn Escalation>>) = match rule {
            AlarmRule::FrontendAvgRt | AlarmRule::ServiceAvgRt => (
                Plan::Signals,
                vec![
                    Box::new(FallbackJvm),
                    Box::new(OomSignature),
                    Box::new(RelaxedLatency),
                ],
            ),
            AlarmRule::GreyFailure => (
                Plan::Signals,
                vec![
                    Box::new(PodKill),
                    Box::new(FallbackJvm),
                    Box::new(OomSignature),
                    Box::new(RelaxedLatency),
                ],
            ),
            AlarmRule::OverallErrorCount => (Plan::Errors, Vec::new()),
        };
        Self::new(plan, overrides, ladder, resolver)
    }

    pub async fn arbitrate(
        &self,
        mut pool: CandidatePool,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Vec<CandidateKey> {
        let survivors = match self.plan {
            Plan::Signals => self.reduce_signals(&mut pool, ctx).await,
            Plan::Errors => self.reduce_errors(&mut pool, ctx),
        };
        let mut result: Vec<CandidateKey> = survivors.into_iter().map(|c| c.key).collect();
        debug!(result = ?keys_display(&result), "Deterministic stages done");

        if result.len() > 1 {
            if let Some(pick) = self.resolver.resolve(&result, &pool).await {
                if result.contains(&pick) {
                    info!(resolver = self.resolver.name(), pick = %pick, "Resolved tie");
                    result = vec![pick];
                }
            }
        }

        for rule in &self.overrides {
            if rule.applies(&result, ctx) {
                let replaced = rule.apply(result.clone(), ctx).await;
                if replaced != result {
                    info!(
                        rule = rule.name(),
                        before = ?keys_display(&result),
                        after = ?keys_display(&replaced),
                        "Override applied"
                    );
                }
                result = replaced;
            }
        }

        if result.is_empty() {
            for step in &self.ladder {
                let found = step.attempt(ctx).await;
                if !found.is_empty() {
                    info!(step = step.name(), result = ?keys_display(&found), "Escalation found a cause");
                    result = found;
                    break;
                }
            }
        }
        result
    }

    async fn reduce_signals(
        &self,
        pool: &mut CandidatePool,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Vec<Candidate> {
        let prober = ctx.prober;
        let config = prober.config();

        stages::narrow_latency_by_amplitude(pool, ctx.ledger);
        stages::filter_cpu_ramps(pool, &config.ramp, ctx.ledger);
        stages::keep_most_frequent(pool);

        let frontend = CandidateKey::new(
            config.arbiter.frontend_service.clone(),
            Category::NetworkLatency,
        );
        let frontend_candidate = pool.get(&frontend).cloned();
        stages::prune_downstream(pool, Category::NetworkLatency, ctx.topology);
        if let Some(candidate) = frontend_candidate {
            let entry = prober.probe_entry_latency(&frontend.service).await;
            if entry.is_anomalous() {
                if let Some(verdict) = entry.verdict() {
                    ctx.ledger.record(
                        &frontend,
                        describe(&frontend.service, "entry span latency", &verdict),
                    );
                }
                info!(service = %frontend.service, "Entry latency confirmed, collapsing latency candidates");
                pool.replace(Category::NetworkLatency, vec![candidate]);
                ctx.frontend_confirmed = true;
            }
        }

        stages::corroborate_with_latency(pool, ctx.ledger);
        let per_service = stages::reduce_per_service(pool, &config.arbiter.priorities);
        stages::reduce_global(per_service, &config.arbiter.priorities)
    }

    fn reduce_errors(
        &self,
        pool: &mut CandidatePool,
        ctx: &mut ArbitrationContext<'_>,
    ) -> Vec<Candidate> {
        stages::prune_downstream(pool, Category::Failure, ctx.topology);
        stages::keep_highest_error_rate(pool, ctx.ledger);
        pool.list(Category::Failure).to_vec()
    }
}

fn keys_display(keys: &[CandidateKey]) -> Vec<String> {
    keys.iter().map(ToString::to_string).collect()
}
