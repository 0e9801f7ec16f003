//! Deterministic reductions over a [`CandidatePool`].
//!
//! Each stage is a plain function so it can be tested on hand-built pools.
//! Stages on empty lists are no-ops.

use crate::{
    candidates::{Candidate, CandidatePool},
    config::{CategoryPriorities, RampConfig},
    evidence::EvidenceLedger,
    models::Category,
    ramp::detect_ramp,
    topology::Topology,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

const FREQUENCY_CATEGORIES: [Category; 4] = [
    Category::Cpu,
    Category::Memory,
    Category::NetworkLatency,
    Category::JvmChaos,
];

/// Candidate with the largest before/after amplitude; first wins ties.
/// Candidates without a usable amplitude are skipped.
pub fn amplitude_winner<'a>(
    candidates: impl IntoIterator<Item = &'a Candidate>,
) -> Option<(&'a Candidate, f64)> {
    candidates
        .into_iter()
        .filter_map(|candidate| {
            let amplitude = candidate.verdict.as_ref()?.amplitude()?;
            Some((candidate, amplitude))
        })
        .fold(None, |best, (candidate, amplitude)| match best {
            Some((_, top)) if amplitude <= top => best,
            _ => Some((candidate, amplitude)),
        })
}

/// With only latency candidates, keeps the one that moved the most.
pub fn narrow_latency_by_amplitude(pool: &mut CandidatePool, ledger: &mut EvidenceLedger) {
    let competing = [Category::Cpu, Category::Memory, Category::JvmChaos];
    if pool.len_of(Category::NetworkLatency) < 2
        || competing.iter().any(|category| pool.len_of(*category) > 0)
    {
        return;
    }

    let latency = pool.list(Category::NetworkLatency);
    let Some((winner, amplitude)) = amplitude_winner(latency) else {
        return;
    };
    let winner = winner.clone();
    ledger.record(
        &winner.key,
        format!(
            "{} has the largest latency amplitude ({amplitude:.2}) of {} latency candidates",
            winner.service(),
            latency.len()
        ),
    );
    info!(service = winner.service(), amplitude, "Narrowed latency candidates by amplitude");
    pool.replace(Category::NetworkLatency, vec![winner]);
}

/// Drops cpu candidates whose rise started at the edge of the query window.
pub fn filter_cpu_ramps(pool: &mut CandidatePool, ramp: &RampConfig, ledger: &mut EvidenceLedger) {
    if pool.len_of(Category::Cpu) <= 1 {
        return;
    }

    let mut kept = Vec::new();
    for candidate in pool.list(Category::Cpu) {
        let Some(snapshot) = &candidate.snapshot else {
            kept.push(candidate.clone());
            continue;
        };
        let verdict = detect_ramp(snapshot.values(), &ramp.params);
        if !verdict.inside_target(&ramp.edges) {
            info!(
                service = candidate.service(),
                start = ?verdict.start_index,
                peak = ?verdict.peak_index,
                "Dropped cpu candidate ramping at the window edge"
            );
            continue;
        }
        if let (Some(start), Some(peak)) = (verdict.start_index, verdict.peak_index) {
            ledger.record(
                &candidate.key,
                format!(
                    "{} CPU ramp starts at sample {start} and peaks at sample {peak}, inside the alarm",
                    candidate.service()
                ),
            );
        }
        kept.push(candidate.clone());
    }
    pool.replace(Category::Cpu, kept);
}

/// Keeps only services named by the most signal lists.
pub fn keep_most_frequent(pool: &mut CandidatePool) {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for category in FREQUENCY_CATEGORIES {
        for service in pool.services(category) {
            *counts.entry(service).or_default() += 1;
        }
    }
    let Some(max) = counts.values().copied().max() else {
        return;
    };
    let frequent: BTreeSet<String> = counts
        .into_iter()
        .filter(|(_, count)| *count == max)
        .map(|(service, _)| service)
        .collect();

    for category in FREQUENCY_CATEGORIES {
        pool.retain(category, |candidate| frequent.contains(candidate.service()));
    }
}

/// Keeps the candidates of `category` that call no other candidate of it.
pub fn prune_downstream(pool: &mut CandidatePool, category: Category, topology: &Topology) {
    let services: BTreeSet<String> = pool.services(category).into_iter().collect();
    if services.len() < 2 {
        return;
    }
    let deepest = topology.most_downstream(&services);
    if deepest.len() < services.len() {
        info!(
            category = category.as_str(),
            before = services.len(),
            after = deepest.len(),
            "Pruned upstream candidates"
        );
    }
    pool.retain(category, |candidate| deepest.contains(candidate.service()));
}

/// When several services show resource anomalies, trusts those that also
/// show latency.
pub fn corroborate_with_latency(pool: &mut CandidatePool, ledger: &mut EvidenceLedger) {
    let latency: BTreeSet<String> = pool.services(Category::NetworkLatency).into_iter().collect();
    if latency.is_empty() {
        return;
    }
    let resource: BTreeSet<String> = pool
        .services(Category::Cpu)
        .into_iter()
        .chain(pool.services(Category::Memory))
        .collect();
    if resource.len() <= 1 {
        return;
    }

    for category in [Category::Cpu, Category::Memory] {
        pool.retain(category, |candidate| latency.contains(candidate.service()));
    }
    for candidate in pool
        .list(Category::Cpu)
        .iter()
        .chain(pool.list(Category::Memory))
    {
        ledger.record(
            &candidate.key,
            format!(
                "{} {} anomaly is corroborated by its own latency anomaly",
                candidate.service(),
                candidate.category()
            ),
        );
    }
}

/// Highest-priority candidate per service; the first seen wins ties.
/// Output follows the order in which services first appear.
pub fn reduce_per_service(pool: &CandidatePool, priorities: &CategoryPriorities) -> Vec<Candidate> {
    let mut best: Vec<Candidate> = Vec::new();
    for candidate in pool.iter() {
        match best
            .iter_mut()
            .find(|kept| kept.service() == candidate.service())
        {
            Some(kept) => {
                if priorities.of(candidate.category()) > priorities.of(kept.category()) {
                    *kept = candidate.clone();
                }
            }
            None => best.push(candidate.clone()),
        }
    }
    best
}

/// Keeps the single category that first reaches the highest priority.
pub fn reduce_global(candidates: Vec<Candidate>, priorities: &CategoryPriorities) -> Vec<Candidate> {
    let Some(max) = candidates
        .iter()
        .map(|candidate| priorities.of(candidate.category()))
        .max()
    else {
        return candidates;
    };
    let Some(winning) = candidates
        .iter()
        .map(Candidate::category)
        .find(|category| priorities.of(*category) == max)
    else {
        return candidates;
    };
    candidates
        .into_iter()
        .filter(|candidate| candidate.category() == winning)
        .collect()
}

/// Keeps the Failure candidate with the highest error rate.
pub fn keep_highest_error_rate(pool: &mut CandidatePool, ledger: &mut EvidenceLedger) {
    let failures = pool.list(Category::Failure);
    if failures.len() < 2 {
        return;
    }
    let Some(top) = failures
        .iter()
        .fold(None, |best: Option<&Candidate>, candidate| match best {
            Some(kept) if candidate.score <= kept.score => best,
            _ => Some(candidate),
        })
        .cloned()
    else {
        return;
    };
    ledger.record(
        &top.key,
        format!(
            "{} has the highest error rate ({:.2}/min) of {} failing services",
            top.service(),
            top.score,
            failures.len()
        ),
    );
    pool.replace(Category::Failure, vec![top]);
}
