use crate::{
    classifier::AnomalyVerdict,
    models::{CandidateKey, Category, MetricSeries},
};
use std::collections::BTreeMap;

/// A proposed root cause plus the data needed to rank it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: CandidateKey,
    /// Raw series kept for ramp ranking.
    pub snapshot: Option<MetricSeries>,
    /// Before/target/after statistics kept for amplitude ranking.
    pub verdict: Option<AnomalyVerdict>,
    /// Category-specific magnitude (peak, amplitude, error rate).
    pub score: f64,
}

impl Candidate {
    pub fn new(service: impl Into<String>, category: Category) -> Self {
        Self {
            key: CandidateKey::new(service, category),
            snapshot: None,
            verdict: None,
            score: 0.0,
        }
    }

    pub fn with_verdict(mut self, verdict: AnomalyVerdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn with_snapshot(mut self, snapshot: MetricSeries) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn service(&self) -> &str {
        &self.key.service
    }

    pub fn category(&self) -> Category {
        self.key.category
    }
}

/// Candidate lists per category, each in insertion order.
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    lists: BTreeMap<Category, Vec<Candidate>>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the `(service, category)` pair is already present.
    pub fn insert(&mut self, candidate: Candidate) -> bool {
        let list = self.lists.entry(candidate.category()).or_default();
        if list.iter().any(|existing| existing.key == candidate.key) {
            return false;
        }
        list.push(candidate);
        true
    }

    pub fn list(&self, category: Category) -> &[Candidate] {
        self.lists.get(&category).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len_of(&self, category: Category) -> usize {
        self.list(category).len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.values().all(Vec::is_empty)
    }

    pub fn contains(&self, key: &CandidateKey) -> bool {
        self.list(key.category).iter().any(|c| &c.key == key)
    }

    pub fn get(&self, key: &CandidateKey) -> Option<&Candidate> {
        self.list(key.category).iter().find(|c| &c.key == key)
    }

    pub fn services(&self, category: Category) -> Vec<String> {
        self.list(category)
            .iter()
            .map(|c| c.key.service.clone())
            .collect()
    }

    pub fn retain(&mut self, category: Category, mut keep: impl FnMut(&Candidate) -> bool) {
        if let Some(list) = self.lists.get_mut(&category) {
            list.retain(|c| keep(c));
        }
    }

    pub fn replace(&mut self, category: Category, candidates: Vec<Candidate>) {
        self.lists.insert(category, candidates);
    }

    /// All candidates, cpu first, then memory, networkLatency, jvmChaos, disk,
    /// networkLoss, podKiller, Failure.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.lists.values().flatten()
    }

    pub fn keys(&self) -> Vec<CandidateKey> {
        self.iter().map(|c| c.key.clone()).collect()
    }
}
