use crate::models::CandidateKey;
use std::collections::HashMap;

/// Human-readable justifications keyed by candidate.
#[derive(Debug, Clone, Default)]
pub struct EvidenceLedger {
    entries: HashMap<CandidateKey, Vec<String>>,
}

impl EvidenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `text` unless the key already holds it.
    pub fn record(&mut self, key: &CandidateKey, text: impl Into<String>) {
        let text = text.into();
        let entries = self.entries.entry(key.clone()).or_default();
        if !entries.contains(&text) {
            entries.push(text);
        }
    }

    pub fn entries(&self, key: &CandidateKey) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Evidence for `keys` in order, first occurrence of each sentence kept.
    pub fn collect(&self, keys: &[CandidateKey]) -> Vec<String> {
        let mut collected: Vec<String> = Vec::new();
        for text in keys.iter().flat_map(|key| self.entries(key)) {
            if !collected.contains(text) {
                collected.push(text.clone());
            }
        }
        collected
    }
}
