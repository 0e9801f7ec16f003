use crate::{candidates::CandidatePool, models::CandidateKey};
use async_trait::async_trait;

/// Tie-breaker consulted when arbitration leaves several equally ranked
/// candidates.
///
/// Returning `None`, or a key outside `tied`, keeps every tied candidate.
#[async_trait]
pub trait AmbiguityResolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, tied: &[CandidateKey], pool: &CandidatePool) -> Option<CandidateKey>;
}

/// Leaves ties unresolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

#[async_trait]
impl AmbiguityResolver for KeepAll {
    fn name(&self) -> &'static str {
        "KeepAll"
    }

    async fn resolve(&self, _tied: &[CandidateKey], _pool: &CandidatePool) -> Option<CandidateKey> {
        None
    }
}

/// Picks the tied candidate with the highest probe score.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestScore;

#[async_trait]
impl AmbiguityResolver for HighestScore {
    fn name(&self) -> &'static str {
        "HighestScore"
    }

    async fn resolve(&self, tied: &[CandidateKey], pool: &CandidatePool) -> Option<CandidateKey> {
        tied.iter()
            .filter_map(|key| pool.get(key))
            .fold(None, |best: Option<(&CandidateKey, f64)>, candidate| match best {
                Some((_, top)) if candidate.score <= top => best,
                _ => Some((&candidate.key, candidate.score)),
            })
            .map(|(key, _)| key.clone())
    }
}
