//! Before/during/after anomaly classification.
//!
//! A series is anomalous when the alarm bucket is elevated relative to the
//! surrounding baseline *and* forms a bump: it must exceed both neighbours.
//! A monotonic climb that started before the alarm and kept going after it
//! is therefore never anomalous.

use serde::{Deserialize, Serialize};

/// Threshold parameters for [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierProfile {
    /// Target must exceed `baseline * ratio` (default: 1.5)
    pub ratio: f64,
    /// Tighten the ratio for already-high baselines (default: true)
    pub adaptive: bool,
    /// Baseline above which the tightened ratio applies (default: 40.0)
    pub tighten_above: f64,
    /// Ratio used above `tighten_above` (default: 1.25)
    pub tightened_ratio: f64,
    /// Absolute elevation that also counts, for low baselines (default: none)
    pub absolute_floor: Option<f64>,
}

impl Default for ClassifierProfile {
    fn default() -> Self {
        Self::utilization()
    }
}

impl ClassifierProfile {
    /// Pod CPU and memory percentages.
    pub const fn utilization() -> Self {
        Self {
            ratio: 1.5,
            adaptive: true,
            tighten_above: 40.0,
            tightened_ratio: 1.25,
            absolute_floor: None,
        }
    }

    /// Host utilization and JVM GC deltas.
    pub const fn saturation() -> Self {
        Self {
            absolute_floor: Some(20.0),
            ..Self::utilization()
        }
    }

    /// Network counters.
    pub const fn count() -> Self {
        Self {
            adaptive: false,
            ..Self::utilization()
        }
    }

    fn ratio_for(&self, baseline: f64) -> f64 {
        if self.adaptive && baseline > self.tighten_above {
            self.tightened_ratio
        } else {
            self.ratio
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    pub is_anomalous: bool,
    pub target_avg: f64,
    pub pre_avg: f64,
    pub post_avg: f64,
    /// Maximum of the target bucket, zero when empty.
    pub peak: f64,
}

impl AnomalyVerdict {
    pub fn absent() -> Self {
        Self::default()
    }

    /// `(t - b)/b + (t - a)/a`, or `None` when either side is zero.
    pub fn amplitude(&self) -> Option<f64> {
        if self.pre_avg == 0.0 || self.post_avg == 0.0 {
            return None;
        }
        Some(
            (self.target_avg - self.pre_avg) / self.pre_avg
                + (self.target_avg - self.post_avg) / self.post_avg,
        )
    }
}

pub fn classify(
    pre: &[f64],
    target: &[f64],
    post: &[f64],
    profile: &ClassifierProfile,
) -> AnomalyVerdict {
    let (Some(pre_avg), Some(target_avg), Some(post_avg)) = (mean(pre), mean(target), mean(post))
    else {
        return AnomalyVerdict::absent();
    };

    let baseline = (pre_avg + post_avg) / 2.0;
    let ratio = profile.ratio_for(baseline);

    let elevated = target_avg > baseline * ratio
        || profile
            .absolute_floor
            .is_some_and(|floor| target_avg > baseline + floor);
    let bump = pre_avg < target_avg && post_avg < target_avg;

    AnomalyVerdict {
        is_anomalous: elevated && bump,
        target_avg,
        pre_avg,
        post_avg,
        peak: peak(target),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Median,
    Mean,
}

impl Statistic {
    fn reduce(self, values: &[f64]) -> Option<f64> {
        match self {
            Statistic::Median => median(values),
            Statistic::Mean => mean(values),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rise,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticRule {
    pub statistic: Statistic,
    pub ratio: f64,
    pub direction: Direction,
    /// A present target with a missing neighbour counts as anomalous.
    pub allow_missing_baseline: bool,
}

/// Compares the target bucket against each neighbour separately.
pub fn classify_statistic(
    pre: &[f64],
    target: &[f64],
    post: &[f64],
    rule: &StatisticRule,
) -> AnomalyVerdict {
    let reduced = (
        rule.statistic.reduce(pre),
        rule.statistic.reduce(target),
        rule.statistic.reduce(post),
    );
    compare_buckets(reduced, peak(target), rule)
}

/// Error counters: each bucket becomes `sum / minutes`, then a rising
/// comparison that accepts a missing neighbour.
pub fn classify_rate(
    pre: &[f64],
    target: &[f64],
    post: &[f64],
    minutes: f64,
    ratio: f64,
) -> AnomalyVerdict {
    let minutes = if minutes > 0.0 { minutes } else { 1.0 };
    let rate = |values: &[f64]| (!values.is_empty()).then(|| values.iter().sum::<f64>() / minutes);
    let rule = StatisticRule {
        statistic: Statistic::Mean,
        ratio,
        direction: Direction::Rise,
        allow_missing_baseline: true,
    };
    compare_buckets((rate(pre), rate(target), rate(post)), peak(target), &rule)
}

fn compare_buckets(
    (pre, target, post): (Option<f64>, Option<f64>, Option<f64>),
    peak: f64,
    rule: &StatisticRule,
) -> AnomalyVerdict {
    let Some(target_avg) = target else {
        return AnomalyVerdict::absent();
    };

    let is_anomalous = match (pre, post) {
        (Some(pre), Some(post)) => match rule.direction {
            Direction::Rise => target_avg > pre * rule.ratio && target_avg > post * rule.ratio,
            Direction::Drop => target_avg * rule.ratio < pre && target_avg * rule.ratio < post,
        },
        _ => rule.allow_missing_baseline && rule.direction == Direction::Rise,
    };

    AnomalyVerdict {
        is_anomalous,
        target_avg,
        pre_avg: pre.unwrap_or_default(),
        post_avg: post.unwrap_or_default(),
        peak,
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted.get(mid).copied()
    } else {
        let upper = sorted.get(mid)?;
        let lower = sorted.get(mid.checked_sub(1)?)?;
        Some((lower + upper) / 2.0)
    }
}

fn peak(values: &[f64]) -> f64 {
    values.iter().copied().reduce(f64::max).unwrap_or_default()
}
