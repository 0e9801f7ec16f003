//! Sudden-rise detection on raw CPU series.
//!
//! Used to tell a ramp that starts inside the alarm window from one that was
//! already under way at the left edge of the query.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampParams {
    /// Leading differences used as the quiet baseline (default: 5)
    pub baseline_window: usize,
    /// Threshold is `mean + factor * stddev` of the baseline (default: 3.0)
    pub threshold_factor: f64,
    /// Quiet differences in a row that end a ramp (default: 3)
    pub consecutive: usize,
}

impl Default for RampParams {
    fn default() -> Self {
        Self {
            baseline_window: 5,
            threshold_factor: 3.0,
            consecutive: 3,
        }
    }
}

/// Minimum positions a ramp must reach to count as inside the target bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeLimits {
    /// Ramps starting at or before this index are edge effects (default: 8)
    pub min_start: usize,
    /// Ramps peaking at or before this index are edge effects (default: 12)
    pub min_peak: usize,
}

impl Default for EdgeLimits {
    fn default() -> Self {
        Self {
            min_start: 8,
            min_peak: 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RampVerdict {
    pub start_index: Option<usize>,
    pub end_index: Option<usize>,
    pub peak_value: Option<f64>,
    pub peak_index: Option<usize>,
}

impl RampVerdict {
    pub fn has_ramp(&self) -> bool {
        self.start_index.is_some()
    }

    /// A verdict without a ramp is kept.
    pub fn inside_target(&self, limits: &EdgeLimits) -> bool {
        match (self.start_index, self.peak_index) {
            (Some(start), Some(peak)) => start > limits.min_start && peak > limits.min_peak,
            _ => true,
        }
    }
}

pub fn detect_ramp(values: &[f64], params: &RampParams) -> RampVerdict {
    let diffs: Vec<f64> = values
        .windows(2)
        .filter_map(|pair| match pair {
            [a, b] => Some((b - a).abs()),
            _ => None,
        })
        .collect();

    let Some(baseline) = diffs.get(..params.baseline_window) else {
        return RampVerdict::default();
    };
    if baseline.is_empty() {
        return RampVerdict::default();
    }

    let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
    let variance = baseline.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / baseline.len() as f64;
    let threshold = mean + params.threshold_factor * variance.sqrt();

    let Some(start_diff) = diffs
        .iter()
        .enumerate()
        .skip(params.baseline_window)
        .find_map(|(i, d)| (*d > threshold).then_some(i))
    else {
        return RampVerdict::default();
    };
    let start = start_diff + 1;

    let last = values.len().saturating_sub(1);
    let mut end = last;
    let mut quiet = 0;
    for (i, d) in diffs.iter().enumerate().skip(start.saturating_sub(1)) {
        if *d <= threshold {
            quiet += 1;
        } else {
            quiet = 0;
        }
        if quiet >= params.consecutive {
            end = i + 1;
            break;
        }
    }

    let peak = values
        .get(start..=end)
        .into_iter()
        .flatten()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (offset, value)| match best {
            Some((_, top)) if *value <= top => best,
            _ => Some((start + offset, *value)),
        });

    RampVerdict {
        start_index: Some(start),
        end_index: Some(end),
        peak_value: peak.map(|(_, value)| value),
        peak_index: peak.map(|(index, _)| index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_then_ramp(flat: usize, ramp: &[f64], tail: usize) -> Vec<f64> {
        let mut values = vec![10.0; flat];
        values.extend_from_slice(ramp);
        values.extend(std::iter::repeat_n(
            ramp.last().copied().unwrap_or(10.0),
            tail,
        ));
        values
    }

    #[test]
    fn too_short_series_has_no_ramp() {
        let verdict = detect_ramp(&[1.0, 2.0, 3.0], &RampParams::default());
        assert!(!verdict.has_ramp());
        assert!(verdict.inside_target(&EdgeLimits::default()));
    }

    #[test]
    fn flat_series_has_no_ramp() {
        let verdict = detect_ramp(&[5.0; 20], &RampParams::default());
        assert_eq!(verdict, RampVerdict::default());
    }

    #[test]
    fn finds_start_end_and_peak() {
        // 12 flat points, then a climb at index 12
        let values = flat_then_ramp(12, &[30.0, 60.0, 90.0], 6);
        let verdict = detect_ramp(&values, &RampParams::default());

        assert_eq!(verdict.start_index, Some(12));
        assert_eq!(verdict.peak_value, Some(90.0));
        assert_eq!(verdict.peak_index, Some(14));
        // quiet run of three differences after the plateau starts at 15
        assert_eq!(verdict.end_index, Some(17));
        assert!(verdict.inside_target(&EdgeLimits::default()));
    }

    #[test]
    fn early_ramp_is_an_edge_effect() {
        let values = flat_then_ramp(7, &[40.0, 80.0], 10);
        let verdict = detect_ramp(&values, &RampParams::default());

        assert_eq!(verdict.start_index, Some(7));
        assert!(!verdict.inside_target(&EdgeLimits::default()));
    }

    #[test]
    fn short_burst_near_the_start_is_rejected() {
        let values = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 40.0, 41.0, 39.0, 2.0, 1.0, 1.0];
        let verdict = detect_ramp(&values, &RampParams::default());

        assert_eq!(verdict.start_index, Some(6));
        assert_eq!(verdict.peak_value, Some(41.0));
        assert_eq!(verdict.peak_index, Some(7));
        assert!(!verdict.inside_target(&EdgeLimits::default()));
    }

    #[test]
    fn repeated_calls_agree() {
        let values = flat_then_ramp(10, &[25.0, 70.0], 8);
        let params = RampParams::default();
        assert_eq!(detect_ramp(&values, &params), detect_ramp(&values, &params));
    }
}
