//! Summary statistics over a moisture window.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::condition::{classify, Condition};
use crate::reading::Reading;

fn moisture_values(readings: &[Reading]) -> Vec<f64> {
    readings.iter().filter_map(Reading::moisture).collect()
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoistureSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample standard deviation; `None` with fewer than two values.
    pub std_dev: Option<f64>,
}

impl MoistureSummary {
    /// `None` when no reading carries a numeric value.
    pub fn from_readings(readings: &[Reading]) -> Option<Self> {
        let values = moisture_values(readings);
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let std_dev = (count > 1).then(|| {
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            var.sqrt()
        });

        Some(Self {
            count,
            mean,
            min,
            max,
            std_dev,
        })
    }
}

// ---------------------------------------------------------------------------
// Trend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trend {
    pub average: f64,
    pub delta: f64,
    pub direction: TrendDirection,
}

/// Change from the first to the last numeric reading, plus their average.
/// Needs at least two numeric readings.
pub fn trend(readings: &[Reading]) -> Option<Trend> {
    let values = moisture_values(readings);
    let (first, last) = match values.as_slice() {
        [first, .., last] => (*first, *last),
        _ => return None,
    };

    let delta = last - first;
    let direction = if delta > 0.0 {
        TrendDirection::Increasing
    } else if delta < 0.0 {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };

    Some(Trend {
        average: values.iter().sum::<f64>() / values.len() as f64,
        delta,
        direction,
    })
}

// ---------------------------------------------------------------------------
// Condition distribution / efficiency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EfficiencyRating {
    Excellent,
    Good,
    Fair,
    #[serde(rename = "Needs Improvement")]
    NeedsImprovement,
}

impl EfficiencyRating {
    pub fn from_pct(pct: f64) -> Self {
        if pct >= 70.0 {
            EfficiencyRating::Excellent
        } else if pct >= 50.0 {
            EfficiencyRating::Good
        } else if pct >= 30.0 {
            EfficiencyRating::Fair
        } else {
            EfficiencyRating::NeedsImprovement
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConditionDistribution {
    pub counts: BTreeMap<Condition, usize>,
    pub total: usize,
}

impl ConditionDistribution {
    pub fn from_readings(readings: &[Reading]) -> Self {
        let mut dist = Self::default();
        for m in moisture_values(readings) {
            *dist.counts.entry(classify(m)).or_insert(0) += 1;
            dist.total += 1;
        }
        dist
    }

    pub fn count(&self, condition: Condition) -> usize {
        self.counts.get(&condition).copied().unwrap_or(0)
    }

    /// Share of readings in each condition, in percent.
    pub fn percentages(&self) -> BTreeMap<Condition, f64> {
        self.counts
            .iter()
            .map(|(c, n)| (*c, *n as f64 * 100.0 / self.total as f64))
            .collect()
    }

    /// Share of readings in the optimal band, in percent.
    pub fn efficiency_pct(&self) -> Option<f64> {
        (self.total > 0).then(|| self.count(Condition::Moist) as f64 * 100.0 / self.total as f64)
    }

    pub fn efficiency_rating(&self) -> Option<EfficiencyRating> {
        self.efficiency_pct().map(EfficiencyRating::from_pct)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
