//! Soil condition bands derived from a moisture percentage.

use serde::Serialize;

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    VeryDry,
    Dry,
    Moist,
    Wet,
}

/// Upper bounds (exclusive) checked in order; anything past the last bound
/// is `Wet`.
const BANDS: &[(f64, Condition)] = &[
    (25.0, Condition::VeryDry),
    (45.0, Condition::Dry),
    (70.0, Condition::Moist),
];

/// Map a moisture percentage to a soil condition.  Total over all `f64`
/// values: negatives are `VeryDry`, values above 100 (and NaN) are `Wet`.
pub fn classify(moisture: f64) -> Condition {
    BANDS
        .iter()
        .find(|(bound, _)| moisture < *bound)
        .map(|(_, c)| *c)
        .unwrap_or(Condition::Wet)
}

impl Condition {
    pub const ALL: [Condition; 4] = [
        Condition::VeryDry,
        Condition::Dry,
        Condition::Moist,
        Condition::Wet,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Condition::VeryDry => "Very Dry",
            Condition::Dry => "Dry",
            Condition::Moist => "Moist",
            Condition::Wet => "Wet",
        }
    }

    /// Higher is more urgent.  Monotonically non-increasing in moisture.
    pub fn severity_rank(&self) -> u8 {
        match self {
            Condition::VeryDry => 3,
            Condition::Dry => 2,
            Condition::Moist => 1,
            Condition::Wet => 0,
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Condition::VeryDry => "#F44336",
            Condition::Dry => "#FF9800",
            Condition::Moist => "#4CAF50",
            Condition::Wet => "#2196F3",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Condition::VeryDry => "🔴",
            Condition::Dry => "🟠",
            Condition::Moist => "🟢",
            Condition::Wet => "🔵",
        }
    }

    pub fn status_text(&self) -> &'static str {
        match self {
            Condition::VeryDry => "Critical",
            Condition::Dry => "Action Needed",
            Condition::Moist => "Optimal",
            Condition::Wet => "Saturated",
        }
    }

    /// Presentation bundle for the JSON API.
    pub fn describe(&self) -> ConditionView {
        ConditionView {
            condition: *self,
            label: self.label(),
            severity_rank: self.severity_rank(),
            color: self.color(),
            icon: self.icon(),
            status_text: self.status_text(),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConditionView {
    pub condition: Condition,
    pub label: &'static str,
    pub severity_rank: u8,
    pub color: &'static str,
    pub icon: &'static str,
    pub status_text: &'static str,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Boundaries ---------------------------------------------------------

    #[test]
    fn very_dry_below_25() {
        assert_eq!(classify(24.9), Condition::VeryDry);
        assert_eq!(classify(0.0), Condition::VeryDry);
    }

    #[test]
    fn dry_from_25_to_below_45() {
        assert_eq!(classify(25.0), Condition::Dry);
        assert_eq!(classify(44.9), Condition::Dry);
    }

    #[test]
    fn moist_from_45_to_below_70() {
        assert_eq!(classify(45.0), Condition::Moist);
        assert_eq!(classify(69.9), Condition::Moist);
    }

    #[test]
    fn wet_from_70() {
        assert_eq!(classify(70.0), Condition::Wet);
        assert_eq!(classify(100.0), Condition::Wet);
    }

    // -- Totality -----------------------------------------------------------

    #[test]
    fn negative_is_very_dry() {
        assert_eq!(classify(-12.0), Condition::VeryDry);
    }

    #[test]
    fn above_hundred_is_wet() {
        assert_eq!(classify(250.0), Condition::Wet);
    }

    #[test]
    fn nan_does_not_panic() {
        assert_eq!(classify(f64::NAN), Condition::Wet);
    }

    // -- Monotonic severity -------------------------------------------------

    #[test]
    fn severity_never_increases_with_moisture() {
        let mut prev = classify(-10.0).severity_rank();
        let mut m = -10.0;
        while m <= 110.0 {
            let rank = classify(m).severity_rank();
            assert!(rank <= prev, "severity rose at moisture {m}");
            prev = rank;
            m += 0.5;
        }
    }

    // -- Presentation -------------------------------------------------------

    #[test]
    fn status_text_matches_band() {
        assert_eq!(classify(10.0).status_text(), "Critical");
        assert_eq!(classify(30.0).status_text(), "Action Needed");
        assert_eq!(classify(50.0).status_text(), "Optimal");
        assert_eq!(classify(90.0).status_text(), "Saturated");
    }

    #[test]
    fn describe_serializes_label_and_rank() {
        let json = serde_json::to_value(classify(30.0).describe()).unwrap();
        assert_eq!(json["label"], "Dry");
        assert_eq!(json["severity_rank"], 2);
        assert_eq!(json["condition"], "dry");
        assert_eq!(json["color"], "#FF9800");
    }
}
