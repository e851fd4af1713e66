//! Watering advice from the current moisture reading.

use serde::Serialize;

use crate::reading::PumpState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Critical,
    Urgent,
    Suggested,
    Optimal,
    Good,
    Warning,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Critical => "CRITICAL",
            Level::Urgent => "URGENT",
            Level::Suggested => "SUGGESTED",
            Level::Optimal => "OPTIMAL",
            Level::Good => "GOOD",
            Level::Warning => "WARNING",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub icon: &'static str,
    pub level: Level,
    pub message: &'static str,
    pub color: &'static str,
}

/// Tiers keyed by exclusive upper bound.  The last tier has no bound.
const TIERS: &[(f64, Recommendation)] = &[
    (
        20.0,
        Recommendation {
            icon: "🚨",
            level: Level::Critical,
            message: "Soil critically dry! Water immediately for 15-20 minutes.",
            color: "#F44336",
        },
    ),
    (
        30.0,
        Recommendation {
            icon: "⚠",
            level: Level::Urgent,
            message: "Soil is dry. Water now for 10-15 minutes.",
            color: "#FF9800",
        },
    ),
    (
        45.0,
        Recommendation {
            icon: "💡",
            level: Level::Suggested,
            message: "Moisture low. Short watering (5-10 min) recommended.",
            color: "#FFC107",
        },
    ),
    (
        70.0,
        Recommendation {
            icon: "✅",
            level: Level::Optimal,
            message: "Soil healthy! No watering needed today.",
            color: "#4CAF50",
        },
    ),
    (
        85.0,
        Recommendation {
            icon: "💧",
            level: Level::Good,
            message: "Soil adequately moist. Skip watering.",
            color: "#2196F3",
        },
    ),
];

const SATURATED: Recommendation = Recommendation {
    icon: "🛑",
    level: Level::Warning,
    message: "Soil saturated! Risk of overwatering. Stop pump!",
    color: "#9C27B0",
};

/// Pick the advice tier for `moisture`.
///
/// `_pump` is part of the signature but does not influence the result:
/// advice depends on moisture alone.
pub fn recommend(moisture: f64, _pump: PumpState) -> Recommendation {
    TIERS
        .iter()
        .find(|(bound, _)| moisture < *bound)
        .map(|(_, r)| *r)
        .unwrap_or(SATURATED)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn level(m: f64) -> Level {
        recommend(m, PumpState::Off).level
    }

    #[test]
    fn critical_below_20() {
        assert_eq!(level(19.9), Level::Critical);
        assert_eq!(level(-5.0), Level::Critical);
    }

    #[test]
    fn urgent_from_20() {
        assert_eq!(level(20.0), Level::Urgent);
        assert_eq!(level(29.9), Level::Urgent);
    }

    #[test]
    fn suggested_from_30() {
        assert_eq!(level(30.0), Level::Suggested);
        assert_eq!(level(44.9), Level::Suggested);
    }

    #[test]
    fn optimal_from_45() {
        assert_eq!(level(45.0), Level::Optimal);
        assert_eq!(level(69.9), Level::Optimal);
    }

    #[test]
    fn good_from_70() {
        assert_eq!(level(70.0), Level::Good);
        assert_eq!(level(84.9), Level::Good);
    }

    #[test]
    fn warning_from_85() {
        assert_eq!(level(85.0), Level::Warning);
        assert_eq!(level(140.0), Level::Warning);
    }

    #[test]
    fn pump_status_does_not_change_advice() {
        for m in [5.0, 25.0, 40.0, 60.0, 80.0, 95.0] {
            assert_eq!(recommend(m, PumpState::On), recommend(m, PumpState::Off));
        }
    }

    #[test]
    fn messages_are_verbatim() {
        assert_eq!(
            recommend(10.0, PumpState::Off).message,
            "Soil critically dry! Water immediately for 15-20 minutes."
        );
        assert_eq!(
            recommend(90.0, PumpState::Off).message,
            "Soil saturated! Risk of overwatering. Stop pump!"
        );
    }

    #[test]
    fn serializes_level_uppercase() {
        let json = serde_json::to_value(recommend(50.0, PumpState::Off)).unwrap();
        assert_eq!(json["level"], "OPTIMAL");
        assert_eq!(json["color"], "#4CAF50");
    }
}
