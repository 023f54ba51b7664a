use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const DEFAULT_ATTENDANCE_THRESHOLD: f64 = 94.0;

/// Number of raised flags at which a counselor follow-up is required.
pub const INTERVENTION_FLAG_COUNT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrowthStatus {
    Exceeds,
    Meets,
    Below,
    #[default]
    NoData,
}

impl GrowthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrowthStatus::Exceeds => "EXCEEDS",
            GrowthStatus::Meets => "MEETS",
            GrowthStatus::Below => "BELOW",
            GrowthStatus::NoData => "NO_DATA",
        }
    }
}

impl fmt::Display for GrowthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrowthStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "EXCEEDS" => Ok(GrowthStatus::Exceeds),
            "MEETS" => Ok(GrowthStatus::Meets),
            "BELOW" => Ok(GrowthStatus::Below),
            "NO_DATA" => Ok(GrowthStatus::NoData),
            other => Err(AppError::validation(
                "growth_status",
                format!("unknown growth status '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudentStatus {
    OnTrack,
    Watch,
    AtRisk,
    HighRisk,
}

impl StudentStatus {
    pub const ALL: [StudentStatus; 4] = [
        StudentStatus::OnTrack,
        StudentStatus::Watch,
        StudentStatus::AtRisk,
        StudentStatus::HighRisk,
    ];

    pub fn from_flag_count(count: u8) -> Self {
        match count {
            0 => StudentStatus::OnTrack,
            1 => StudentStatus::Watch,
            2 => StudentStatus::AtRisk,
            _ => StudentStatus::HighRisk,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StudentStatus::OnTrack => "ON_TRACK",
            StudentStatus::Watch => "WATCH",
            StudentStatus::AtRisk => "AT_RISK",
            StudentStatus::HighRisk => "HIGH_RISK",
        }
    }
}

impl fmt::Display for StudentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StudentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ON_TRACK" => Ok(StudentStatus::OnTrack),
            "WATCH" => Ok(StudentStatus::Watch),
            "AT_RISK" => Ok(StudentStatus::AtRisk),
            "HIGH_RISK" => Ok(StudentStatus::HighRisk),
            other => Err(AppError::validation(
                "student_status",
                format!("unknown student status '{other}'"),
            )),
        }
    }
}

/// One point-in-time reading of a student's attendance, growth and credit pace.
///
/// Absent values mean "unknown", never zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub attendance_percentage: Option<f64>,
    pub growth_status: GrowthStatus,
    pub credits_earned: Option<i32>,
    pub expected_credits_for_grade: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub attendance_threshold: f64,
}

impl RiskThresholds {
    /// A threshold must be a finite number; `NaN` would make every comparison
    /// false and silently disable the attendance rule.
    pub fn new(attendance_threshold: f64) -> Result<Self, AppError> {
        if !attendance_threshold.is_finite() {
            return Err(AppError::validation(
                "attendance_threshold",
                format!("{attendance_threshold} is not a finite number"),
            ));
        }
        Ok(Self {
            attendance_threshold,
        })
    }
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            attendance_threshold: DEFAULT_ATTENDANCE_THRESHOLD,
        }
    }
}

/// Derived risk classification. Only constructible from the three flags, so
/// the count, status and intervention decision always agree with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RiskAssessment {
    attendance_risk_flag: bool,
    academic_risk_flag: bool,
    graduation_risk_flag: bool,
    risk_flag_count: u8,
    student_status: StudentStatus,
    intervention_required: bool,
}

impl RiskAssessment {
    pub fn from_flags(attendance: bool, academic: bool, graduation: bool) -> Self {
        let risk_flag_count = [attendance, academic, graduation]
            .into_iter()
            .filter(|flag| *flag)
            .count() as u8;

        Self {
            attendance_risk_flag: attendance,
            academic_risk_flag: academic,
            graduation_risk_flag: graduation,
            risk_flag_count,
            student_status: StudentStatus::from_flag_count(risk_flag_count),
            intervention_required: risk_flag_count >= INTERVENTION_FLAG_COUNT,
        }
    }

    pub fn attendance_risk_flag(&self) -> bool {
        self.attendance_risk_flag
    }

    pub fn academic_risk_flag(&self) -> bool {
        self.academic_risk_flag
    }

    pub fn graduation_risk_flag(&self) -> bool {
        self.graduation_risk_flag
    }

    pub fn risk_flag_count(&self) -> u8 {
        self.risk_flag_count
    }

    pub fn student_status(&self) -> StudentStatus {
        self.student_status
    }

    pub fn intervention_required(&self) -> bool {
        self.intervention_required
    }
}

pub fn evaluate(snapshot: &MetricSnapshot, thresholds: &RiskThresholds) -> RiskAssessment {
    let attendance = snapshot
        .attendance_percentage
        .is_some_and(|pct| pct < thresholds.attendance_threshold);

    let academic = snapshot.growth_status == GrowthStatus::Below;

    let graduation = match (snapshot.credits_earned, snapshot.expected_credits_for_grade) {
        (Some(earned), Some(expected)) => earned < expected,
        _ => false,
    };

    RiskAssessment::from_flags(attendance, academic, graduation)
}

/// The six derived fields as they were persisted next to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAssessment {
    pub attendance_risk_flag: bool,
    pub academic_risk_flag: bool,
    pub graduation_risk_flag: bool,
    pub risk_flag_count: i32,
    pub student_status: StudentStatus,
    pub intervention_required: bool,
}

impl From<RiskAssessment> for StoredAssessment {
    fn from(assessment: RiskAssessment) -> Self {
        Self {
            attendance_risk_flag: assessment.attendance_risk_flag(),
            academic_risk_flag: assessment.academic_risk_flag(),
            graduation_risk_flag: assessment.graduation_risk_flag(),
            risk_flag_count: i32::from(assessment.risk_flag_count()),
            student_status: assessment.student_status(),
            intervention_required: assessment.intervention_required(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub field: &'static str,
    pub stored: String,
    pub recomputed: String,
}

/// Re-runs the evaluator on the stored raw inputs and lists every derived
/// field that no longer matches. An empty result means the record is consistent.
pub fn verify(
    snapshot: &MetricSnapshot,
    stored: &StoredAssessment,
    thresholds: &RiskThresholds,
) -> Vec<Discrepancy> {
    let expected = StoredAssessment::from(evaluate(snapshot, thresholds));
    let mut discrepancies = Vec::new();

    let mut check = |field: &'static str, stored: String, recomputed: String| {
        if stored != recomputed {
            discrepancies.push(Discrepancy {
                field,
                stored,
                recomputed,
            });
        }
    };

    check(
        "attendance_risk_flag",
        stored.attendance_risk_flag.to_string(),
        expected.attendance_risk_flag.to_string(),
    );
    check(
        "academic_risk_flag",
        stored.academic_risk_flag.to_string(),
        expected.academic_risk_flag.to_string(),
    );
    check(
        "graduation_risk_flag",
        stored.graduation_risk_flag.to_string(),
        expected.graduation_risk_flag.to_string(),
    );
    check(
        "risk_flag_count",
        stored.risk_flag_count.to_string(),
        expected.risk_flag_count.to_string(),
    );
    check(
        "student_status",
        stored.student_status.to_string(),
        expected.student_status.to_string(),
    );
    check(
        "intervention_required",
        stored.intervention_required.to_string(),
        expected.intervention_required.to_string(),
    );

    discrepancies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        attendance: Option<f64>,
        growth: GrowthStatus,
        earned: Option<i32>,
        expected: Option<i32>,
    ) -> MetricSnapshot {
        MetricSnapshot {
            attendance_percentage: attendance,
            growth_status: growth,
            credits_earned: earned,
            expected_credits_for_grade: expected,
        }
    }

    fn flags(assessment: &RiskAssessment) -> (bool, bool, bool) {
        (
            assessment.attendance_risk_flag(),
            assessment.academic_risk_flag(),
            assessment.graduation_risk_flag(),
        )
    }

    #[test]
    fn low_attendance_alone_is_watch() {
        let result = evaluate(
            &snapshot(Some(93.9), GrowthStatus::Meets, Some(10), Some(10)),
            &RiskThresholds::default(),
        );
        assert_eq!(flags(&result), (true, false, false));
        assert_eq!(result.risk_flag_count(), 1);
        assert_eq!(result.student_status(), StudentStatus::Watch);
        assert!(!result.intervention_required());
    }

    #[test]
    fn growth_and_credit_deficits_require_intervention() {
        let result = evaluate(
            &snapshot(Some(96.0), GrowthStatus::Below, Some(5), Some(10)),
            &RiskThresholds::default(),
        );
        assert_eq!(flags(&result), (false, true, true));
        assert_eq!(result.risk_flag_count(), 2);
        assert_eq!(result.student_status(), StudentStatus::AtRisk);
        assert!(result.intervention_required());
    }

    #[test]
    fn all_three_flags_are_high_risk() {
        let result = evaluate(
            &snapshot(Some(80.0), GrowthStatus::Below, Some(4), Some(10)),
            &RiskThresholds::default(),
        );
        assert_eq!(flags(&result), (true, true, true));
        assert_eq!(result.risk_flag_count(), 3);
        assert_eq!(result.student_status(), StudentStatus::HighRisk);
        assert!(result.intervention_required());
    }

    #[test]
    fn missing_data_never_raises_flags() {
        let exceeds = evaluate(
            &snapshot(None, GrowthStatus::Exceeds, None, None),
            &RiskThresholds::default(),
        );
        assert_eq!(flags(&exceeds), (false, false, false));
        assert_eq!(exceeds.student_status(), StudentStatus::OnTrack);
        assert!(!exceeds.intervention_required());

        let no_data = evaluate(&MetricSnapshot::default(), &RiskThresholds::default());
        assert_eq!(no_data.risk_flag_count(), 0);
        assert_eq!(no_data.student_status(), StudentStatus::OnTrack);
        assert!(!no_data.intervention_required());
    }

    #[test]
    fn attendance_threshold_is_strict() {
        let at_threshold = evaluate(
            &snapshot(Some(94.0), GrowthStatus::Meets, None, None),
            &RiskThresholds::default(),
        );
        assert!(!at_threshold.attendance_risk_flag());
    }

    #[test]
    fn credit_rule_needs_both_values() {
        let thresholds = RiskThresholds::default();
        let only_earned =
            evaluate(&snapshot(None, GrowthStatus::Meets, Some(1), None), &thresholds);
        let only_expected =
            evaluate(&snapshot(None, GrowthStatus::Meets, None, Some(20)), &thresholds);
        assert!(!only_earned.graduation_risk_flag());
        assert!(!only_expected.graduation_risk_flag());
    }

    #[test]
    fn out_of_range_values_compare_at_face_value() {
        let thresholds = RiskThresholds::default();
        let over_hundred =
            evaluate(&snapshot(Some(140.0), GrowthStatus::Meets, None, None), &thresholds);
        assert!(!over_hundred.attendance_risk_flag());

        let negative = evaluate(
            &snapshot(Some(-5.0), GrowthStatus::Meets, Some(-3), Some(0)),
            &thresholds,
        );
        assert!(negative.attendance_risk_flag());
        assert!(negative.graduation_risk_flag());
    }

    #[test]
    fn only_below_growth_is_academic_risk() {
        let thresholds = RiskThresholds::default();
        for growth in [GrowthStatus::Exceeds, GrowthStatus::Meets, GrowthStatus::NoData] {
            let result = evaluate(&snapshot(None, growth, None, None), &thresholds);
            assert!(!result.academic_risk_flag());
        }
        assert!(evaluate(&snapshot(None, GrowthStatus::Below, None, None), &thresholds)
            .academic_risk_flag());
    }

    #[test]
    fn thresholds_must_be_finite() {
        assert!(RiskThresholds::new(f64::NAN).is_err());
        assert!(RiskThresholds::new(f64::INFINITY).is_err());
        assert!(RiskThresholds::new(f64::NEG_INFINITY).is_err());

        let tuned = RiskThresholds::new(90.0).unwrap();
        let result = evaluate(&snapshot(Some(10.0), GrowthStatus::Meets, None, None), &tuned);
        assert!(result.attendance_risk_flag());
    }

    #[test]
    fn threshold_is_configurable() {
        let strict = RiskThresholds {
            attendance_threshold: 97.5,
        };
        let result = evaluate(&snapshot(Some(96.0), GrowthStatus::Meets, None, None), &strict);
        assert!(result.attendance_risk_flag());
    }

    #[test]
    fn aggregation_holds_for_every_flag_combination() {
        for bits in 0u8..8 {
            let (a, b, c) = (bits & 1 != 0, bits & 2 != 0, bits & 4 != 0);
            let assessment = RiskAssessment::from_flags(a, b, c);
            let expected = u8::from(a) + u8::from(b) + u8::from(c);
            assert_eq!(assessment.risk_flag_count(), expected);
            assert_eq!(
                assessment.student_status(),
                StudentStatus::from_flag_count(expected)
            );
            assert_eq!(assessment.intervention_required(), expected >= 2);
        }
    }

    #[test]
    fn evaluation_is_deterministic() {
        let input = snapshot(Some(91.2), GrowthStatus::Below, Some(7), Some(9));
        let thresholds = RiskThresholds::default();
        assert_eq!(evaluate(&input, &thresholds), evaluate(&input, &thresholds));
    }

    #[test]
    fn status_staircase_saturates_at_high_risk() {
        assert_eq!(StudentStatus::from_flag_count(0), StudentStatus::OnTrack);
        assert_eq!(StudentStatus::from_flag_count(1), StudentStatus::Watch);
        assert_eq!(StudentStatus::from_flag_count(2), StudentStatus::AtRisk);
        assert_eq!(StudentStatus::from_flag_count(3), StudentStatus::HighRisk);
        assert_eq!(StudentStatus::from_flag_count(9), StudentStatus::HighRisk);
    }

    #[test]
    fn verify_accepts_freshly_evaluated_records() {
        let input = snapshot(Some(80.0), GrowthStatus::Below, Some(4), Some(10));
        let thresholds = RiskThresholds::default();
        let stored = StoredAssessment::from(evaluate(&input, &thresholds));
        assert!(verify(&input, &stored, &thresholds).is_empty());
    }

    #[test]
    fn verify_reports_each_drifted_field() {
        let input = snapshot(Some(96.0), GrowthStatus::Below, Some(5), Some(10));
        let thresholds = RiskThresholds::default();
        let mut stored = StoredAssessment::from(evaluate(&input, &thresholds));
        stored.risk_flag_count = 3;
        stored.student_status = StudentStatus::HighRisk;

        let discrepancies = verify(&input, &stored, &thresholds);
        let fields: Vec<&str> = discrepancies.iter().map(|d| d.field).collect();
        assert_eq!(fields, vec!["risk_flag_count", "student_status"]);
        assert_eq!(discrepancies[1].stored, "HIGH_RISK");
        assert_eq!(discrepancies[1].recomputed, "AT_RISK");
    }

    #[test]
    fn verify_flags_records_scored_under_an_old_threshold() {
        let input = snapshot(Some(95.0), GrowthStatus::Meets, None, None);
        let stored = StoredAssessment::from(evaluate(&input, &RiskThresholds::default()));
        let raised = RiskThresholds {
            attendance_threshold: 96.0,
        };
        assert_eq!(verify(&input, &stored, &raised).len(), 3);
    }

    #[test]
    fn status_strings_round_trip_through_storage_form() {
        assert_eq!("no_data".parse::<GrowthStatus>().ok(), Some(GrowthStatus::NoData));
        assert_eq!(
            StudentStatus::AtRisk.as_str().parse::<StudentStatus>().ok(),
            Some(StudentStatus::AtRisk)
        );
        assert!("SOMETIMES".parse::<GrowthStatus>().is_err());
    }

    #[test]
    fn assessment_serializes_with_storage_names() {
        let json = serde_json::to_value(RiskAssessment::from_flags(true, true, false))
            .expect("serialize");
        assert_eq!(json["student_status"], "AT_RISK");
        assert_eq!(json["risk_flag_count"], 2);
        assert_eq!(json["intervention_required"], true);
    }
}
