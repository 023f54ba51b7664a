use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::risk::{MetricSnapshot, StoredAssessment};

pub const MAX_LOCAL_ID_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 80;
pub const MAX_GRADE_LEVEL: i32 = 12;
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Counselor,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Counselor => "counselor",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "counselor" => Ok(Role::Counselor),
            "student" => Ok(Role::Student),
            other => Err(AppError::validation("role", format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub student_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub role: Role,
    pub student_id: Option<Uuid>,
}

impl NewUser {
    pub fn validate(&self) -> Result<()> {
        validate_email(&self.email)?;
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::validation(
                "password",
                format!("must be at least {MIN_PASSWORD_LEN} characters"),
            ));
        }
        if self.student_id.is_some() && self.role != Role::Student {
            return Err(AppError::validation(
                "student_id",
                "only student accounts can be linked to a student record",
            ));
        }
        Ok(())
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_email(email: &str) -> Result<()> {
    let normalized = normalize_email(email);
    match normalized.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(AppError::validation("email", format!("'{email}' is not an email address"))),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Student {
    pub id: Uuid,
    pub local_student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub grade_level: i32,
    pub diploma_path: Option<String>,
}

impl Student {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewStudent {
    pub local_student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub grade_level: i32,
    pub diploma_path: Option<String>,
}

impl NewStudent {
    pub fn validate(&self) -> Result<()> {
        check_text("local_student_id", &self.local_student_id, MAX_LOCAL_ID_LEN)?;
        check_text("first_name", &self.first_name, MAX_NAME_LEN)?;
        check_text("last_name", &self.last_name, MAX_NAME_LEN)?;
        if !(0..=MAX_GRADE_LEVEL).contains(&self.grade_level) {
            return Err(AppError::validation(
                "grade_level",
                format!("{} is outside 0..={MAX_GRADE_LEVEL}", self.grade_level),
            ));
        }
        if let Some(path) = &self.diploma_path {
            check_text("diploma_path", path, MAX_NAME_LEN)?;
        }
        Ok(())
    }
}

fn check_text(field: &'static str, value: &str, max_len: usize) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation(field, "must not be blank"));
    }
    if trimmed.chars().count() > max_len {
        return Err(AppError::validation(
            field,
            format!("must be at most {max_len} characters"),
        ));
    }
    Ok(())
}

/// A metric reading for one student on one date, before it is scored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricInput {
    pub as_of_date: NaiveDate,
    pub snapshot: MetricSnapshot,
}

impl MetricInput {
    pub fn validate(&self) -> Result<()> {
        if let Some(pct) = self.snapshot.attendance_percentage {
            if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
                return Err(AppError::validation(
                    "attendance_percentage",
                    format!("{pct} is outside 0-100"),
                ));
            }
        }
        if self.snapshot.credits_earned.is_some_and(|c| c < 0) {
            return Err(AppError::validation("credits_earned", "must not be negative"));
        }
        if self.snapshot.expected_credits_for_grade.is_some_and(|c| c < 0) {
            return Err(AppError::validation(
                "expected_credits_for_grade",
                "must not be negative",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentMetric {
    pub id: Uuid,
    pub student_id: Uuid,
    pub as_of_date: NaiveDate,
    pub snapshot: MetricSnapshot,
    pub assessment: StoredAssessment,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentWithLatest {
    pub student: Student,
    pub latest_metric: Option<StudentMetric>,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor_user_id: Option<Uuid>,
    pub action: String,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
}

impl AuditEntry {
    pub fn new(actor_user_id: Option<Uuid>, action: impl Into<String>) -> Self {
        Self {
            actor_user_id,
            action: action.into(),
            target_type: None,
            target_id: None,
        }
    }

    pub fn target(mut self, target_type: &str, target_id: impl ToString) -> Self {
        self.target_type = Some(target_type.to_string());
        self.target_id = Some(target_id.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::GrowthStatus;

    fn student(grade_level: i32) -> NewStudent {
        NewStudent {
            local_student_id: "S-1001".to_string(),
            first_name: "Avery".to_string(),
            last_name: "Lee".to_string(),
            grade_level,
            diploma_path: None,
        }
    }

    fn metric(attendance: Option<f64>, earned: Option<i32>) -> MetricInput {
        MetricInput {
            as_of_date: NaiveDate::from_ymd_opt(2026, 1, 12).expect("date"),
            snapshot: MetricSnapshot {
                attendance_percentage: attendance,
                growth_status: GrowthStatus::Meets,
                credits_earned: earned,
                expected_credits_for_grade: Some(12),
            },
        }
    }

    #[test]
    fn accepts_reasonable_student() {
        assert!(student(9).validate().is_ok());
    }

    #[test]
    fn rejects_grade_outside_range() {
        let err = student(13).validate().unwrap_err();
        assert!(matches!(err, AppError::Validation { field: "grade_level", .. }));
    }

    #[test]
    fn rejects_blank_and_overlong_ids() {
        let mut blank = student(9);
        blank.local_student_id = "   ".to_string();
        assert!(blank.validate().is_err());

        let mut long = student(9);
        long.local_student_id = "x".repeat(MAX_LOCAL_ID_LEN + 1);
        assert!(long.validate().is_err());
    }

    #[test]
    fn attendance_must_be_a_percentage() {
        assert!(metric(Some(100.0), Some(3)).validate().is_ok());
        assert!(metric(None, None).validate().is_ok());
        assert!(metric(Some(100.5), Some(3)).validate().is_err());
        assert!(metric(Some(f64::NAN), Some(3)).validate().is_err());
        assert!(metric(Some(-1.0), Some(3)).validate().is_err());
    }

    #[test]
    fn credits_must_not_be_negative() {
        let err = metric(Some(95.0), Some(-2)).validate().unwrap_err();
        assert!(matches!(err, AppError::Validation { field: "credits_earned", .. }));

        let mut expected = metric(Some(95.0), Some(2));
        expected.snapshot.expected_credits_for_grade = Some(-1);
        let err = expected.validate().unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation {
                field: "expected_credits_for_grade",
                ..
            }
        ));

        expected.snapshot.expected_credits_for_grade = Some(0);
        assert!(expected.validate().is_ok());
    }

    #[test]
    fn new_user_rules() {
        let mut user = NewUser {
            email: " Counselor@School.org ".to_string(),
            password: "longenough".to_string(),
            role: Role::Counselor,
            student_id: None,
        };
        assert!(user.validate().is_ok());
        assert_eq!(normalize_email(&user.email), "counselor@school.org");

        user.student_id = Some(Uuid::new_v4());
        assert!(user.validate().is_err());

        user.student_id = None;
        user.password = "short".to_string();
        assert!(user.validate().is_err());

        user.password = "longenough".to_string();
        user.email = "nobody".to_string();
        assert!(user.validate().is_err());
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("Counselor".parse::<Role>().ok(), Some(Role::Counselor));
        assert!("principal".parse::<Role>().is_err());
    }
}
