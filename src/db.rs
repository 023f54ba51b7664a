use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgExecutor, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth;
use crate::error::{AppError, Result};
use crate::import;
use crate::models::{
    normalize_email, AuditEntry, MetricInput, NewStudent, NewUser, Student, StudentMetric, User,
};
use crate::risk::{self, MetricSnapshot, RiskThresholds, StoredAssessment};

const STUDENT_COLUMNS: &str =
    "id, local_student_id, first_name, last_name, grade_level, diploma_path";

const METRIC_COLUMNS: &str = "m.id, m.student_id, m.as_of_date, m.attendance_percentage, \
     m.growth_status, m.credits_earned, m.expected_credits_for_grade, m.attendance_risk_flag, \
     m.academic_risk_flag, m.graduation_risk_flag, m.risk_flag_count, m.student_status, \
     m.intervention_required, m.created_at";

const USER_COLUMNS: &str = "id, email, password_hash, role, student_id, created_at";

/// Serializes first-account creation across concurrent `create-user` runs.
const BOOTSTRAP_LOCK_KEY: i64 = 0x5354_5544_5249_534b;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    debug!(max_connections, "connected to Postgres");
    Ok(pool)
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("migrations applied");
    Ok(())
}

fn conflict_or(err: sqlx::Error, message: impl FnOnce() -> String) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(message())
        }
        _ => AppError::Database(err),
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role: role.parse()?,
        student_id: row.try_get("student_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn student_from_row(row: &PgRow, id_column: &str) -> Result<Student> {
    Ok(Student {
        id: row.try_get(id_column)?,
        local_student_id: row.try_get("local_student_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        grade_level: row.try_get("grade_level")?,
        diploma_path: row.try_get("diploma_path")?,
    })
}

fn metric_from_row(row: &PgRow) -> Result<StudentMetric> {
    let growth_status: String = row.try_get("growth_status")?;
    let student_status: String = row.try_get("student_status")?;

    Ok(StudentMetric {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        as_of_date: row.try_get("as_of_date")?,
        snapshot: MetricSnapshot {
            attendance_percentage: row.try_get("attendance_percentage")?,
            growth_status: growth_status.parse()?,
            credits_earned: row.try_get("credits_earned")?,
            expected_credits_for_grade: row.try_get("expected_credits_for_grade")?,
        },
        assessment: StoredAssessment {
            attendance_risk_flag: row.try_get("attendance_risk_flag")?,
            academic_risk_flag: row.try_get("academic_risk_flag")?,
            graduation_risk_flag: row.try_get("graduation_risk_flag")?,
            risk_flag_count: row.try_get("risk_flag_count")?,
            student_status: student_status.parse()?,
            intervention_required: row.try_get("intervention_required")?,
        },
        created_at: row.try_get("created_at")?,
    })
}

async fn any_users<'e, E: PgExecutor<'e>>(executor: E) -> Result<bool> {
    let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM student_risk.users) AS present")
        .fetch_one(executor)
        .await?;
    Ok(row.try_get("present")?)
}

pub async fn get_user_by_email(pool: &PgPool, email: &str) -> Result<Option<User>> {
    let query = format!("SELECT {USER_COLUMNS} FROM student_risk.users WHERE email = $1");
    let row = sqlx::query(&query)
        .bind(normalize_email(email))
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

pub async fn authenticate(pool: &PgPool, email: &str, password: &str) -> Result<auth::Actor> {
    let user = get_user_by_email(pool, email).await?;
    let user = auth::check_credentials(user, password)?;
    debug!(user_id = %user.id, role = %user.role, "authenticated");
    Ok(user.into())
}

/// Creates an account. With no users yet, no actor is required but the
/// account must be an admin; afterwards only admins may create accounts.
/// The existence check and the insert share one transaction under an
/// advisory lock, so only one bootstrap account can ever be created.
pub async fn create_user(
    pool: &PgPool,
    actor: Option<&auth::Actor>,
    new_user: &NewUser,
) -> Result<User> {
    new_user.validate()?;

    if let Some(student_id) = new_user.student_id {
        get_student(pool, student_id).await?;
    }

    let email = normalize_email(&new_user.email);
    let password_hash = auth::hash_password(&new_user.password)?;

    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(BOOTSTRAP_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    let bootstrapped = any_users(&mut *tx).await?;
    auth::authorize_account_creation(bootstrapped, actor, new_user.role)?;

    let query = format!(
        "INSERT INTO student_risk.users (id, email, password_hash, role, student_id) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
    );

    let row = sqlx::query(&query)
        .bind(Uuid::new_v4())
        .bind(&email)
        .bind(&password_hash)
        .bind(new_user.role.as_str())
        .bind(new_user.student_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_or(e, || format!("email {email} is already registered")))?;
    let user = user_from_row(&row)?;

    log_action(
        &mut *tx,
        &AuditEntry::new(actor.map(|a| a.user_id), "create_user").target("user", user.id),
    )
    .await?;
    tx.commit().await?;
    info!(user_id = %user.id, role = %user.role, "user created");
    Ok(user)
}

pub async fn create_student(
    pool: &PgPool,
    actor: &auth::Actor,
    student: &NewStudent,
) -> Result<Student> {
    actor.authorize(auth::Action::ManageStudents)?;
    student.validate()?;

    let query = format!(
        "INSERT INTO student_risk.students \
         (id, local_student_id, first_name, last_name, grade_level, diploma_path) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING {STUDENT_COLUMNS}"
    );
    let row = sqlx::query(&query)
        .bind(Uuid::new_v4())
        .bind(student.local_student_id.trim())
        .bind(student.first_name.trim())
        .bind(student.last_name.trim())
        .bind(student.grade_level)
        .bind(student.diploma_path.as_deref().map(str::trim))
        .fetch_one(pool)
        .await
        .map_err(|e| {
            conflict_or(e, || {
                format!("local student id {} already exists", student.local_student_id.trim())
            })
        })?;
    let created = student_from_row(&row, "id")?;

    log_action(
        pool,
        &AuditEntry::new(Some(actor.user_id), "create_student").target("student", created.id),
    )
    .await?;
    Ok(created)
}

/// Inserts or refreshes a student keyed by local id. Returns whether a new row was created.
async fn upsert_student<'e, E: PgExecutor<'e>>(executor: E, student: &NewStudent) -> Result<bool> {
    let row = sqlx::query(
        r#"
        INSERT INTO student_risk.students
        (id, local_student_id, first_name, last_name, grade_level, diploma_path)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (local_student_id) DO UPDATE
        SET first_name = EXCLUDED.first_name,
            last_name = EXCLUDED.last_name,
            grade_level = EXCLUDED.grade_level,
            diploma_path = EXCLUDED.diploma_path
        RETURNING (xmax = 0) AS inserted
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student.local_student_id.trim())
    .bind(student.first_name.trim())
    .bind(student.last_name.trim())
    .bind(student.grade_level)
    .bind(student.diploma_path.as_deref().map(str::trim))
    .fetch_one(executor)
    .await?;

    Ok(row.try_get("inserted")?)
}

pub async fn list_students(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<Student>> {
    let query = format!(
        "SELECT {STUDENT_COLUMNS} FROM student_risk.students \
         ORDER BY last_name, first_name LIMIT $1 OFFSET $2"
    );
    let rows = sqlx::query(&query)
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(pool)
        .await?;

    rows.iter().map(|row| student_from_row(row, "id")).collect()
}

pub async fn get_student(pool: &PgPool, id: Uuid) -> Result<Student> {
    let query = format!("SELECT {STUDENT_COLUMNS} FROM student_risk.students WHERE id = $1");
    let row = sqlx::query(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("student", id))?;
    student_from_row(&row, "id")
}

async fn find_student_id<'e, E: PgExecutor<'e>>(
    executor: E,
    local_student_id: &str,
) -> Result<Option<Uuid>> {
    let row = sqlx::query("SELECT id FROM student_risk.students WHERE local_student_id = $1")
        .bind(local_student_id.trim())
        .fetch_optional(executor)
        .await?;
    row.map(|r| r.try_get("id")).transpose().map_err(AppError::from)
}

/// Looks a student up by either internal UUID or local student id.
pub async fn resolve_student(pool: &PgPool, key: &str) -> Result<Student> {
    if let Ok(id) = Uuid::parse_str(key.trim()) {
        return get_student(pool, id).await;
    }
    let id = find_student_id(pool, key)
        .await?
        .ok_or_else(|| AppError::not_found("student", key))?;
    get_student(pool, id).await
}

async fn insert_metric<'e, E: PgExecutor<'e>>(
    executor: E,
    student_id: Uuid,
    input: &MetricInput,
    thresholds: &RiskThresholds,
) -> Result<StudentMetric> {
    let assessment = StoredAssessment::from(risk::evaluate(&input.snapshot, thresholds));
    let snapshot = &input.snapshot;

    let query = format!(
        "INSERT INTO student_risk.student_metrics AS m \
         (id, student_id, as_of_date, attendance_percentage, growth_status, credits_earned, \
          expected_credits_for_grade, attendance_risk_flag, academic_risk_flag, \
          graduation_risk_flag, risk_flag_count, student_status, intervention_required) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING {METRIC_COLUMNS}"
    );
    let row = sqlx::query(&query)
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(input.as_of_date)
        .bind(snapshot.attendance_percentage)
        .bind(snapshot.growth_status.as_str())
        .bind(snapshot.credits_earned)
        .bind(snapshot.expected_credits_for_grade)
        .bind(assessment.attendance_risk_flag)
        .bind(assessment.academic_risk_flag)
        .bind(assessment.graduation_risk_flag)
        .bind(assessment.risk_flag_count)
        .bind(assessment.student_status.as_str())
        .bind(assessment.intervention_required)
        .fetch_one(executor)
        .await
        .map_err(|e| {
            conflict_or(e, || {
                format!("a metric for {} already exists for this student", input.as_of_date)
            })
        })?;

    metric_from_row(&row)
}

/// Validates, scores and stores one metric snapshot.
pub async fn add_metric(
    pool: &PgPool,
    actor: &auth::Actor,
    student_id: Uuid,
    input: &MetricInput,
    thresholds: &RiskThresholds,
) -> Result<StudentMetric> {
    actor.authorize(auth::Action::RecordMetrics)?;
    input.validate()?;
    get_student(pool, student_id).await?;

    let metric = insert_metric(pool, student_id, input, thresholds).await?;
    log_action(
        pool,
        &AuditEntry::new(Some(actor.user_id), "add_metric").target("student_metric", metric.id),
    )
    .await?;
    info!(
        %student_id,
        as_of = %metric.as_of_date,
        status = %metric.assessment.student_status,
        "metric recorded"
    );
    Ok(metric)
}

pub async fn latest_metric(pool: &PgPool, student_id: Uuid) -> Result<Option<StudentMetric>> {
    let query = format!(
        "SELECT {METRIC_COLUMNS} FROM student_risk.student_metrics m \
         WHERE m.student_id = $1 ORDER BY m.as_of_date DESC LIMIT 1"
    );
    let row = sqlx::query(&query)
        .bind(student_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(metric_from_row).transpose()
}

pub async fn fetch_metrics(pool: &PgPool, student_id: Option<Uuid>) -> Result<Vec<StudentMetric>> {
    let mut query = format!("SELECT {METRIC_COLUMNS} FROM student_risk.student_metrics m");
    if student_id.is_some() {
        query.push_str(" WHERE m.student_id = $1");
    }
    query.push_str(" ORDER BY m.student_id, m.as_of_date");

    let mut rows = sqlx::query(&query);
    if let Some(id) = student_id {
        rows = rows.bind(id);
    }

    let records = rows.fetch_all(pool).await?;
    records.iter().map(metric_from_row).collect()
}

async fn update_assessment<'e, E: PgExecutor<'e>>(
    executor: E,
    metric_id: Uuid,
    assessment: &StoredAssessment,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE student_risk.student_metrics
        SET attendance_risk_flag = $2,
            academic_risk_flag = $3,
            graduation_risk_flag = $4,
            risk_flag_count = $5,
            student_status = $6,
            intervention_required = $7
        WHERE id = $1
        "#,
    )
    .bind(metric_id)
    .bind(assessment.attendance_risk_flag)
    .bind(assessment.academic_risk_flag)
    .bind(assessment.graduation_risk_flag)
    .bind(assessment.risk_flag_count)
    .bind(assessment.student_status.as_str())
    .bind(assessment.intervention_required)
    .execute(executor)
    .await?;
    Ok(())
}

/// Rewrites a drifted stored assessment and records who did it, atomically.
pub async fn repair_metric(
    pool: &PgPool,
    actor: &auth::Actor,
    metric_id: Uuid,
    assessment: &StoredAssessment,
) -> Result<()> {
    actor.authorize(auth::Action::VerifyMetrics)?;

    let mut tx = pool.begin().await?;
    update_assessment(&mut *tx, metric_id, assessment).await?;
    log_action(
        &mut *tx,
        &AuditEntry::new(Some(actor.user_id), "repair_metric").target("student_metric", metric_id),
    )
    .await?;
    tx.commit().await?;

    info!(%metric_id, status = %assessment.student_status, "stored assessment repaired");
    Ok(())
}

/// Each student's most recent metric, for students that have one.
pub async fn fetch_latest_per_student(pool: &PgPool) -> Result<Vec<(Student, StudentMetric)>> {
    let query = format!(
        "SELECT DISTINCT ON (m.student_id) {METRIC_COLUMNS}, \
         s.local_student_id, s.first_name, s.last_name, s.grade_level, s.diploma_path \
         FROM student_risk.student_metrics m \
         JOIN student_risk.students s ON s.id = m.student_id \
         ORDER BY m.student_id, m.as_of_date DESC"
    );
    let rows = sqlx::query(&query).fetch_all(pool).await?;

    rows.iter()
        .map(|row| Ok((student_from_row(row, "student_id")?, metric_from_row(row)?)))
        .collect()
}

pub async fn log_action<'e, E: PgExecutor<'e>>(executor: E, entry: &AuditEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO student_risk.audit_logs (id, actor_user_id, action, target_type, target_id)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entry.actor_user_id)
    .bind(&entry.action)
    .bind(&entry.target_type)
    .bind(&entry.target_id)
    .execute(executor)
    .await?;
    debug!(action = %entry.action, "audit entry written");
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StudentImport {
    pub created: usize,
    pub updated: usize,
}

pub async fn import_students(
    pool: &PgPool,
    actor: &auth::Actor,
    csv_path: &std::path::Path,
) -> Result<StudentImport> {
    actor.authorize(auth::Action::ImportData)?;
    let file = std::fs::File::open(csv_path).map_err(|e| AppError::Import {
        row: 0,
        reason: format!("cannot open {}: {e}", csv_path.display()),
    })?;
    let students = import::parse_students(file)?;

    let mut tx = pool.begin().await?;
    let mut summary = StudentImport::default();
    for student in &students {
        if upsert_student(&mut *tx, student).await? {
            summary.created += 1;
        } else {
            summary.updated += 1;
        }
    }
    log_action(
        &mut *tx,
        &AuditEntry::new(Some(actor.user_id), "import_students")
            .target("csv", csv_path.display()),
    )
    .await?;
    tx.commit().await?;

    info!(created = summary.created, updated = summary.updated, "students imported");
    Ok(summary)
}

/// Imports every row or none: an unknown local student id or a duplicate
/// (student, date) pair rolls the whole file back.
pub async fn import_metrics(
    pool: &PgPool,
    actor: &auth::Actor,
    csv_path: &std::path::Path,
    thresholds: &RiskThresholds,
) -> Result<usize> {
    actor.authorize(auth::Action::ImportData)?;
    let file = std::fs::File::open(csv_path).map_err(|e| AppError::Import {
        row: 0,
        reason: format!("cannot open {}: {e}", csv_path.display()),
    })?;
    let rows = import::parse_metrics(file)?;

    let mut tx = pool.begin().await?;
    for row in &rows {
        let student_id = find_student_id(&mut *tx, &row.local_student_id)
            .await?
            .ok_or_else(|| AppError::Import {
                row: row.row,
                reason: format!("unknown local_student_id: {}", row.local_student_id),
            })?;
        insert_metric(&mut *tx, student_id, &row.input, thresholds)
            .await
            .map_err(|e| match e {
                AppError::Conflict(reason) => AppError::Import { row: row.row, reason },
                other => other,
            })?;
    }
    log_action(
        &mut *tx,
        &AuditEntry::new(Some(actor.user_id), "import_metrics").target("csv", csv_path.display()),
    )
    .await?;
    tx.commit().await?;

    info!(imported = rows.len(), "metrics imported");
    Ok(rows.len())
}

fn seed_date(year: i32, month: u32, day: u32) -> anyhow::Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| anyhow::anyhow!("invalid date"))
}

/// Demo roster with one student per status. Safe to run repeatedly.
pub async fn seed(
    pool: &PgPool,
    actor: &auth::Actor,
    thresholds: &RiskThresholds,
) -> anyhow::Result<usize> {
    actor.authorize(auth::Action::ManageStudents)?;
    actor.authorize(auth::Action::RecordMetrics)?;

    let students = vec![
        (
            "GS-1001",
            "Avery",
            "Lee",
            10,
            Some(97.2),
            risk::GrowthStatus::Exceeds,
            Some(11),
            Some(10),
        ),
        (
            "GS-1002",
            "Jules",
            "Moreno",
            11,
            Some(93.9),
            risk::GrowthStatus::Meets,
            Some(15),
            Some(15),
        ),
        (
            "GS-1003",
            "Kiara",
            "Patel",
            9,
            Some(96.0),
            risk::GrowthStatus::Below,
            Some(5),
            Some(10),
        ),
        (
            "GS-1004",
            "Rowan",
            "Okafor",
            12,
            Some(80.0),
            risk::GrowthStatus::Below,
            Some(14),
            Some(20),
        ),
        (
            "GS-1005",
            "Noa",
            "Schmidt",
            9,
            None,
            risk::GrowthStatus::NoData,
            None,
            None,
        ),
    ];

    let as_of_date = seed_date(2026, 1, 12)?;
    let mut inserted = 0usize;

    for (local_id, first, last, grade, attendance, growth, earned, expected) in students {
        let student = NewStudent {
            local_student_id: local_id.to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            grade_level: grade,
            diploma_path: None,
        };
        upsert_student(pool, &student).await?;
        let student_id = find_student_id(pool, local_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("seeded student {local_id} is missing"))?;

        let input = MetricInput {
            as_of_date,
            snapshot: MetricSnapshot {
                attendance_percentage: attendance,
                growth_status: growth,
                credits_earned: earned,
                expected_credits_for_grade: expected,
            },
        };
        match insert_metric(pool, student_id, &input, thresholds).await {
            Ok(_) => inserted += 1,
            Err(AppError::Conflict(_)) => debug!(local_id, "seed metric already present"),
            Err(e) => return Err(e.into()),
        }
    }

    log_action(pool, &AuditEntry::new(Some(actor.user_id), "seed")).await?;
    info!(inserted, "demo roster seeded");
    Ok(inserted)
}
