use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use sqlx::PgPool;
use tracing::{debug, info, warn};

mod auth;
mod config;
mod db;
mod error;
mod import;
mod models;
mod report;
mod risk;

use auth::{Action, Actor};
use config::Settings;
use models::{MetricInput, NewStudent, NewUser, Role, StudentMetric, StudentWithLatest};
use risk::{Discrepancy, GrowthStatus, MetricSnapshot, RiskThresholds, StoredAssessment};

#[derive(Parser)]
#[command(name = "student-risk")]
#[command(about = "Student risk status tracker for school counseling teams", long_about = None)]
struct Cli {
    #[command(flatten)]
    credentials: Credentials,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Credentials {
    /// Email of the account to act as
    #[arg(long, global = true, env = "STUDENT_RISK_USER")]
    user: Option<String>,
    #[arg(long, global = true, env = "STUDENT_RISK_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Args)]
struct SnapshotArgs {
    /// Attendance percentage (0-100); omit when unknown
    #[arg(long)]
    attendance: Option<f64>,
    #[arg(long, default_value_t = GrowthStatus::NoData)]
    growth: GrowthStatus,
    #[arg(long)]
    credits_earned: Option<i32>,
    #[arg(long)]
    expected_credits: Option<i32>,
}

impl SnapshotArgs {
    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            attendance_percentage: self.attendance,
            growth_status: self.growth,
            credits_earned: self.credits_earned,
            expected_credits_for_grade: self.expected_credits,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo roster with one student per status
    Seed,
    /// Create an account (the very first account must be an admin)
    CreateUser {
        #[arg(long)]
        email: String,
        #[arg(long, env = "STUDENT_RISK_NEW_PASSWORD", hide_env_values = true)]
        account_password: String,
        #[arg(long)]
        role: Role,
        /// Student record (UUID or local id) a student account is linked to
        #[arg(long)]
        student: Option<String>,
    },
    /// Add a single student record
    AddStudent {
        #[arg(long)]
        local_id: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        grade: i32,
        #[arg(long)]
        diploma_path: Option<String>,
    },
    /// List students by name
    ListStudents {
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show a student with their latest metric
    ShowStudent {
        /// UUID or local student id
        student: String,
        #[arg(long)]
        json: bool,
    },
    /// Show the signed-in student's own record
    Me {
        #[arg(long)]
        json: bool,
    },
    /// Record a metric snapshot and score it
    AddMetric {
        /// UUID or local student id
        student: String,
        /// Snapshot date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        as_of: Option<NaiveDate>,
        #[command(flatten)]
        metrics: SnapshotArgs,
    },
    /// Import students from a CSV file
    ImportStudents {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Import metric snapshots from a CSV file
    ImportMetrics {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Score a snapshot without touching the database
    Evaluate {
        #[command(flatten)]
        metrics: SnapshotArgs,
        /// Override the configured attendance threshold
        #[arg(long, value_parser = parse_threshold)]
        threshold: Option<f64>,
        #[arg(long)]
        json: bool,
    },
    /// Recompute stored assessments and report any that drifted
    Verify {
        /// Limit to one student (UUID or local id)
        #[arg(long)]
        student: Option<String>,
        /// Rewrite drifted records with the recomputed values
        #[arg(long)]
        repair: bool,
    },
    /// Generate a markdown report from each student's latest metric
    Report {
        #[arg(long)]
        grade: Option<i32>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn parse_threshold(raw: &str) -> Result<f64, String> {
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    RiskThresholds::new(value)
        .map(|t| t.attendance_threshold)
        .map_err(|e| e.to_string())
}

async fn connect(settings: &Settings) -> anyhow::Result<PgPool> {
    let database_url = settings.require_database_url()?;
    db::connect(database_url, settings.max_connections)
        .await
        .context("failed to connect to Postgres")
}

async fn sign_in(pool: &PgPool, credentials: &Credentials) -> anyhow::Result<Actor> {
    let (Some(user), Some(password)) = (&credentials.user, &credentials.password) else {
        bail!(
            "credentials required: pass --user/--password \
             or set STUDENT_RISK_USER/STUDENT_RISK_PASSWORD"
        );
    };
    let actor = db::authenticate(pool, user, password).await?;
    debug!(user = %actor.email, role = %actor.role, "signed in");
    Ok(actor)
}

fn print_assessment(snapshot: &MetricSnapshot, assessment: &StoredAssessment) {
    let show = |value: Option<String>| value.unwrap_or_else(|| "n/a".to_string());
    println!(
        "  attendance {}%, growth {}, credits {}/{}",
        show(snapshot.attendance_percentage.map(|p| format!("{p:.1}"))),
        snapshot.growth_status,
        show(snapshot.credits_earned.map(|c| c.to_string())),
        show(snapshot.expected_credits_for_grade.map(|c| c.to_string())),
    );
    println!(
        "  flags: attendance={} academic={} graduation={} ({} total)",
        assessment.attendance_risk_flag,
        assessment.academic_risk_flag,
        assessment.graduation_risk_flag,
        assessment.risk_flag_count
    );
    println!(
        "  status {}{}",
        assessment.student_status,
        if assessment.intervention_required {
            ", intervention required"
        } else {
            ""
        }
    );
}

fn print_student(record: &StudentWithLatest, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    let student = &record.student;
    println!(
        "{} ({}, grade {}){}",
        student.full_name(),
        student.local_student_id,
        student.grade_level,
        student
            .diploma_path
            .as_deref()
            .map(|p| format!(", {p} diploma"))
            .unwrap_or_default()
    );
    match &record.latest_metric {
        Some(metric) => {
            println!("Latest metric as of {}:", metric.as_of_date);
            print_assessment(&metric.snapshot, &metric.assessment);
        }
        None => println!("No metrics recorded."),
    }
    Ok(())
}

/// Stored metrics whose derived fields no longer match a fresh evaluation.
fn drifted<'a>(
    metrics: &'a [StudentMetric],
    thresholds: &RiskThresholds,
) -> Vec<(&'a StudentMetric, Vec<Discrepancy>)> {
    metrics
        .iter()
        .map(|m| (m, risk::verify(&m.snapshot, &m.assessment, thresholds)))
        .filter(|(_, discrepancies)| !discrepancies.is_empty())
        .collect()
}

async fn verify_metrics(
    pool: &PgPool,
    actor: &Actor,
    student: Option<String>,
    repair: bool,
    thresholds: &RiskThresholds,
) -> anyhow::Result<()> {
    actor.authorize(Action::VerifyMetrics)?;
    let student_id = match student {
        Some(key) => Some(db::resolve_student(pool, &key).await?.id),
        None => None,
    };

    let metrics = db::fetch_metrics(pool, student_id).await?;
    let inconsistent = drifted(&metrics, thresholds);
    let drifted = inconsistent.len();

    for (metric, discrepancies) in &inconsistent {
        println!("Metric {} ({} on {}):", metric.id, metric.student_id, metric.as_of_date);
        for d in discrepancies {
            println!("  {} stored {} recomputed {}", d.field, d.stored, d.recomputed);
        }
        warn!(metric_id = %metric.id, fields = discrepancies.len(), "stored assessment drifted");

        if repair {
            let recomputed = StoredAssessment::from(risk::evaluate(&metric.snapshot, thresholds));
            db::repair_metric(pool, actor, metric.id, &recomputed).await?;
        }
    }

    println!("Checked {} metrics, {} inconsistent.", metrics.len(), drifted);
    if drifted > 0 && !repair {
        bail!("{drifted} stored assessments do not match their inputs; rerun with --repair to fix");
    }
    if drifted > 0 {
        println!("Repaired {drifted} metrics.");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let settings = Settings::from_env().context("invalid configuration")?;
    settings.init_logging();
    let thresholds = settings.thresholds;

    match cli.command {
        Commands::Evaluate {
            metrics,
            threshold,
            json,
        } => {
            let thresholds = match threshold {
                Some(value) => RiskThresholds::new(value)?,
                None => thresholds,
            };
            let snapshot = metrics.snapshot();
            let assessment = risk::evaluate(&snapshot, &thresholds);
            if json {
                let output = serde_json::json!({
                    "snapshot": snapshot,
                    "thresholds": thresholds,
                    "assessment": assessment,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print_assessment(&snapshot, &StoredAssessment::from(assessment));
            }
        }
        Commands::InitDb => {
            let pool = connect(&settings).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect(&settings).await?;
            let actor = sign_in(&pool, &cli.credentials).await?;
            let inserted = db::seed(&pool, &actor, &thresholds).await?;
            println!("Seed data inserted ({inserted} new metrics).");
        }
        Commands::CreateUser {
            email,
            account_password,
            role,
            student,
        } => {
            let pool = connect(&settings).await?;
            let actor = match (&cli.credentials.user, &cli.credentials.password) {
                (Some(_), Some(_)) => Some(sign_in(&pool, &cli.credentials).await?),
                _ => None,
            };
            let student_id = match student {
                Some(key) => Some(db::resolve_student(&pool, &key).await?.id),
                None => None,
            };
            let user = db::create_user(
                &pool,
                actor.as_ref(),
                &NewUser {
                    email,
                    password: account_password,
                    role,
                    student_id,
                },
            )
            .await?;
            println!("Created {} account {} ({}).", user.role, user.email, user.id);
        }
        Commands::AddStudent {
            local_id,
            first_name,
            last_name,
            grade,
            diploma_path,
        } => {
            let pool = connect(&settings).await?;
            let actor = sign_in(&pool, &cli.credentials).await?;
            let student = db::create_student(
                &pool,
                &actor,
                &NewStudent {
                    local_student_id: local_id,
                    first_name,
                    last_name,
                    grade_level: grade,
                    diploma_path,
                },
            )
            .await?;
            println!("Added {} ({}).", student.full_name(), student.id);
        }
        Commands::ListStudents { limit, offset } => {
            let pool = connect(&settings).await?;
            let actor = sign_in(&pool, &cli.credentials).await?;
            actor.authorize(Action::ViewStudents)?;
            let students = db::list_students(&pool, limit, offset).await?;
            if students.is_empty() {
                println!("No students found.");
            }
            for student in students {
                println!(
                    "- {}, {} ({}, grade {}) {}",
                    student.last_name,
                    student.first_name,
                    student.local_student_id,
                    student.grade_level,
                    student.id
                );
            }
        }
        Commands::ShowStudent { student, json } => {
            let pool = connect(&settings).await?;
            let actor = sign_in(&pool, &cli.credentials).await?;
            actor.authorize(Action::ViewStudents)?;
            let student = db::resolve_student(&pool, &student).await?;
            let latest_metric = db::latest_metric(&pool, student.id).await?;
            print_student(
                &StudentWithLatest {
                    student,
                    latest_metric,
                },
                json,
            )?;
        }
        Commands::Me { json } => {
            let pool = connect(&settings).await?;
            let actor = sign_in(&pool, &cli.credentials).await?;
            let student_id = actor.own_student_id()?;
            let student = db::get_student(&pool, student_id).await?;
            let latest_metric = db::latest_metric(&pool, student.id).await?;
            print_student(
                &StudentWithLatest {
                    student,
                    latest_metric,
                },
                json,
            )?;
        }
        Commands::AddMetric {
            student,
            as_of,
            metrics,
        } => {
            let pool = connect(&settings).await?;
            let actor = sign_in(&pool, &cli.credentials).await?;
            actor.authorize(Action::RecordMetrics)?;
            let student = db::resolve_student(&pool, &student).await?;
            let input = MetricInput {
                as_of_date: as_of.unwrap_or_else(|| Utc::now().date_naive()),
                snapshot: metrics.snapshot(),
            };
            let metric = db::add_metric(&pool, &actor, student.id, &input, &thresholds).await?;
            println!("Recorded metric for {} as of {}:", student.full_name(), metric.as_of_date);
            print_assessment(&metric.snapshot, &metric.assessment);
        }
        Commands::ImportStudents { csv } => {
            let pool = connect(&settings).await?;
            let actor = sign_in(&pool, &cli.credentials).await?;
            let summary = db::import_students(&pool, &actor, &csv).await?;
            println!(
                "Imported students from {}: {} created, {} updated.",
                csv.display(),
                summary.created,
                summary.updated
            );
        }
        Commands::ImportMetrics { csv } => {
            let pool = connect(&settings).await?;
            let actor = sign_in(&pool, &cli.credentials).await?;
            let imported = db::import_metrics(&pool, &actor, &csv, &thresholds).await?;
            println!("Imported {imported} metrics from {}.", csv.display());
        }
        Commands::Verify { student, repair } => {
            let pool = connect(&settings).await?;
            let actor = sign_in(&pool, &cli.credentials).await?;
            verify_metrics(&pool, &actor, student, repair, &thresholds).await?;
        }
        Commands::Report { grade, out } => {
            let pool = connect(&settings).await?;
            let actor = sign_in(&pool, &cli.credentials).await?;
            actor.authorize(Action::RunReports)?;
            let mut latest = db::fetch_latest_per_student(&pool).await?;
            if let Some(grade) = grade {
                latest.retain(|(student, _)| student.grade_level == grade);
            }
            let scope = grade.map(|g| format!("grade {g}"));
            let report = report::build_report(
                scope.as_deref(),
                Utc::now().date_naive(),
                thresholds.attendance_threshold,
                &latest,
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            info!(students = latest.len(), "report generated");
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn stored_metric(attendance: f64, thresholds: &RiskThresholds) -> StudentMetric {
        let snapshot = MetricSnapshot {
            attendance_percentage: Some(attendance),
            growth_status: GrowthStatus::Meets,
            credits_earned: Some(10),
            expected_credits_for_grade: Some(10),
        };
        StudentMetric {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            as_of_date: NaiveDate::from_ymd_opt(2026, 1, 12).unwrap(),
            snapshot,
            assessment: StoredAssessment::from(risk::evaluate(&snapshot, thresholds)),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn threshold_flag_rejects_non_finite_values() {
        assert_eq!(parse_threshold(" 92.5 "), Ok(92.5));
        assert!(parse_threshold("NaN").is_err());
        assert!(parse_threshold("inf").is_err());
        assert!(parse_threshold("-inf").is_err());
        assert!(parse_threshold("ninety").is_err());
    }

    #[test]
    fn drift_selects_only_inconsistent_rows() {
        let thresholds = RiskThresholds::default();
        let mut metrics = vec![
            stored_metric(99.0, &thresholds),
            stored_metric(80.0, &thresholds),
        ];
        assert!(drifted(&metrics, &thresholds).is_empty());

        metrics[1].assessment.student_status = risk::StudentStatus::OnTrack;
        let found = drifted(&metrics, &thresholds);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.id, metrics[1].id);
        assert_eq!(found[0].1[0].field, "student_status");
    }

    #[test]
    fn changed_threshold_counts_as_drift() {
        let original = RiskThresholds::default();
        let metrics = vec![
            stored_metric(92.0, &original),
            stored_metric(99.0, &original),
        ];

        let relaxed = RiskThresholds::new(90.0).unwrap();
        let found = drifted(&metrics, &relaxed);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.id, metrics[0].id);
        assert!(found[0].1.iter().any(|d| d.field == "attendance_risk_flag"));
    }
}
