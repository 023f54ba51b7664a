use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::{Student, StudentMetric};
use crate::risk::StudentStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSummary {
    pub status: StudentStatus,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagMix {
    pub attendance: usize,
    pub academic: usize,
    pub graduation: usize,
}

/// Every status is listed, including those with no students.
pub fn summarize_by_status(latest: &[(Student, StudentMetric)]) -> Vec<StatusSummary> {
    StudentStatus::ALL
        .iter()
        .map(|status| StatusSummary {
            status: *status,
            count: latest
                .iter()
                .filter(|(_, metric)| metric.assessment.student_status == *status)
                .count(),
        })
        .collect()
}

pub fn flag_mix(latest: &[(Student, StudentMetric)]) -> FlagMix {
    latest.iter().fold(FlagMix::default(), |mut mix, (_, metric)| {
        let a = &metric.assessment;
        mix.attendance += usize::from(a.attendance_risk_flag);
        mix.academic += usize::from(a.academic_risk_flag);
        mix.graduation += usize::from(a.graduation_risk_flag);
        mix
    })
}

/// Students needing follow-up, most flags first, then by name.
pub fn intervention_list(latest: &[(Student, StudentMetric)]) -> Vec<&(Student, StudentMetric)> {
    let mut flagged: Vec<&(Student, StudentMetric)> = latest
        .iter()
        .filter(|(_, metric)| metric.assessment.intervention_required)
        .collect();

    flagged.sort_by(|(sa, ma), (sb, mb)| {
        mb.assessment
            .risk_flag_count
            .cmp(&ma.assessment.risk_flag_count)
            .then_with(|| sa.last_name.cmp(&sb.last_name))
            .then_with(|| sa.first_name.cmp(&sb.first_name))
    });
    flagged
}

fn flag_labels(metric: &StudentMetric) -> String {
    let a = &metric.assessment;
    let labels: Vec<&str> = [
        (a.attendance_risk_flag, "attendance"),
        (a.academic_risk_flag, "academic"),
        (a.graduation_risk_flag, "credits"),
    ]
    .into_iter()
    .filter_map(|(raised, label)| raised.then_some(label))
    .collect();
    labels.join(", ")
}

pub fn build_report(
    scope: Option<&str>,
    generated_on: NaiveDate,
    attendance_threshold: f64,
    latest: &[(Student, StudentMetric)],
) -> String {
    let mut output = String::new();
    let scope_label = scope.unwrap_or("all students");

    let _ = writeln!(output, "# Student Risk Report");
    let _ = writeln!(
        output,
        "Generated for {} on {} (attendance threshold {:.1}%)",
        scope_label, generated_on, attendance_threshold
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Status Distribution");

    for summary in summarize_by_status(latest) {
        let _ = writeln!(output, "- {}: {} students", summary.status, summary.count);
    }
    if latest.is_empty() {
        let _ = writeln!(output, "No metrics recorded yet.");
    }

    let mix = flag_mix(latest);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Flag Mix");
    let _ = writeln!(output, "- attendance: {}", mix.attendance);
    let _ = writeln!(output, "- academic growth: {}", mix.academic);
    let _ = writeln!(output, "- credit pace: {}", mix.graduation);

    let flagged = intervention_list(latest);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Intervention Required");

    if flagged.is_empty() {
        let _ = writeln!(output, "No students currently require intervention.");
    } else {
        for (student, metric) in flagged {
            let _ = writeln!(
                output,
                "- {} ({}, grade {}) {} as of {}: {}",
                student.full_name(),
                student.local_student_id,
                student.grade_level,
                metric.assessment.student_status,
                metric.as_of_date,
                flag_labels(metric)
            );
        }
    }

    output
}
