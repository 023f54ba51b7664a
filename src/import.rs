use std::io::Read;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::{MetricInput, NewStudent};
use crate::risk::{GrowthStatus, MetricSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub row: usize,
    pub local_student_id: String,
    pub input: MetricInput,
}

#[derive(Deserialize)]
struct StudentCsvRow {
    local_student_id: String,
    first_name: String,
    last_name: String,
    grade_level: String,
    #[serde(default)]
    diploma_path: Option<String>,
}

#[derive(Deserialize)]
struct MetricCsvRow {
    local_student_id: String,
    as_of_date: String,
    #[serde(default)]
    attendance_percentage: Option<String>,
    #[serde(default)]
    growth_status: Option<String>,
    #[serde(default)]
    credits_earned: Option<String>,
    #[serde(default)]
    expected_credits_for_grade: Option<String>,
}

fn csv_reader<R: Read>(mut source: R) -> Result<csv::Reader<std::io::Cursor<String>>> {
    let mut text = String::new();
    source
        .read_to_string(&mut text)
        .map_err(|e| AppError::Import {
            row: 0,
            reason: format!("file is not readable UTF-8: {e}"),
        })?;
    let text = text.trim_start_matches('\u{feff}').to_string();

    Ok(csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(std::io::Cursor::new(text)))
}

fn present(cell: Option<String>) -> Option<String> {
    cell.map(|c| c.trim().to_string()).filter(|c| !c.is_empty())
}

fn parse_cell<T: std::str::FromStr>(
    row: usize,
    field: &str,
    cell: Option<String>,
) -> Result<Option<T>> {
    match present(cell) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| AppError::Import {
            row,
            reason: format!("{field} '{raw}' is not a valid number"),
        }),
        None => Ok(None),
    }
}

/// Row numbers are 1-based and count data rows only.
pub fn parse_students<R: Read>(source: R) -> Result<Vec<NewStudent>> {
    let mut reader = csv_reader(source)?;
    let mut students = Vec::new();

    for (index, record) in reader.deserialize::<StudentCsvRow>().enumerate() {
        let row = index + 1;
        let record = record?;
        let grade_level = parse_cell::<i32>(row, "grade_level", Some(record.grade_level))?
            .ok_or_else(|| AppError::Import {
                row,
                reason: "grade_level is required".to_string(),
            })?;

        let student = NewStudent {
            local_student_id: record.local_student_id,
            first_name: record.first_name,
            last_name: record.last_name,
            grade_level,
            diploma_path: present(record.diploma_path),
        };
        student.validate().map_err(|e| AppError::Import {
            row,
            reason: e.to_string(),
        })?;
        students.push(student);
    }

    Ok(students)
}

pub fn parse_metrics<R: Read>(source: R) -> Result<Vec<MetricRow>> {
    let mut reader = csv_reader(source)?;
    let mut rows = Vec::new();

    for (index, record) in reader.deserialize::<MetricCsvRow>().enumerate() {
        let row = index + 1;
        let record = record?;

        let as_of_date = NaiveDate::parse_from_str(&record.as_of_date, "%Y-%m-%d").map_err(|_| {
            AppError::Import {
                row,
                reason: format!("as_of_date '{}' is not YYYY-MM-DD", record.as_of_date),
            }
        })?;

        let growth_status = match present(record.growth_status) {
            Some(raw) => raw.parse::<GrowthStatus>().map_err(|e| AppError::Import {
                row,
                reason: e.to_string(),
            })?,
            None => GrowthStatus::NoData,
        };

        let input = MetricInput {
            as_of_date,
            snapshot: MetricSnapshot {
                attendance_percentage: parse_cell(
                    row,
                    "attendance_percentage",
                    record.attendance_percentage,
                )?,
                growth_status,
                credits_earned: parse_cell(row, "credits_earned", record.credits_earned)?,
                expected_credits_for_grade: parse_cell(
                    row,
                    "expected_credits_for_grade",
                    record.expected_credits_for_grade,
                )?,
            },
        };
        input.validate().map_err(|e| AppError::Import {
            row,
            reason: e.to_string(),
        })?;

        rows.push(MetricRow {
            row,
            local_student_id: record.local_student_id,
            input,
        });
    }

    Ok(rows)
}
