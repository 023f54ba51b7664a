//! Runtime settings read from the environment. `main` loads `.env` first.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{AppError, Result};
use crate::risk::RiskThresholds;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub thresholds: RiskThresholds,
    pub log_format: LogFormat,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_connections = match read("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    AppError::Config(format!(
                        "DATABASE_MAX_CONNECTIONS must be a positive integer, got '{raw}'"
                    ))
                })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let thresholds = match read("ATTENDANCE_THRESHOLD") {
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .and_then(|t| RiskThresholds::new(t).ok())
                .ok_or_else(|| {
                    AppError::Config(format!("ATTENDANCE_THRESHOLD must be a number, got '{raw}'"))
                })?,
            None => RiskThresholds::default(),
        };

        let log_format = match read("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            Some("pretty") | None => LogFormat::Pretty,
            Some(other) => {
                return Err(AppError::Config(format!(
                    "LOG_FORMAT must be 'pretty' or 'json', got '{other}'"
                )))
            }
        };

        Ok(Self {
            database_url: read("DATABASE_URL"),
            max_connections,
            thresholds,
            log_format,
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| AppError::Config("DATABASE_URL must be set".to_string()))
    }

    /// Logs go to stderr so command output on stdout stays clean.
    pub fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match self.log_format {
            LogFormat::Json => {
                fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
            LogFormat::Pretty => {
                fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.database_url, None);
        assert_eq!(settings.max_connections, 5);
        assert_eq!(settings.thresholds.attendance_threshold, 94.0);
        assert_eq!(settings.log_format, LogFormat::Pretty);
        assert!(settings.require_database_url().is_err());
    }

    #[test]
    fn reads_overrides() {
        let settings = settings(&[
            ("DATABASE_URL", "postgres://localhost/student_risk"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
            ("ATTENDANCE_THRESHOLD", " 92.5 "),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(
            settings.require_database_url().unwrap(),
            "postgres://localhost/student_risk"
        );
        assert_eq!(settings.max_connections, 12);
        assert_eq!(settings.thresholds.attendance_threshold, 92.5);
        assert_eq!(settings.log_format, LogFormat::Json);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let settings = settings(&[("ATTENDANCE_THRESHOLD", "  "), ("DATABASE_URL", "")]).unwrap();
        assert_eq!(settings.thresholds.attendance_threshold, 94.0);
        assert!(settings.database_url.is_none());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(settings(&[("ATTENDANCE_THRESHOLD", "ninety")]).is_err());
        assert!(settings(&[("ATTENDANCE_THRESHOLD", "inf")]).is_err());
        assert!(settings(&[("ATTENDANCE_THRESHOLD", "NaN")]).is_err());
        assert!(settings(&[("DATABASE_MAX_CONNECTIONS", "0")]).is_err());
        assert!(settings(&[("LOG_FORMAT", "xml")]).is_err());
    }
}
