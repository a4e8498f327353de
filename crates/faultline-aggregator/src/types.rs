//! Core types for error aggregation.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an aggregate error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(Uuid);

impl AggregateId {
    /// Generate a new random aggregate ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AggregateId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for a single error occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generate a new random instance ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tenant namespace. Identity is the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Severity of an error report.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
}

impl ErrorLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// Interprets the level strings sent by client libraries.
    ///
    /// Unrecognised or missing levels are treated as [`ErrorLevel::Error`],
    /// since a report only arrives here because something went wrong.
    #[must_use]
    pub fn from_client(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Error;
        };

        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" | "finest" | "finer" | "fine" => Self::Debug,
            "info" | "information" | "notice" | "config" => Self::Info,
            "warn" | "warning" => Self::Warning,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown error level '{other}'")),
        }
    }
}

/// The deduplicated record for one fingerprint within one project.
///
/// `count` only grows, `first_occurrence` only moves earlier and
/// `last_occurrence` only moves later. Whenever `last_occurrence` advances,
/// `backtrace` and `last_message` are replaced with the values of the
/// occurrence that advanced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateError {
    pub id: AggregateId,
    pub project: String,
    /// Exception type, newlines collapsed and truncated.
    pub error_type: String,
    /// Raw backtrace of the most recent occurrence.
    pub backtrace: String,
    /// Hex digest from [`crate::Fingerprint`].
    pub fingerprint: String,
    /// Inactive aggregates are resolved and never match new reports.
    pub active: bool,
    pub count: u64,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub last_message: String,
    pub level: ErrorLevel,
    pub environments: BTreeSet<String>,
    pub servers: BTreeSet<String>,
}

/// One immutable occurrence of an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInstance {
    pub id: InstanceId,
    pub project: String,
    pub aggregate_id: AggregateId,
    pub environment: String,
    pub server: String,
    pub level: ErrorLevel,
    pub occurred_at: DateTime<Utc>,
    pub message: String,
    pub log_message: Option<String>,
    pub backtrace: String,
    /// Free-form context sent with the report.
    pub context: Option<serde_json::Value>,
    pub affected_user: Option<i64>,
}
