//! Wire format of an incoming error report and its field hygiene.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AggregatorError, Result};
use crate::types::ErrorLevel;

/// Longest error type kept on an aggregate, in characters.
pub const MAX_TYPE_CHARS: usize = 500;

/// Longest message kept as an aggregate's `last_message`, in characters.
pub const MAX_MESSAGE_CHARS: usize = 300;

/// Environment recorded when a report names none.
pub const UNKNOWN_ENVIRONMENT: &str = "Unknown";

/// An error report as sent by client libraries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub project: String,
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub backtrace: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    pub server_name: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(default)]
    pub log_message: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub error_level: Option<String>,
}

impl ErrorReport {
    /// Decode a report from its JSON payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| AggregatorError::invalid_report(format!("undecodable report: {e}")))
    }

    /// Check the fields ingestion cannot do without.
    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(AggregatorError::invalid_report("project is empty"));
        }
        if self.server_name.trim().is_empty() {
            return Err(AggregatorError::invalid_report("serverName is empty"));
        }
        self.occurred_at()?;
        Ok(())
    }

    /// The report timestamp, at microsecond precision.
    pub fn occurred_at(&self) -> Result<DateTime<Utc>> {
        if !self.timestamp.is_finite() {
            return Err(AggregatorError::invalid_report(format!(
                "timestamp {} is not a finite number",
                self.timestamp
            )));
        }

        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let micros = (self.timestamp * 1_000_000.0).round() as i64;
        DateTime::from_timestamp_micros(micros).ok_or_else(|| {
            AggregatorError::invalid_report(format!("timestamp {} is out of range", self.timestamp))
        })
    }

    #[must_use]
    pub fn error_type(&self) -> &str {
        self.error_type.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn backtrace(&self) -> &str {
        self.backtrace.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }

    /// The reported environment, or [`UNKNOWN_ENVIRONMENT`] if missing or blank.
    #[must_use]
    pub fn environment(&self) -> &str {
        match self.environment.as_deref() {
            Some(env) if !env.trim().is_empty() => env,
            _ => UNKNOWN_ENVIRONMENT,
        }
    }

    #[must_use]
    pub fn level(&self) -> ErrorLevel {
        ErrorLevel::from_client(self.error_level.as_deref())
    }

    /// The `userId` from the report context, when it is an integer or a
    /// numeric string.
    #[must_use]
    pub fn affected_user(&self) -> Option<i64> {
        let user = self.context.as_ref()?.get("userId")?;
        match user {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Collapse newlines to spaces and truncate to [`MAX_TYPE_CHARS`].
#[must_use]
pub fn sanitise_error_type(raw: &str) -> String {
    let collapsed = raw.replace("\r\n", " ").replace(['\n', '\r'], " ");
    truncate_chars(&collapsed, MAX_TYPE_CHARS).to_owned()
}

/// Truncate to at most `max` characters without splitting a code point.
#[must_use]
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn wire_report() -> &'static str {
        r#"{
            "project": "frontend",
            "type": "exceptions.KeyError",
            "backtrace": "Traceback (most recent call last):\nKeyError: 'y'",
            "message": "'y'",
            "environment": "prod",
            "serverName": "web-1",
            "timestamp": 1300000000.25,
            "logMessage": "lookup failed",
            "context": {"userId": 17},
            "errorLevel": "ERROR"
        }"#
    }

    #[test]
    fn decodes_client_wire_format() {
        let report = ErrorReport::from_slice(wire_report().as_bytes()).unwrap();

        assert_eq!(report.project, "frontend");
        assert_eq!(report.error_type(), "exceptions.KeyError");
        assert_eq!(report.server_name, "web-1");
        assert_eq!(report.environment(), "prod");
        assert_eq!(report.log_message.as_deref(), Some("lookup failed"));
        assert_eq!(report.affected_user(), Some(17));
        assert_eq!(report.level(), ErrorLevel::Error);
        assert_eq!(
            report.occurred_at().unwrap().timestamp_micros(),
            1_300_000_000_250_000
        );
        report.validate().unwrap();
    }

    #[test]
    fn optional_fields_may_be_null_or_missing() {
        let report = ErrorReport::from_slice(
            br#"{"project":"p","serverName":"s","timestamp":1.0,"type":null,"message":null}"#,
        )
        .unwrap();

        assert_eq!(report.error_type(), "");
        assert_eq!(report.backtrace(), "");
        assert_eq!(report.message(), "");
        assert_eq!(report.environment(), UNKNOWN_ENVIRONMENT);
        assert_eq!(report.affected_user(), None);
        report.validate().unwrap();
    }

    #[rstest]
    #[case::missing_project(r#"{"serverName":"s","timestamp":1.0}"#)]
    #[case::missing_server(r#"{"project":"p","timestamp":1.0}"#)]
    #[case::missing_timestamp(r#"{"project":"p","serverName":"s"}"#)]
    #[case::not_json("not json at all")]
    fn undecodable_reports_are_invalid(#[case] payload: &str) {
        let err = ErrorReport::from_slice(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, AggregatorError::InvalidReport(_)));
    }

    #[rstest]
    #[case::blank_project("  ", "web-1", 1.0)]
    #[case::blank_server("p", "", 1.0)]
    #[case::nan_timestamp("p", "web-1", f64::NAN)]
    #[case::infinite_timestamp("p", "web-1", f64::INFINITY)]
    #[case::absurd_timestamp("p", "web-1", 1e300)]
    fn validation_rejects_unusable_reports(
        #[case] project: &str,
        #[case] server: &str,
        #[case] timestamp: f64,
    ) {
        let report = ErrorReport {
            project: project.to_owned(),
            server_name: server.to_owned(),
            timestamp,
            ..ErrorReport::default()
        };
        assert!(matches!(
            report.validate(),
            Err(AggregatorError::InvalidReport(_))
        ));
    }

    #[rstest]
    #[case::integer(serde_json::json!({"userId": 42}), Some(42))]
    #[case::numeric_string(serde_json::json!({"userId": " 42 "}), Some(42))]
    #[case::non_numeric(serde_json::json!({"userId": "alice"}), None)]
    #[case::float(serde_json::json!({"userId": 4.2}), None)]
    #[case::absent(serde_json::json!({"requestId": "abc"}), None)]
    #[case::not_an_object(serde_json::json!([1, 2]), None)]
    fn affected_user_from_context(
        #[case] context: serde_json::Value,
        #[case] expected: Option<i64>,
    ) {
        let report = ErrorReport {
            context: Some(context),
            ..ErrorReport::default()
        };
        assert_eq!(report.affected_user(), expected);
    }

    #[test]
    fn error_type_newlines_collapse_and_truncate() {
        assert_eq!(sanitise_error_type("a\nb\r\nc"), "a b c");

        let long = "x".repeat(MAX_TYPE_CHARS + 20);
        assert_eq!(sanitise_error_type(&long).chars().count(), MAX_TYPE_CHARS);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo wörld";
        assert_eq!(truncate_chars(s, 2), "hé");
        assert_eq!(truncate_chars(s, 100), s);
        assert_eq!(truncate_chars("", 3), "");
    }
}
