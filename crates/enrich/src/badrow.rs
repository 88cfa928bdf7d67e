//! The failure-record model: one compact JSON line per failed payload or
//! event.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ProcessorId;

/// The failure classes a record can be demoted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BadRowKind {
    /// The raw record could not be decoded into a collector payload.
    CpformatViolation,
    /// A self-describing JSON carried by the event failed validation.
    SchemaViolation,
    /// One or more enrichments failed for the event.
    EnrichmentFailure,
    /// The serialized event exceeded the per-record size ceiling.
    SizeViolation,
    /// An unexpected failure during enrichment.
    GenericError,
}

impl BadRowKind {
    /// The serialized tag of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            BadRowKind::CpformatViolation => "cpformat-violation",
            BadRowKind::SchemaViolation => "schema-violation",
            BadRowKind::EnrichmentFailure => "enrichment-failure",
            BadRowKind::SizeViolation => "size-violation",
            BadRowKind::GenericError => "generic-error",
        }
    }
}

/// One structured failure record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BadRow {
    /// The failure class.
    pub kind: BadRowKind,
    /// The failing payload: base64 of the raw bytes for decode failures, a
    /// truncated serialized event otherwise.
    pub payload: String,
    /// The processor that produced this record.
    pub processor: ProcessorId,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
    /// The failure messages, in occurrence order.
    pub messages: Vec<String>,
}

impl BadRow {
    /// Creates a failure record stamped with the current time.
    pub fn new(kind: BadRowKind, payload: String, processor: ProcessorId, messages: Vec<String>) -> Self {
        Self {
            kind,
            payload,
            processor,
            timestamp: Utc::now(),
            messages,
        }
    }

    /// Serializes the record to a single compact JSON line.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).expect("a failure record is always serializable")
    }
}

#[cfg(test)]
mod test {
    use crate::{
        badrow::{BadRow, BadRowKind},
        ProcessorId,
    };

    #[test]
    fn kind_tags_are_kebab_case() {
        assert_eq!(BadRowKind::CpformatViolation.as_str(), "cpformat-violation");
        assert_eq!(
            serde_json::to_string(&BadRowKind::SchemaViolation).unwrap(),
            "\"schema-violation\""
        );
        assert_eq!(
            serde_json::to_string(&BadRowKind::GenericError).unwrap(),
            "\"generic-error\""
        );
    }

    #[test]
    fn serializes_to_one_compact_line() {
        let row = BadRow::new(
            BadRowKind::EnrichmentFailure,
            "shop\tweb".to_string(),
            ProcessorId::new("sluice", "0.1.0"),
            vec!["currency lookup failed".to_string(), "missing geo asset".to_string()],
        );

        let line = row.to_json_line();
        assert!(!line.contains('\n'));
        assert!(line.starts_with("{\"kind\":\"enrichment-failure\""));
        assert!(line.contains("\"processor\":{\"name\":\"sluice\",\"version\":\"0.1.0\"}"));
        assert!(line.contains("\"messages\":[\"currency lookup failed\",\"missing geo asset\"]"));

        // The line parses back with an RFC 3339 timestamp.
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        let timestamp = parsed["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }
}
