use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Completion marker written by the remote instance into shared storage.
///
/// Its presence is the only externally observable proof that the step
/// process exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelRecord {
    /// Storage key the record was written to.
    pub key: String,
    /// Exit code of the step process.
    pub exit_code: i32,
    /// Time the record was written, as reported by the instance.
    pub written_at: DateTime<Utc>,
}

impl SentinelRecord {
    /// Decode a sentinel object as written by the bootstrap script.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_script_output() {
        let raw = br#"{"key":"runs/r1/sentinels/start/1/0.json","exit_code":7,"written_at":"2026-01-02T03:04:05Z"}"#;
        let record = SentinelRecord::from_slice(raw).expect("decode sentinel");
        assert_eq!(record.exit_code, 7);
        assert_eq!(record.key, "runs/r1/sentinels/start/1/0.json");
        assert_eq!(record.written_at.to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }

    #[test]
    fn rejects_partial_write() {
        assert!(SentinelRecord::from_slice(br#"{"key":"k","exit_"#).is_err());
    }
}
