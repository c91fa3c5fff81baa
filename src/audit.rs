//! Process logging and audit reports.
//!
//! Every query accumulates typed stage records in an append-only process
//! log with a single writer. Finalization seals the log together with an
//! audit report: sources, reasoning trace, hallucination assessment, and
//! a verification status bucketed from the hallucination score. Sealed
//! reports are immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::store::DocumentStore;

/// Stages a query moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    Analysis,
    Planning,
    ToolExecution,
    Synthesis,
    Evaluation,
    Refinement,
    Finalization,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Analysis => "ANALYSIS",
            Self::Planning => "PLANNING",
            Self::ToolExecution => "TOOL_EXECUTION",
            Self::Synthesis => "SYNTHESIS",
            Self::Evaluation => "EVALUATION",
            Self::Refinement => "REFINEMENT",
            Self::Finalization => "FINALIZATION",
        };
        write!(f, "{}", s)
    }
}

/// One typed record in the process log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageKind,
    /// Human-readable description of what happened.
    pub content: String,
    /// Stage-specific payload (inputs redacted of secrets).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<HashMap<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

impl StageRecord {
    pub fn new(stage: StageKind, content: impl Into<String>) -> Self {
        Self {
            stage,
            content: content.into(),
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.detail
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), redact(value.into()));
        self
    }
}

/// A cited source inside an audit report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: Uuid,
    pub chunk_id: Uuid,
    pub filename: String,
    pub excerpt: String,
    pub score: f64,
}

/// How much of the answer is grounded in retrieved sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Partial,
    NotVerified,
    Unknown,
}

impl VerificationStatus {
    /// Bucket a 1-10 hallucination score (higher = less hallucination).
    pub fn from_hallucination(score: Option<f64>, verified_floor: f64, partial_floor: f64) -> Self {
        match score {
            Some(s) if s >= verified_floor => Self::Verified,
            Some(s) if s >= partial_floor => Self::Partial,
            Some(_) => Self::NotVerified,
            None => Self::Unknown,
        }
    }
}

/// Evaluator findings about hallucination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HallucinationAssessment {
    /// 1-10; higher means better grounded. Absent when evaluation never ran.
    pub score: Option<f64>,
    /// Spans the evaluator flagged as unsupported.
    #[serde(default)]
    pub flagged_spans: Vec<String>,
}

/// The sealed, immutable audit report of one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub id: Uuid,
    pub sources: Vec<SourceRef>,
    pub reasoning_trace: Vec<String>,
    pub hallucination_assessment: HallucinationAssessment,
    pub verification_status: VerificationStatus,
    /// Stage that failed, when the query ended abnormally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
}

/// Single-writer process log for one query.
pub struct ProcessLogger {
    id: Uuid,
    owner_id: Uuid,
    store: Arc<DocumentStore>,
    records: Vec<StageRecord>,
    sealed: bool,
}

impl ProcessLogger {
    /// Open a new log row for a query.
    pub async fn start(
        store: Arc<DocumentStore>,
        owner_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        store.create_process_log(id, owner_id, conversation_id).await?;
        Ok(Self {
            id,
            owner_id,
            store,
            records: Vec::new(),
            sealed: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// Append a record. Ignored with a warning after sealing.
    pub fn append(&mut self, record: StageRecord) {
        if self.sealed {
            warn!(log_id = %self.id, "record appended after seal, dropped");
            return;
        }
        self.records.push(record);
    }

    /// Persist the current record array without sealing.
    pub async fn flush(&self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.store
            .update_process_log(self.id, &serde_json::to_value(&self.records)?)
            .await
    }

    /// The reasoning trace derived from the records so far.
    pub fn reasoning_trace(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| format!("{}: {}", r.stage, r.content))
            .collect()
    }

    /// Seal the log with its final report. The report becomes immutable.
    pub async fn seal(&mut self, report: &AuditReport) -> Result<()> {
        self.append(StageRecord::new(
            StageKind::Finalization,
            format!("sealed with status {:?}", report.verification_status),
        ));
        self.store
            .seal_process_log(
                self.id,
                &serde_json::to_value(&self.records)?,
                &serde_json::to_value(report)?,
            )
            .await?;
        self.sealed = true;
        Ok(())
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }
}

const SECRET_KEYS: [&str; 6] = [
    "api_key",
    "apikey",
    "token",
    "secret",
    "password",
    "authorization",
];

/// Replace values under secret-looking keys before anything lands in a
/// trace.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let lowered = key.to_ascii_lowercase();
                    if SECRET_KEYS.iter().any(|s| lowered.contains(s)) {
                        (key, Value::String("[redacted]".to_string()))
                    } else {
                        (key, redact(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::memory_pool;
    use serde_json::json;

    async fn store() -> Arc<DocumentStore> {
        let store = Arc::new(DocumentStore::new(memory_pool("audit")));
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_log_accumulates_and_seals() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let mut logger = ProcessLogger::start(Arc::clone(&store), owner, None)
            .await
            .unwrap();

        logger.append(StageRecord::new(StageKind::Analysis, "simple query"));
        logger.append(
            StageRecord::new(StageKind::ToolExecution, "rag step")
                .with_detail("top_k", json!(5)),
        );
        logger.flush().await.unwrap();

        let report = AuditReport {
            id: logger.id(),
            sources: vec![],
            reasoning_trace: logger.reasoning_trace(),
            hallucination_assessment: HallucinationAssessment {
                score: Some(9.0),
                flagged_spans: vec![],
            },
            verification_status: VerificationStatus::Verified,
            failed_stage: None,
        };
        logger.seal(&report).await.unwrap();

        let stored = store.get_report(logger.id(), owner).await.unwrap();
        assert_eq!(stored["verification_status"], "verified");

        // Appends after seal are dropped.
        logger.append(StageRecord::new(StageKind::Analysis, "late"));
        assert!(logger
            .records()
            .iter()
            .all(|r| r.content != "late"));
    }

    #[tokio::test]
    async fn test_reasoning_trace_includes_every_stage() {
        let store = store().await;
        let mut logger = ProcessLogger::start(store, Uuid::new_v4(), None).await.unwrap();
        logger.append(StageRecord::new(StageKind::Analysis, "a"));
        logger.append(StageRecord::new(StageKind::Planning, "b"));
        let trace = logger.reasoning_trace();
        assert_eq!(trace, vec!["ANALYSIS: a", "PLANNING: b"]);
    }

    #[test]
    fn test_verification_bucketing() {
        let bucket = |s| VerificationStatus::from_hallucination(s, 8.0, 5.0);
        assert_eq!(bucket(Some(9.0)), VerificationStatus::Verified);
        assert_eq!(bucket(Some(8.0)), VerificationStatus::Verified);
        assert_eq!(bucket(Some(6.5)), VerificationStatus::Partial);
        assert_eq!(bucket(Some(2.0)), VerificationStatus::NotVerified);
        assert_eq!(bucket(None), VerificationStatus::Unknown);
    }

    #[test]
    fn test_redaction() {
        let input = json!({
            "query": "hello",
            "api_key": "sk-12345",
            "nested": {"Authorization": "Bearer abc", "safe": 1},
            "list": [{"password": "x"}]
        });
        let redacted = redact(input);
        assert_eq!(redacted["api_key"], "[redacted]");
        assert_eq!(redacted["nested"]["Authorization"], "[redacted]");
        assert_eq!(redacted["nested"]["safe"], 1);
        assert_eq!(redacted["list"][0]["password"], "[redacted]");
        assert_eq!(redacted["query"], "hello");
    }

    #[test]
    fn test_stage_record_detail_is_redacted() {
        let record = StageRecord::new(StageKind::ToolExecution, "call")
            .with_detail("input", json!({"token": "t", "q": "ok"}));
        let detail = record.detail.unwrap();
        assert_eq!(detail["input"]["token"], "[redacted]");
        assert_eq!(detail["input"]["q"], "ok");
    }
}
