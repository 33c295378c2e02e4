use std::fmt;
use std::str::FromStr;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Builder)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    #[builder(default = uuid::Uuid::new_v4().to_string())]
    pub id: String,
    pub collection_id: String,
    pub environment_id: Option<String>,
    #[builder(default = RunStatus::Queued)]
    pub status: RunStatus,
    pub health: Option<HealthStatus>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[builder(default)]
    pub total_requests: u32,
    #[builder(default)]
    pub success_requests: u32,
    #[builder(default)]
    pub failed_requests: u32,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub error_msg: Option<String>,
    pub report_uri: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Partial,
    Fail,
    Timeout,
    Error,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 8] = [
        RunStatus::Queued,
        RunStatus::Running,
        RunStatus::Success,
        RunStatus::Partial,
        RunStatus::Fail,
        RunStatus::Timeout,
        RunStatus::Error,
        RunStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Fail => "fail",
            RunStatus::Timeout => "timeout",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("invalid status: {value}"))
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Fail,
}

/// One executed request of a run. `request_id` points at the indexed
/// collection request when the executed item could be resolved.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Builder)]
#[serde(rename_all = "camelCase")]
pub struct RunStep {
    #[builder(default = uuid::Uuid::new_v4().to_string())]
    pub id: String,
    pub run_id: String,
    pub request_id: Option<String>,
    pub request_path: Option<String>,
    pub name: String,
    pub order_index: u32,
    #[builder(default = StepStatus::Success)]
    pub status: StepStatus,
    pub http_status: Option<u16>,
    pub latency_ms: Option<u64>,
    pub response_size: Option<u64>,
    pub response: Option<ResponseMeta>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Utf8,
    Base64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub status_text: Option<String>,
    pub headers: Vec<HeaderEntry>,
    pub body_preview: Option<String>,
    pub body_encoding: Option<BodyEncoding>,
    pub truncated: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AssertionStatus {
    Pass,
    Fail,
}

/// `order_index` counts assertions across the whole run, so sorting on it
/// yields step order first and evaluation order within a step.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Builder)]
#[serde(rename_all = "camelCase")]
pub struct RunAssertion {
    #[builder(default = uuid::Uuid::new_v4().to_string())]
    pub id: String,
    pub run_id: String,
    pub run_step_id: String,
    pub order_index: u32,
    pub name: String,
    pub status: AssertionStatus,
    pub error_msg: Option<String>,
}

/// Execution options accepted when a run is created.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    pub timeout_request_ms: Option<u64>,
    pub delay_request_ms: Option<u64>,
    #[serde(default)]
    pub bail: bool,
    #[serde(default)]
    pub insecure: bool,
    pub max_duration_ms: Option<u64>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub environment_id: Option<String>,
    #[serde(flatten)]
    pub options: RunOptions,
}

#[derive(Serialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRun {
    pub run_id: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CancelMode {
    Running,
    Queued,
}

#[derive(Serialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelledRun {
    pub run_id: String,
    pub mode: CancelMode,
}
