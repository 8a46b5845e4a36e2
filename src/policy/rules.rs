//! Rule taxonomy for the policy engine (spec §4.4).

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PolicyLoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Flag,
    Block,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanTarget {
    Request,
    Response,
    Both,
}

impl ScanTarget {
    pub fn applies_to_request(self) -> bool {
        matches!(self, ScanTarget::Request | ScanTarget::Both)
    }

    pub fn applies_to_response(self) -> bool {
        matches!(self, ScanTarget::Response | ScanTarget::Both)
    }
}

/// A compiled content rule: a pattern over request/response/both.
#[derive(Clone)]
pub struct ContentRule {
    pub name: String,
    pub severity: Severity,
    pub action: RuleAction,
    pub target: ScanTarget,
    pub pattern: Regex,
}

impl ContentRule {
    pub fn compile(
        name: impl Into<String>,
        severity: Severity,
        action: RuleAction,
        target: ScanTarget,
        pattern: &str,
    ) -> Result<Self, PolicyLoadError> {
        let name = name.into();
        let compiled = Regex::new(pattern).map_err(|source| PolicyLoadError::InvalidPattern {
            rule: name.clone(),
            source,
        })?;
        Ok(Self {
            name,
            severity,
            action,
            target,
            pattern: compiled,
        })
    }
}

/// A metric predicate evaluated against session counters (spec §4.4).
#[derive(Clone)]
pub struct MetricRule {
    pub name: String,
    pub severity: Severity,
    pub action: RuleAction,
    pub kind: MetricKind,
}

#[derive(Clone, Copy)]
pub enum MetricKind {
    RequestsPerMinute { threshold: u32 },
    MaxRequestCount { threshold: u64 },
    MaxBytesIn { threshold: u64 },
    MaxBytesOut { threshold: u64 },
    MaxDurationSecs { threshold: i64 },
    MaxIdleSecs { threshold: i64 },
    MaxToolFanout { threshold: usize },
    MaxPromptTokens { threshold: u64 },
}

/// Per-session metrics snapshot handed to `evaluate_session_metrics`.
pub struct SessionMetrics {
    pub request_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_secs: i64,
    pub idle_secs: i64,
    pub requests_last_minute: usize,
    pub tool_fanout: usize,
    pub prompt_tokens: u64,
}

impl MetricRule {
    pub fn evaluate(&self, metrics: &SessionMetrics) -> bool {
        match self.kind {
            MetricKind::RequestsPerMinute { threshold } => {
                metrics.requests_last_minute as u32 > threshold
            }
            MetricKind::MaxRequestCount { threshold } => metrics.request_count > threshold,
            MetricKind::MaxBytesIn { threshold } => metrics.bytes_in > threshold,
            MetricKind::MaxBytesOut { threshold } => metrics.bytes_out > threshold,
            MetricKind::MaxDurationSecs { threshold } => metrics.duration_secs > threshold,
            MetricKind::MaxIdleSecs { threshold } => metrics.idle_secs > threshold,
            MetricKind::MaxToolFanout { threshold } => metrics.tool_fanout > threshold,
            MetricKind::MaxPromptTokens { threshold } => metrics.prompt_tokens > threshold,
        }
    }
}
