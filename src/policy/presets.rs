//! Named rule bundles (spec §4.4): `minimal`, `standard`, `strict`.

use serde::{Deserialize, Serialize};

use crate::error::PolicyLoadError;
use crate::policy::rules::{ContentRule, MetricKind, MetricRule, RuleAction, ScanTarget, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Minimal,
    #[default]
    Standard,
    Strict,
}

/// Build the content rules for a preset. Real deployments would carry the
/// full OWASP LLM0x catalog for `standard`/`strict`; this keeps one
/// representative rule per category named in spec §4.4 (LLM01 prompt
/// injection, LLM02 insecure output handling, LLM06 sensitive information
/// disclosure, LLM07 insecure plugin design, LLM08 excessive agency, LLM10
/// model theft) plus the headline patterns exercised by spec §8's concrete
/// scenarios, and scales rule count with preset strictness.
pub fn content_rules(preset: Preset) -> Result<Vec<ContentRule>, PolicyLoadError> {
    let mut rules = vec![ContentRule::compile(
        "prompt_injection_ignore",
        Severity::Critical,
        RuleAction::Block,
        ScanTarget::Request,
        r"(?i)ignore (all )?previous instructions",
    )?];

    if matches!(preset, Preset::Standard | Preset::Strict) {
        rules.push(ContentRule::compile(
            "prompt_injection_system_prompt",
            Severity::Critical,
            RuleAction::Block,
            ScanTarget::Request,
            r"(?i)reveal (the )?system prompt",
        )?);
        rules.push(ContentRule::compile(
            "output_dangerous_code",
            Severity::Critical,
            RuleAction::Terminate,
            ScanTarget::Response,
            r"eval\s*\(.*input",
        )?);
        rules.push(ContentRule::compile(
            "pii_ssn",
            Severity::Warning,
            RuleAction::Flag,
            ScanTarget::Both,
            r"\b\d{3}-\d{2}-\d{4}\b",
        )?);
        rules.push(ContentRule::compile(
            "jailbreak_dan",
            Severity::Warning,
            RuleAction::Flag,
            ScanTarget::Request,
            r"(?i)\bDAN\b.*(jailbreak|do anything now)",
        )?);
        // LLM07: insecure plugin design — a tool/function-call argument
        // that tries to smuggle a shell command past the plugin boundary.
        rules.push(ContentRule::compile(
            "insecure_plugin_invocation",
            Severity::Warning,
            RuleAction::Flag,
            ScanTarget::Request,
            r#"(?i)"(tool|function|plugin)"\s*:\s*"(exec|shell|eval|system)""#,
        )?);
        // LLM08: excessive agency — a response instructing a destructive
        // shell action be carried out on the caller's behalf.
        rules.push(ContentRule::compile(
            "excessive_agency_shell",
            Severity::Warning,
            RuleAction::Flag,
            ScanTarget::Response,
            r"(?i)rm\s+-rf\s+/",
        )?);
        // LLM10: model theft — a request probing for weights/parameters or
        // asking the model to help clone itself.
        rules.push(ContentRule::compile(
            "model_theft_extraction",
            Severity::Warning,
            RuleAction::Flag,
            ScanTarget::Request,
            r"(?i)(extract|dump|exfiltrate) (the )?model (weights|parameters)|\b(clone|replicate) (this|your) model\b",
        )?);
    }

    if matches!(preset, Preset::Strict) {
        rules.push(ContentRule::compile(
            "exfiltration_api_key",
            Severity::Critical,
            RuleAction::Block,
            ScanTarget::Both,
            r"sk-[A-Za-z0-9]{20,}",
        )?);
        rules.push(ContentRule::compile(
            "excessive_agency_shell_block",
            Severity::Critical,
            RuleAction::Block,
            ScanTarget::Response,
            r"(?i)rm\s+-rf\s+/|:\(\)\{\s*:\|:&\s*\};:",
        )?);
        rules.push(ContentRule::compile(
            "insecure_plugin_invocation_block",
            Severity::Critical,
            RuleAction::Block,
            ScanTarget::Request,
            r#"(?i)"(tool|function|plugin)"\s*:\s*"(exec|shell|eval|system)".*(rm\s+-rf|curl\s+http|wget\s+http)"#,
        )?);
    }

    Ok(rules)
}

/// Metric rules for a preset. Thresholds tighten (lower) as the preset gets
/// stricter, per spec §4.4 ("`strict` ... with lower thresholds").
pub fn metric_rules(preset: Preset) -> Vec<MetricRule> {
    let rpm_threshold = match preset {
        Preset::Minimal => 120,
        Preset::Standard => 60,
        Preset::Strict => 30,
    };
    let mut rules = vec![MetricRule {
        name: "rate_limit_high".to_string(),
        severity: Severity::Warning,
        action: RuleAction::Block,
        kind: MetricKind::RequestsPerMinute {
            threshold: rpm_threshold,
        },
    }];

    if matches!(preset, Preset::Standard | Preset::Strict) {
        rules.push(MetricRule {
            name: "tool_fanout_excessive".to_string(),
            severity: Severity::Warning,
            action: RuleAction::Flag,
            kind: MetricKind::MaxToolFanout {
                threshold: if matches!(preset, Preset::Strict) {
                    10
                } else {
                    25
                },
            },
        });
        rules.push(MetricRule {
            name: "idle_session_stale".to_string(),
            severity: Severity::Info,
            action: RuleAction::Flag,
            kind: MetricKind::MaxIdleSecs { threshold: 3600 },
        });
        rules.push(MetricRule {
            name: "prompt_tokens_excessive".to_string(),
            severity: Severity::Warning,
            action: RuleAction::Flag,
            kind: MetricKind::MaxPromptTokens {
                threshold: if matches!(preset, Preset::Strict) {
                    50_000
                } else {
                    200_000
                },
            },
        });
    }

    if matches!(preset, Preset::Strict) {
        rules.push(MetricRule {
            name: "bytes_in_excessive".to_string(),
            severity: Severity::Warning,
            action: RuleAction::Block,
            kind: MetricKind::MaxBytesIn {
                threshold: 10 * 1024 * 1024,
            },
        });
        rules.push(MetricRule {
            name: "bytes_out_excessive".to_string(),
            severity: Severity::Warning,
            action: RuleAction::Block,
            kind: MetricKind::MaxBytesOut {
                threshold: 20 * 1024 * 1024,
            },
        });
        rules.push(MetricRule {
            name: "session_duration_excessive".to_string(),
            severity: Severity::Info,
            action: RuleAction::Flag,
            kind: MetricKind::MaxDurationSecs { threshold: 4 * 3600 },
        });
        rules.push(MetricRule {
            name: "request_count_excessive".to_string(),
            severity: Severity::Info,
            action: RuleAction::Flag,
            kind: MetricKind::MaxRequestCount { threshold: 5_000 },
        });
    }

    rules
}
