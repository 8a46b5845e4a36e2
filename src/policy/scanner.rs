//! Streaming content scanner (spec §4.4 "Streaming scanner").
//!
//! Holds the tail of the previous chunk so a pattern that straddles a chunk
//! boundary is still detected, bounded by an overlap window.

use crate::policy::evaluation::EvaluationResult;
use crate::policy::rules::{ContentRule, RuleAction};

pub const DEFAULT_OVERLAP_WINDOW: usize = 1024;

pub struct StreamingScanner<'a> {
    rules: Vec<&'a ContentRule>,
    overlap_window: usize,
    tail: String,
    /// Bytes already scanned, excluding the retained tail — used so a match
    /// spanning the overlap boundary is not double-reported.
    scanned_len: usize,
}

impl<'a> StreamingScanner<'a> {
    pub fn new(rules: Vec<&'a ContentRule>, overlap_window: usize) -> Self {
        Self {
            rules,
            overlap_window,
            tail: String::new(),
            scanned_len: 0,
        }
    }

    pub fn for_response(rules: &'a [ContentRule], overlap_window: usize) -> Self {
        let filtered = rules
            .iter()
            .filter(|r| r.target.applies_to_response())
            .collect();
        Self::new(filtered, overlap_window)
    }

    /// Feed the next chunk. Scans `tail + chunk`, and reports only matches
    /// whose start is at or after the *new* data (tail-only matches were
    /// already reported on the previous call).
    pub fn scan_chunk(&mut self, chunk: &[u8]) -> EvaluationResult {
        let chunk_str = String::from_utf8_lossy(chunk).into_owned();
        let combined = format!("{}{}", self.tail, chunk_str);
        let tail_len = self.tail.len();

        let mut result = EvaluationResult::default();
        for rule in &self.rules {
            for m in rule.pattern.find_iter(&combined) {
                // A match entirely inside the retained tail was already
                // reported when that tail was the trailing edge of the
                // previous chunk.
                if m.end() <= tail_len {
                    continue;
                }
                result.push(severity_match(rule, m.as_str()));
            }
        }

        self.scanned_len += chunk.len();
        self.tail = tail_suffix(&combined, self.overlap_window);
        result
    }

    /// Scan whatever remains in the tail buffer once the stream has ended.
    pub fn finalize(&mut self) -> EvaluationResult {
        let mut result = EvaluationResult::default();
        for rule in &self.rules {
            for m in rule.pattern.find_iter(&self.tail) {
                result.push(severity_match(rule, m.as_str()));
            }
        }
        self.tail.clear();
        result
    }
}

fn severity_match(rule: &ContentRule, matched: &str) -> crate::session::types::Violation {
    crate::session::types::Violation {
        rule_name: rule.name.clone(),
        severity: rule.severity,
        matched_text: matched.to_string(),
        action: rule.action,
        at: time::OffsetDateTime::now_utc(),
    }
}

fn tail_suffix(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut boundary = s.len() - max_len;
    while boundary < s.len() && !s.is_char_boundary(boundary) {
        boundary += 1;
    }
    s[boundary..].to_string()
}

/// Whether any content rule set has a blocking (block/terminate) action on
/// the response side — the proxy chooses the async-scan path only when this
/// is false (spec §4.6.2).
pub fn response_has_blocking_rule(rules: &[ContentRule]) -> bool {
    rules.iter().any(|r| {
        r.target.applies_to_response()
            && matches!(r.action, RuleAction::Block | RuleAction::Terminate)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::rules::{ContentRule, RuleAction, ScanTarget, Severity};

    fn rule(pattern: &str) -> ContentRule {
        ContentRule::compile(
            "test_rule",
            Severity::Critical,
            RuleAction::Terminate,
            ScanTarget::Response,
            pattern,
        )
        .unwrap()
    }

    #[test]
    fn detects_pattern_straddling_chunk_boundary() {
        let rules = [rule(r"eval\(danger\)")];
        let refs: Vec<&ContentRule> = rules.iter().collect();
        let mut scanner = StreamingScanner::new(refs, 16);

        let r1 = scanner.scan_chunk(b"hello world eval(");
        assert!(r1.violations.is_empty());
        let r2 = scanner.scan_chunk(b"danger) rest");
        assert_eq!(r2.violations.len(), 1);
    }

    #[test]
    fn same_input_any_partition_same_matches() {
        let text = "prefix eval(danger) suffix more eval(danger) tail";
        let rules = [rule(r"eval\(danger\)")];

        // whole-input scan
        let refs: Vec<&ContentRule> = rules.iter().collect();
        let mut whole = StreamingScanner::new(refs, 16);
        let mut whole_count = whole.scan_chunk(text.as_bytes()).violations.len();
        whole_count += whole.finalize().violations.len();

        // chunked scan, arbitrary partitioning
        let refs2: Vec<&ContentRule> = rules.iter().collect();
        let mut chunked = StreamingScanner::new(refs2, 16);
        let mut chunked_count = 0;
        for part in [&text[..10], &text[10..25], &text[25..]] {
            chunked_count += chunked.scan_chunk(part.as_bytes()).violations.len();
        }
        chunked_count += chunked.finalize().violations.len();

        assert_eq!(whole_count, chunked_count);
        assert_eq!(whole_count, 2);
    }
}
