//! Evaluation result contract shared by request, response, and metric
//! evaluation (spec §4.4).

use crate::session::types::Violation;

#[derive(Debug, Default, Clone)]
pub struct EvaluationResult {
    pub violations: Vec<Violation>,
    pub should_block: bool,
    pub should_terminate: bool,
}

impl EvaluationResult {
    pub fn push(&mut self, v: Violation) {
        use crate::policy::rules::RuleAction;
        match v.action {
            RuleAction::Block => self.should_block = true,
            RuleAction::Terminate => self.should_terminate = true,
            RuleAction::Flag => {}
        }
        self.violations.push(v);
    }

    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Audit mode forces effects off while preserving the recorded
    /// violations — spec §4.4 "do not translate actions; ... suppress
    /// effects at the proxy's decision sites".
    pub fn suppress_effects(mut self) -> Self {
        self.should_block = false;
        self.should_terminate = false;
        self
    }
}
