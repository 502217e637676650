use serde::Serialize;

use crate::result::ScenarioResult;

/// One named assertion against a generated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SemanticCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Collects independent checks so that every mismatch in an artifact is reported at once, rather
/// than stopping at the first one.
#[derive(Debug, Default, Clone)]
pub struct SemanticReport {
    checks: Vec<SemanticCheck>,
}

impl SemanticReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, passed: bool, detail: impl Into<String>) -> &mut Self {
        self.checks.push(SemanticCheck {
            name: name.into(),
            passed,
            detail: detail.into(),
        });
        self
    }

    pub fn checks(&self) -> &[SemanticCheck] {
        &self.checks
    }

    pub fn has_failures(&self) -> bool {
        self.checks.iter().any(|check| !check.passed)
    }

    /// Fraction of checks that passed, `0.0` when nothing was checked.
    pub fn pass_rate(&self) -> f64 {
        if self.checks.is_empty() {
            return 0.0;
        }

        let passed = self.checks.iter().filter(|check| check.passed).count();
        passed as f64 / self.checks.len() as f64
    }

    pub fn failures(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|check| !check.passed)
            .map(|check| format!("{}: {}", check.name, check.detail))
            .collect()
    }

    /// The failing checks joined into one message, empty if everything passed.
    pub fn error(&self) -> String {
        self.failures().join("; ")
    }

    /// Write every check and the pass rate into the result as details.
    pub fn record_into(&self, result: &ScenarioResult, prefix: &str) {
        for check in &self.checks {
            result.set_detail(
                format!("{prefix}{}", check.name),
                serde_json::json!({
                    "passed": check.passed,
                    "detail": check.detail,
                }),
            );
        }
        result.set_detail(format!("{prefix}pass_rate"), self.pass_rate());
    }

    /// Fail unless at least `min_pass_rate` of the checks passed.
    ///
    /// A threshold of `1.0` requires every check to pass.
    pub fn ensure(&self, min_pass_rate: f64) -> anyhow::Result<()> {
        if self.checks.is_empty() {
            anyhow::bail!("no semantic checks were recorded");
        }

        let pass_rate = self.pass_rate();
        if pass_rate < min_pass_rate {
            anyhow::bail!(
                "semantic pass rate {:.2} below required {:.2}: {}",
                pass_rate,
                min_pass_rate,
                self.error()
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_report() {
        let mut report = SemanticReport::new();
        report
            .add("x", true, "")
            .add("y", false, "missing y")
            .add("z", true, "");

        assert!(report.has_failures());
        assert!((report.pass_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!("y: missing y", report.error());
        assert_eq!(
            vec!["x", "y", "z"],
            report.checks().iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn empty_report() {
        let report = SemanticReport::new();

        assert!(!report.has_failures());
        assert_eq!(0.0, report.pass_rate());
        assert_eq!("", report.error());
        assert!(report.ensure(0.0).is_err());
    }

    #[test]
    fn failures_are_joined_in_order() {
        let mut report = SemanticReport::new();
        report
            .add("goal", false, "does not mention authentication")
            .add("scope", true, "")
            .add("context", false, "empty");

        assert_eq!(
            "goal: does not mention authentication; context: empty",
            report.error()
        );
    }

    #[test]
    fn ensure_applies_threshold() {
        let mut report = SemanticReport::new();
        report
            .add("a", true, "")
            .add("b", true, "")
            .add("c", true, "")
            .add("d", false, "wrong");

        assert!(report.ensure(0.75).is_ok());

        let err = report.ensure(1.0).unwrap_err();
        assert_eq!(
            "semantic pass rate 0.75 below required 1.00: d: wrong",
            err.to_string()
        );
    }

    #[test]
    fn recorded_into_result() {
        let mut report = SemanticReport::new();
        report.add("has_goal", true, "").add("has_scope", false, "no include list");

        let result = ScenarioResult::new("semantic");
        report.record_into(&result, "plan_check_");

        assert_eq!(Some(serde_json::json!(0.5)), result.detail("plan_check_pass_rate"));
        assert_eq!(
            Some(serde_json::json!({"passed": false, "detail": "no include list"})),
            result.detail("plan_check_has_scope")
        );
    }
}
