//! Always-truthy conditions: a lone `${{ ... }}` fence embedded in
//! other text evaluates to a non-empty string, so the `if:` always
//! passes regardless of the expression inside.

use anyhow::Result;

use crate::{
    finding::Severity,
    models::{Job, Step, StrValue, Workflow},
    rules::{RuleCore, rule_meta},
    utils::extract_expressions,
    visitor::Rule,
};

/// Operator tokens that make surrounding text semantically
/// significant rather than accidental.
const OPERATOR_TOKENS: &[&str] = &["==", "!=", ">=", "<=", ">", "<", "&&", "||", "!"];

/// Whether the condition is an always-truthy template string.
fn always_truthy(cond: &str) -> bool {
    let exprs = extract_expressions(cond);

    // Bare expressions (no fence) and multi-fence templates evaluate
    // normally; only the lone-fence case can surprise.
    let [(_, span)] = exprs.as_slice() else {
        return false;
    };

    // A single all-encompassing fence evaluates normally too.
    if cond[..span.start].trim().is_empty() && cond[span.end..].trim().is_empty() {
        return false;
    }

    // Operator text outside the fence means the author is composing a
    // larger (valid) expression.
    let outside = format!("{}{}", &cond[..span.start], &cond[span.end..]);
    !OPERATOR_TOKENS.iter().any(|op| outside.contains(op))
}

pub(crate) struct UnsoundCondition {
    core: RuleCore,
}

rule_meta!(
    UnsoundCondition,
    "unsound-condition",
    "condition is always truthy"
);

impl UnsoundCondition {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
        }
    }

    fn check_condition(&mut self, cond: &StrValue) {
        if always_truthy(cond.as_str()) {
            self.report(
                cond.position,
                format!(
                    "{} condition is a template string, not an expression, and is always truthy; if that's intended, write `${{{{ true }}}}`",
                    Severity::High.tag(),
                ),
            );
        }
    }
}

impl Rule for UnsoundCondition {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn job_pre(&mut self, job: &Job, _workflow: &Workflow) -> Result<()> {
        if let Some(cond) = &job.cond {
            self.check_condition(&cond.clone());
        }
        Ok(())
    }

    fn step(&mut self, step: &Step, _job: &Job, _workflow: &Workflow) -> Result<()> {
        if let Some(cond) = &step.cond {
            self.check_condition(&cond.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rules::test_support::{assert_no_findings, run_rule};

    use super::{UnsoundCondition, always_truthy};

    #[test]
    fn test_always_truthy() {
        // A lone fence inside non-operator text: truthy.
        assert!(always_truthy("check ${{ github.ref }}"));
        assert!(always_truthy("${{ false }} enabled"));
        assert!(always_truthy("run-if ${{ github.ref == 'main' }}"));

        // Whole-string fences evaluate normally.
        assert!(!always_truthy("${{ github.ref == 'main' }}"));
        assert!(!always_truthy("  ${{ github.ref == 'main' }} "));

        // Bare expressions evaluate normally.
        assert!(!always_truthy("github.ref == 'main'"));
        assert!(!always_truthy("true"));

        // Multiple fences compose a larger template; out of scope.
        assert!(!always_truthy("${{ a }}${{ b }}"));

        // Operators outside the fence mean deliberate composition.
        assert!(!always_truthy("${{ github.ref }} == 'refs/heads/main'"));
        assert!(!always_truthy("!${{ inputs.skip }}"));
    }

    #[test]
    fn test_embedded_fence_reported() {
        let (findings, fixed) = run_rule(
            Box::new(UnsoundCondition::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    if: "run-if ${{ github.ref == 'refs/heads/main' }}"
    steps:
      - run: ./deploy.sh
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("always truthy"));
        assert!(findings[0].description.contains("${{ true }}"));
        assert!(fixed.is_none());
    }

    #[test]
    fn test_step_condition_with_surrounding_text() {
        let (findings, _) = run_rule(
            Box::new(UnsoundCondition::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    steps:
      - if: deploy ${{ inputs.target }}
        run: ./deploy.sh
"#,
        );

        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_valid_conditions_are_silent() {
        assert_no_findings(
            Box::new(UnsoundCondition::new()),
            r#"
on: push
jobs:
  a:
    runs-on: ubuntu-latest
    if: ${{ github.ref == 'refs/heads/main' }}
    steps:
      - run: echo one
  b:
    runs-on: ubuntu-latest
    if: github.event_name == 'push'
    steps:
      - run: echo two
  c:
    runs-on: ubuntu-latest
    if: ${{ github.ref }} == 'refs/heads/main'
    steps:
      - run: echo three
"#,
        );
    }
}
