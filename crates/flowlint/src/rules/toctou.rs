//! Time-of-check/time-of-use on deployment approvals: an
//! environment-gated job that checks out a mutable PR ref runs
//! whatever the branch points at once a reviewer approves.

use anyhow::Result;

use crate::{
    finding::Severity,
    models::{Job, Step, Workflow, uses::parse_action_ref},
    rules::{RuleCore, fix_mutable_checkout_ref, has_mutable_pr_ref, rule_meta},
    visitor::Rule,
    yaml_patch::Patch,
};

pub(crate) struct ToctouCheckout {
    core: RuleCore,
    /// The PR-ish trigger the workflow runs on, if any.
    trigger: Option<String>,
    /// The current job's environment name, when it declares one.
    environment: Option<String>,
}

rule_meta!(
    ToctouCheckout,
    "toctou-checkout",
    "approval-gated job checks out a mutable pull request ref"
);

impl ToctouCheckout {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
            trigger: None,
            environment: None,
        }
    }
}

impl Rule for ToctouCheckout {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn workflow_pre(&mut self, workflow: &Workflow) -> Result<()> {
        self.trigger = ["pull_request_target", "pull_request"]
            .iter()
            .find(|t| workflow.has_event(t))
            .map(|t| t.to_string());
        Ok(())
    }

    fn job_pre(&mut self, job: &Job, _workflow: &Workflow) -> Result<()> {
        self.environment = job
            .environment
            .as_ref()
            .map(|env| env.display_name().to_string());
        Ok(())
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        let (Some(trigger), Some(environment)) = (self.trigger.clone(), self.environment.clone())
        else {
            return Ok(());
        };

        let is_checkout = step
            .uses()
            .and_then(|u| parse_action_ref(u.as_str()))
            .map(|action| action.matches_slug("actions/checkout"))
            .unwrap_or(false);
        if !is_checkout {
            return Ok(());
        }

        let Some(ref_input) = step.input("ref") else {
            return Ok(());
        };
        if !has_mutable_pr_ref(ref_input.value.as_str()) {
            return Ok(());
        }

        self.report(
            step.position,
            format!(
                "{} environment `{environment}` gates this job, but the checkout follows a mutable ref while triggered by `{trigger}`; the approved commit can change before deployment",
                Severity::High.tag(),
            ),
        );
        self.register_step_fix(job, step);

        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        fix_mutable_checkout_ref(step, patches);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rules::test_support::{assert_no_findings, run_rule};

    use super::ToctouCheckout;

    #[test]
    fn test_environment_gated_mutable_checkout() {
        let (findings, fixed) = run_rule(
            Box::new(ToctouCheckout::new()),
            r#"
on: pull_request_target
jobs:
  deploy:
    runs-on: ubuntu-latest
    environment: production
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.event.pull_request.head.ref }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("[High]"));
        assert!(findings[0].description.contains("`production`"));
        assert!(findings[0].description.contains("pull_request_target"));

        assert!(
            fixed
                .unwrap()
                .contains("ref: ${{ github.event.pull_request.head.sha }}")
        );
    }

    #[test]
    fn test_unnamed_environment() {
        let (findings, _) = run_rule(
            Box::new(ToctouCheckout::new()),
            r#"
on: pull_request
jobs:
  deploy:
    runs-on: ubuntu-latest
    environment:
      url: https://preview.example.com
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.head_ref }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("(unnamed)"));
    }

    #[test]
    fn test_no_environment_is_silent() {
        assert_no_findings(
            Box::new(ToctouCheckout::new()),
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.event.pull_request.head.ref }}
"#,
        );
    }

    #[test]
    fn test_pinned_sha_is_silent() {
        assert_no_findings(
            Box::new(ToctouCheckout::new()),
            r#"
on: pull_request_target
jobs:
  deploy:
    runs-on: ubuntu-latest
    environment: production
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.event.pull_request.head.sha }}
"#,
        );
    }

    #[test]
    fn test_push_trigger_is_silent() {
        assert_no_findings(
            Box::new(ToctouCheckout::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    environment: production
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.head_ref }}
"#,
        );
    }
}
