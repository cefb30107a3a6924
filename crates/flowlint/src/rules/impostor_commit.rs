//! Impostor commits: a SHA pin that resolves through GitHub's fork
//! network but doesn't belong to the named repository's history.
//!
//! The ref-lookup technique follows Chainguard's `clank`.

use anyhow::{Context as _, Result, anyhow};

use crate::{
    finding::Severity,
    github_api::{self, FIX_DEADLINE},
    models::{Job, Step, StrValue, Workflow, uses::parse_action_ref},
    rules::{RuleCore, rule_meta},
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

pub(crate) struct ImpostorCommit {
    core: RuleCore,
}

rule_meta!(
    ImpostorCommit,
    "impostor-commit",
    "commit with no history in the referenced repository"
);

impl ImpostorCommit {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
        }
    }

    /// Whether the pinned SHA fails every membership check.
    fn impostor(&self, owner: &str, repo: &str, sha: &str) -> Result<bool> {
        github_api::client()
            .commit_in_repo_history(owner, repo, sha)
            .map(|present| !present)
    }

    fn check_uses(&mut self, uses: &StrValue) -> Option<bool> {
        let action = parse_action_ref(uses.as_str())?;
        if !action.is_pinned() {
            return None;
        }

        match self.impostor(action.owner, action.repo, action.git_ref) {
            Ok(impostor) => Some(impostor),
            Err(err) => {
                // API trouble never fails the lint.
                tracing::warn!(
                    "impostor check skipped for {}: {err}",
                    uses.as_str()
                );
                None
            }
        }
    }

    /// Rewrites the reference to the latest tag's commit, with the tag
    /// name as a trailing line comment.
    fn fix_uses(uses: &mut StrValue, patches: &mut Vec<Patch>) -> Result<()> {
        let (path, latest_tag, sha) = {
            let action = parse_action_ref(uses.as_str())
                .ok_or_else(|| anyhow!("refusing to fix: malformed action reference"))?;
            if !action.is_pinned() {
                // Already rewritten (or never a pin): nothing to do.
                return Ok(());
            }

            let client = github_api::client();
            let latest_tag = client
                .latest_semver_tag(action.owner, action.repo, FIX_DEADLINE)?
                .ok_or_else(|| {
                    anyhow!(
                        "refusing to fix: no semver tag known for {}/{}",
                        action.owner,
                        action.repo
                    )
                })?;
            let sha = client
                .commit_for_ref(action.owner, action.repo, &latest_tag, FIX_DEADLINE)?
                .with_context(|| {
                    format!("refusing to fix: couldn't resolve tag {latest_tag} to a commit")
                })?;

            (action.path(), latest_tag, sha)
        };

        let old = uses.as_str().to_string();
        let pinned = format!("{path}@{sha}");

        uses.set_value(pinned.clone());
        patches.push(Patch {
            route: uses.route.clone(),
            operation: Op::RewriteFragment {
                from: old,
                to: format!("{pinned} # {latest_tag}"),
                after: None,
            },
        });

        Ok(())
    }
}

impl Rule for ImpostorCommit {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        let Some(uses) = step.uses() else {
            return Ok(());
        };

        if self.check_uses(uses) == Some(true) {
            self.report(
                step.position,
                format!(
                    "{} `{}` is pinned to a commit that doesn't belong to the referenced repository",
                    Severity::High.tag(),
                    uses.as_str()
                ),
            );
            self.register_step_fix(job, step);
        }

        Ok(())
    }

    fn job_pre(&mut self, job: &Job, _workflow: &Workflow) -> Result<()> {
        // Reusable workflow calls can be commit-pinned (and therefore
        // impersonated) too.
        let Some(uses) = job.workflow_call.clone() else {
            return Ok(());
        };

        if self.check_uses(&uses) == Some(true) {
            self.report(
                job.position,
                format!(
                    "{} `{}` is pinned to a commit that doesn't belong to the referenced repository",
                    Severity::High.tag(),
                    uses.as_str()
                ),
            );
            self.register_job_fix(job);
        }

        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        match &mut step.exec {
            crate::models::Exec::Action { uses, .. } => Self::fix_uses(uses, patches),
            crate::models::Exec::Run { .. } => {
                anyhow::bail!("refusing to fix: step is not an action invocation")
            }
        }
    }

    fn fix_job(&mut self, job: &mut Job, patches: &mut Vec<Patch>) -> Result<()> {
        match job.workflow_call.as_mut() {
            Some(uses) => Self::fix_uses(uses, patches),
            None => anyhow::bail!("refusing to fix: job has no reusable workflow reference"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        github_api::test_support::{seed_commit_verification, seed_latest_tag, seed_ref_commit},
        rules::test_support::{assert_no_findings, run_rule},
    };

    use super::ImpostorCommit;

    const FORK_SHA: &str = "692973e3d937129bcbf40652eb9f2f61becf3332";
    const REAL_SHA: &str = "a81bbbf8298c0fa03ea29cdc473d45769f953675";
    const TAG_SHA: &str = "11bd71901bbe5b1630ceea73d27597364c9af683";

    #[test]
    fn test_impostor_commit_flagged_and_pinned_to_tag() {
        seed_commit_verification("octo-org", "hello-action", FORK_SHA, false);
        seed_latest_tag("octo-org", "hello-action", "v2.3.1");
        seed_ref_commit("octo-org", "hello-action", "v2.3.1", TAG_SHA);

        let (findings, fixed) = run_rule(
            Box::new(ImpostorCommit::new()),
            &format!(
                r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: octo-org/hello-action@{FORK_SHA}
"#
            ),
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("[High]"));

        let fixed = fixed.unwrap();
        assert!(fixed.contains(&format!(
            "uses: octo-org/hello-action@{TAG_SHA} # v2.3.1"
        )));
    }

    #[test]
    fn test_verified_commit_is_silent() {
        seed_commit_verification("octo-org", "verified-action", REAL_SHA, true);

        assert_no_findings(
            Box::new(ImpostorCommit::new()),
            &format!(
                r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: octo-org/verified-action@{REAL_SHA}
"#
            ),
        );
    }

    #[test]
    fn test_symbolic_refs_are_ignored() {
        // No cache seeding: a symbolic ref must never reach the API.
        assert_no_findings(
            Box::new(ImpostorCommit::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - uses: ./local/action
      - uses: docker://alpine:3.19
      - run: make test
"#,
        );
    }

    #[test]
    fn test_reusable_workflow_call_checked() {
        seed_commit_verification("octo-org", "infra", FORK_SHA, false);
        seed_latest_tag("octo-org", "infra", "v1.4.0");
        seed_ref_commit("octo-org", "infra", "v1.4.0", TAG_SHA);

        let (findings, _) = run_rule(
            Box::new(ImpostorCommit::new()),
            &format!(
                r#"
on: push
jobs:
  deploy:
    uses: octo-org/infra/.github/workflows/deploy.yml@{FORK_SHA}
"#
            ),
        );

        assert_eq!(findings.len(), 1);
    }
}
