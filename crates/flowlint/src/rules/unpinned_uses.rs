//! Unpinned action references: anything not pinned to a full commit
//! SHA can move underneath the workflow.

use std::sync::LazyLock;

use anyhow::{Context as _, Result, anyhow};
use regex::Regex;

use crate::{
    finding::Severity,
    github_api::{self, FIX_DEADLINE},
    models::{Exec, Job, Step, Workflow, uses::parse_action_ref},
    rules::{RuleCore, rule_meta},
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

/// Short symbolic tags (`v3`) that deserve a long-semver comment.
static SHORT_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^v\d+$").unwrap());

/// Tags that already name a specific release (`v3.5.2`, `1.2.3-rc1`).
static SPECIFIC_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^v?\d+\.\d+\.\d+").unwrap());

pub(crate) struct UnpinnedUses {
    core: RuleCore,
}

rule_meta!(
    UnpinnedUses,
    "unpinned-uses",
    "action reference is not pinned to a commit"
);

impl UnpinnedUses {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
        }
    }

    /// Resolves the ref to its SHA and rewrites the reference to
    /// `path@sha`, with the best-known tag as a trailing comment.
    fn fix_uses(
        uses: &mut crate::models::StrValue,
        patches: &mut Vec<Patch>,
    ) -> Result<()> {
        let (old, pinned, comment) = {
            let action = parse_action_ref(uses.as_str())
                .ok_or_else(|| anyhow!("refusing to fix: malformed action reference"))?;
            if action.is_pinned() {
                return Ok(());
            }

            let client = github_api::client();
            let sha = client
                .commit_for_ref(action.owner, action.repo, action.git_ref, FIX_DEADLINE)?
                .with_context(|| {
                    format!(
                        "refusing to fix: couldn't resolve {} to a commit",
                        action.git_ref
                    )
                })?;

            // `v3` alone makes a poor provenance comment; hunt for a
            // long semver tag sharing the SHA. Specific tags comment
            // as themselves.
            let comment = if SHORT_TAG.is_match(action.git_ref) {
                client
                    .longest_tag_for_commit(action.owner, action.repo, &sha, FIX_DEADLINE)
                    .ok()
                    .flatten()
                    .map(|t| t.name)
                    .filter(|name| SPECIFIC_TAG.is_match(name))
                    .unwrap_or_else(|| action.git_ref.to_string())
            } else {
                action.git_ref.to_string()
            };

            (
                uses.as_str().to_string(),
                format!("{}@{sha}", action.path()),
                comment,
            )
        };

        uses.set_value(pinned.clone());
        patches.push(Patch {
            route: uses.route.clone(),
            operation: Op::RewriteFragment {
                from: old,
                to: format!("{pinned} # {comment}"),
                after: None,
            },
        });

        Ok(())
    }
}

impl Rule for UnpinnedUses {
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
        let Some(action) = parse_action_ref(uses.as_str()) else {
            return Ok(());
        };

        if !action.is_pinned() {
            self.report(
                step.position,
                format!(
                    "{} `{}` is not pinned to a full commit SHA",
                    Severity::Low.tag(),
                    uses.as_str()
                ),
            );
            self.register_step_fix(job, step);
        }

        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        match &mut step.exec {
            Exec::Action { uses, .. } => Self::fix_uses(uses, patches),
            Exec::Run { .. } => anyhow::bail!("refusing to fix: step is not an action invocation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        github_api::test_support::{seed_ref_commit, seed_tags},
        rules::test_support::{assert_no_findings, run_rule},
    };

    use super::UnpinnedUses;

    const SHA: &str = "8f4b7f84864484a7bf31766abe9204da3cbe65b3";

    #[test]
    fn test_short_tag_pinned_with_long_comment() {
        seed_ref_commit("octo-org", "builder", "v3", SHA);
        seed_tags(
            "octo-org",
            "builder",
            &[("v3", SHA), ("v3.5.2", SHA), ("v3.5", SHA)],
        );

        let (findings, fixed) = run_rule(
            Box::new(UnpinnedUses::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: octo-org/builder@v3
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("[Low]"));

        assert!(
            fixed
                .unwrap()
                .contains(&format!("uses: octo-org/builder@{SHA} # v3.5.2"))
        );
    }

    #[test]
    fn test_specific_tag_comments_as_itself() {
        seed_ref_commit("octo-org", "builder2", "v1.2.3", SHA);

        let (_, fixed) = run_rule(
            Box::new(UnpinnedUses::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: octo-org/builder2@v1.2.3
"#,
        );

        assert!(
            fixed
                .unwrap()
                .contains(&format!("uses: octo-org/builder2@{SHA} # v1.2.3"))
        );
    }

    #[test]
    fn test_branch_ref_comments_as_itself() {
        seed_ref_commit("octo-org", "builder3", "main", SHA);

        let (findings, fixed) = run_rule(
            Box::new(UnpinnedUses::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: octo-org/builder3@main
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(
            fixed
                .unwrap()
                .contains(&format!("uses: octo-org/builder3@{SHA} # main"))
        );
    }

    #[test]
    fn test_pinned_and_local_are_silent() {
        assert_no_findings(
            Box::new(UnpinnedUses::new()),
            &format!(
                r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@{SHA}
      - uses: ./local/action
      - run: make test
"#
            ),
        );
    }
}
