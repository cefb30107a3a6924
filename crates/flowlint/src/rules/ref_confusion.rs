//! Ref confusion: a symbolic ref that exists as both a branch and a
//! tag, leaving which one runs up to the resolver.

use anyhow::{Context as _, Result, anyhow};

use crate::{
    finding::Severity,
    github_api::{self, FIX_DEADLINE},
    models::{Job, Step, StrValue, Workflow, uses::parse_action_ref},
    rules::{RuleCore, rule_meta},
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

pub(crate) struct RefConfusion {
    core: RuleCore,
}

rule_meta!(
    RefConfusion,
    "ref-confusion",
    "action ref exists in both branch and tag namespaces"
);

impl RefConfusion {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
        }
    }

    fn confusable(&self, uses: &StrValue) -> Option<bool> {
        let action = parse_action_ref(uses.as_str())?;
        if action.is_pinned() {
            // Full SHAs name exactly one object.
            return None;
        }

        match github_api::client().ref_confusable(action.owner, action.repo, action.git_ref) {
            Ok(confusable) => Some(confusable),
            Err(err) => {
                tracing::warn!("ref confusion check skipped for {}: {err}", uses.as_str());
                None
            }
        }
    }

    /// Pins the reference to the tag's current commit (the tag wins
    /// the ambiguity, so the fix pins what the author most likely
    /// meant).
    fn fix_uses(uses: &mut StrValue, patches: &mut Vec<Patch>) -> Result<()> {
        let (old, pinned) = {
            let action = parse_action_ref(uses.as_str())
                .ok_or_else(|| anyhow!("refusing to fix: malformed action reference"))?;
            if action.is_pinned() {
                return Ok(());
            }

            let sha = github_api::client()
                .commit_for_ref(action.owner, action.repo, action.git_ref, FIX_DEADLINE)?
                .with_context(|| {
                    format!(
                        "refusing to fix: couldn't resolve {} to a commit",
                        action.git_ref
                    )
                })?;

            (uses.as_str().to_string(), format!("{}@{sha}", action.path()))
        };

        uses.set_value(pinned.clone());
        patches.push(Patch {
            route: uses.route.clone(),
            operation: Op::RewriteFragment {
                from: old,
                to: pinned,
                after: None,
            },
        });

        Ok(())
    }
}

impl Rule for RefConfusion {
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

        if self.confusable(uses) == Some(true) {
            self.report(
                step.position,
                format!(
                    "{} `{}` uses a ref that's provided by both the branch and tag namespaces",
                    Severity::Medium.tag(),
                    uses.as_str()
                ),
            );
            self.register_step_fix(job, step);
        }

        Ok(())
    }

    fn job_pre(&mut self, job: &Job, _workflow: &Workflow) -> Result<()> {
        let Some(uses) = job.workflow_call.clone() else {
            return Ok(());
        };

        if self.confusable(&uses) == Some(true) {
            self.report(
                job.position,
                format!(
                    "{} `{}` uses a ref that's provided by both the branch and tag namespaces",
                    Severity::Medium.tag(),
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
