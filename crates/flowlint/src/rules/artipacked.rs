//! Credential persistence through uploaded artifacts: a checkout that
//! keeps its credentials, followed by an upload of the workspace.

use std::collections::BTreeSet;

use anyhow::Result;
use itertools::Itertools as _;

use crate::{
    finding::Severity,
    location::Position,
    models::{Exec, Input, Job, Step, StrValue, Workflow, uses},
    rules::{RuleCore, rule_meta},
    utils::split_patterns,
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

/// A checkout that doesn't opt out of credential persistence.
struct RiskyCheckout {
    index: usize,
    position: Position,
    /// Major version of the checkout action; 0 for SHA pins.
    version: u64,
}

/// An upload whose path reaches the workspace root.
struct DangerousUpload {
    index: usize,
}

pub(crate) struct Artipacked {
    core: RuleCore,
    checkouts: Vec<RiskyCheckout>,
    uploads: Vec<DangerousUpload>,
}

rule_meta!(
    Artipacked,
    "artipacked",
    "credential persistence through artifact uploads"
);

/// Upload paths that capture the workspace root (and with it, any
/// persisted checkout credentials).
fn dangerous_upload_path(path: &str) -> bool {
    let path = path.trim();

    match path {
        "." | "./" | ".." | "*" | "**" | "**/*" | "./**" | "./**/*" => true,
        p if p.starts_with("../") => true,
        p if p.starts_with("${{ github.workspace }}") || p.starts_with("${{github.workspace}}") => {
            true
        }
        p if p.starts_with("$GITHUB_WORKSPACE") => true,
        _ => false,
    }
}

impl Artipacked {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
            checkouts: vec![],
            uploads: vec![],
        }
    }
}

impl Rule for Artipacked {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn job_pre(&mut self, _job: &Job, _workflow: &Workflow) -> Result<()> {
        self.checkouts.clear();
        self.uploads.clear();
        Ok(())
    }

    fn step(&mut self, step: &Step, _job: &Job, _workflow: &Workflow) -> Result<()> {
        let Some(uses_value) = step.uses() else {
            return Ok(());
        };
        let Some(action) = uses::parse_action_ref(uses_value.as_str()) else {
            return Ok(());
        };

        if action.matches_slug("actions/checkout") {
            // Absent means the default (persist), `false` means safe.
            let persists = step
                .input("persist-credentials")
                .map(|input| input.value.as_str() != "false")
                .unwrap_or(true);

            if persists {
                self.checkouts.push(RiskyCheckout {
                    index: step.index,
                    position: step.position,
                    version: uses::ref_major_version(action.git_ref),
                });
            }
        } else if action.matches_slug("actions/upload-artifact") {
            let Some(path) = step.input("path") else {
                return Ok(());
            };

            if split_patterns(path.value.as_str()).any(dangerous_upload_path) {
                self.uploads.push(DangerousUpload { index: step.index });
            }
        }

        Ok(())
    }

    fn job_post(&mut self, job: &Job, _workflow: &Workflow) -> Result<()> {
        let checkouts = std::mem::take(&mut self.checkouts);
        let uploads = std::mem::take(&mut self.uploads);

        if uploads.is_empty() {
            // No workspace upload in this job: each risky checkout is
            // still worth a (deliberately un-aggregated) warning.
            for checkout in &checkouts {
                self.report(
                    checkout.position,
                    format!(
                        "{} checkout does not set persist-credentials: false (potential risk if the workspace is archived later)",
                        Severity::Medium.tag()
                    ),
                );
                if let Some(step) = job.steps.get(checkout.index) {
                    self.register_step_fix(job, step);
                }
            }
            return Ok(());
        }

        let mut fixed = BTreeSet::new();
        for (checkout, upload) in checkouts.iter().cartesian_product(uploads.iter()) {
            if checkout.index >= upload.index {
                continue;
            }

            let description = if checkout.version != 0 && checkout.version >= 5 {
                format!(
                    "{} checkout persists credentials under $RUNNER_TEMP and a later step uploads the workspace as an artifact",
                    Severity::Medium.tag()
                )
            } else {
                format!(
                    "{} checkout persists credentials in .git/config and a later step uploads the workspace as an artifact",
                    Severity::High.tag()
                )
            };

            self.report(checkout.position, description);
            self.register_fix_once(job, checkout.index, &mut fixed);
        }

        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        let Exec::Action { uses, inputs } = &mut step.exec else {
            anyhow::bail!("refusing to fix: step is not an action invocation");
        };

        let is_checkout = uses::parse_action_ref(uses.as_str())
            .map(|action| action.matches_slug("actions/checkout"))
            .unwrap_or(false);
        if !is_checkout {
            anyhow::bail!("refusing to fix: step is not an actions/checkout invocation");
        }

        match inputs.get_mut("persist-credentials") {
            Some(input) if input.value.as_str() == "false" => return Ok(()),
            Some(input) => input.value.set_value("false"),
            None => {
                let route = step.route.with_key("with").with_key("persist-credentials");
                inputs.insert(
                    "persist-credentials".to_string(),
                    Input {
                        name: "persist-credentials".to_string(),
                        value: StrValue::new("false", step.position, route),
                    },
                );
            }
        }

        let mut with = serde_yaml::Mapping::new();
        with.insert("persist-credentials".into(), false.into());
        patches.push(Patch {
            route: step.route.clone(),
            operation: Op::MergeInto {
                key: "with".into(),
                value: serde_yaml::Value::Mapping(with),
            },
        });

        Ok(())
    }
}

impl Artipacked {
    /// One fix registration per checkout step, no matter how many
    /// uploads pair with it.
    fn register_fix_once(&mut self, job: &Job, index: usize, fixed: &mut BTreeSet<usize>) {
        if fixed.insert(index) {
            if let Some(step) = job.steps.get(index) {
                self.register_step_fix(job, step);
            }
        }
    }
}
