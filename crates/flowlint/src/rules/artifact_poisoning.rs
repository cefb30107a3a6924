//! Artifact poisoning: downloading artifacts into locations the rest
//! of the job implicitly trusts.

use anyhow::Result;

use crate::{
    finding::Severity,
    models::{Job, Step, StrValue, Workflow, uses::parse_action_ref},
    rules::{RuleCore, ensure_with_entry, rule_meta},
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

/// The replacement path the fixers install.
const SAFE_DOWNLOAD_PATH: &str = "${{ runner.temp }}/artifacts";

/// Download actions that aren't first-party but are common enough to
/// recognize by name.
const THIRD_PARTY_DOWNLOAD_ACTIONS: &[&str] = &[
    "dawidd6/action-download-artifact",
    "aochmann/actions-download-artifact",
    "bettermarks/action-artifact-download",
    "levonet/action-download-last-artifact",
];

/// Whether a `download-artifact` destination is attacker-useful.
///
/// Anything inside (or resolving into) the workspace is unsafe; only
/// the runner's scratch space survives scrutiny.
pub(crate) fn is_unsafe_path(path: &str) -> bool {
    let path = path.trim();

    if path.is_empty() {
        return true;
    }

    if path == "." || path == ".." || path.starts_with("./") || path.starts_with("../") {
        return true;
    }

    if path.contains("github.workspace") || path.contains("GITHUB_WORKSPACE") {
        return true;
    }

    if path.contains("runner.temp") || path.contains("RUNNER_TEMP") {
        return false;
    }

    if path == "/tmp" || path.starts_with("/tmp/") {
        return false;
    }

    // Everything else: other absolute paths (`/var/...`, `C:\...`) and
    // bare relative paths land in or near the workspace.
    true
}

/// Whether the step is a `download-artifact` invocation, and whether
/// it's the first-party action.
fn download_artifact_step(step: &Step) -> Option<bool> {
    let uses = step.uses()?;
    let action = parse_action_ref(uses.as_str())?;

    if action.matches_slug("actions/download-artifact") {
        return Some(true);
    }

    let path = action.path().to_lowercase();
    if THIRD_PARTY_DOWNLOAD_ACTIONS
        .iter()
        .any(|known| action.matches_slug(known))
        || (path.contains("download") && path.contains("artifact"))
    {
        return Some(false);
    }

    None
}

/// Shared fixer: point the download at the runner's scratch space.
///
/// A missing `path:` gets one inserted; an unsafe existing `path:` is
/// replaced. Safe paths are left alone, which also makes repeat
/// invocations no-ops.
fn fix_download_path(step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
    let current = step.input("path").map(|input| input.value.clone());

    match current {
        None => {
            ensure_with_entry(step, "path", SAFE_DOWNLOAD_PATH.into(), patches);
            Ok(())
        }
        Some(value) if is_unsafe_path(value.as_str()) => {
            let route = value.route.clone();
            if let Some(inputs) = step.inputs_mut() {
                if let Some(input) = inputs.get_mut("path") {
                    input.value.set_value(SAFE_DOWNLOAD_PATH);
                }
            }

            patches.push(Patch {
                route,
                operation: Op::Replace(SAFE_DOWNLOAD_PATH.into()),
            });
            Ok(())
        }
        Some(_) => Ok(()),
    }
}

/// Flags first-party artifact downloads into unsafe destinations.
pub(crate) struct ArtifactPoisoning {
    core: RuleCore,
}

rule_meta!(
    ArtifactPoisoning,
    "artifact-poisoning",
    "artifact downloaded to a location the job implicitly trusts"
);

impl ArtifactPoisoning {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
        }
    }
}

impl Rule for ArtifactPoisoning {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        if download_artifact_step(step) != Some(true) {
            return Ok(());
        }

        let path: Option<&StrValue> = step.input("path").map(|input| &input.value);
        let effectively_missing = path.map(|p| p.trim().is_empty()).unwrap_or(true);

        match path {
            _ if effectively_missing => {
                self.report(
                    step.position,
                    format!(
                        "{} artifact is downloaded into the workspace by default; set an explicit path under `runner.temp`",
                        Severity::Critical.tag(),
                    ),
                );
                // Missing/empty paths have a mechanical rewrite.
                self.register_step_fix(job, step);
            }
            Some(path) if is_unsafe_path(path.as_str()) => {
                // An explicit-but-unsafe path may be deliberate; report
                // without touching it.
                self.report(
                    step.position,
                    format!(
                        "{} artifact is downloaded to the unsafe path `{}`; prefer a path under `runner.temp`",
                        Severity::Critical.tag(),
                        path.as_str().trim()
                    ),
                );
            }
            _ => {}
        }

        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        fix_download_path(step, patches)
    }
}

/// Flags third-party artifact downloads under untrusted triggers.
pub(crate) struct UntrustedArtifactDownload {
    core: RuleCore,
    untrusted_trigger: Option<String>,
}

rule_meta!(
    UntrustedArtifactDownload,
    "untrusted-artifact-download",
    "third-party artifact download under an untrusted trigger"
);

/// Triggers under which downloaded artifacts may come from an
/// attacker-controlled run.
const UNTRUSTED_TRIGGERS: &[&str] = &["workflow_run", "pull_request_target", "issue_comment"];

impl UntrustedArtifactDownload {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
            untrusted_trigger: None,
        }
    }
}

impl Rule for UntrustedArtifactDownload {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn workflow_pre(&mut self, workflow: &Workflow) -> Result<()> {
        self.untrusted_trigger = UNTRUSTED_TRIGGERS
            .iter()
            .find(|t| workflow.has_event(t))
            .map(|t| t.to_string());
        Ok(())
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        let Some(trigger) = self.untrusted_trigger.clone() else {
            return Ok(());
        };

        if download_artifact_step(step) != Some(false) {
            return Ok(());
        }

        // Untrusted content stays untrusted wherever it lands, so this
        // fires even for safe paths; only the fix is conditional.
        self.report(
            step.position,
            format!(
                "{} third-party action downloads an artifact while triggered by `{trigger}`; treat its contents as untrusted",
                Severity::Medium.tag(),
            ),
        );

        let path_unsafe = step
            .input("path")
            .map(|input| is_unsafe_path(input.value.as_str()))
            .unwrap_or(true);
        if path_unsafe {
            self.register_step_fix(job, step);
        }

        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        fix_download_path(step, patches)
    }
}
