//! The autofix engine.
//!
//! During the visitor pass rules register fix targets; afterwards this
//! module replays those registrations in order, letting each rule
//! mutate the typed AST and queue document patches, then applies every
//! patch in one structure-preserving pass.

use std::path::Path;

use anyhow::{Context as _, Result};

use crate::{
    models::Workflow,
    visitor::{FixRequest, FixTarget, Rule},
    yaml_patch::{self, Patch},
};

/// Replays fix registrations against the workflow.
///
/// Individual fixer failures (refusals, unresolved lookups) are logged
/// and skipped; they never fail the lint. Returns the patched document
/// text, or `None` when no fixer produced a patch.
pub(crate) fn apply_fix_requests(
    workflow: &mut Workflow,
    rules: &mut [Box<dyn Rule>],
    requests: &[FixRequest],
) -> Result<Option<String>> {
    let mut patches: Vec<Patch> = Vec::new();

    for request in requests {
        let rule = &mut rules[request.rule];

        let outcome = match &request.target {
            FixTarget::Step { job_id, index } => {
                match workflow
                    .job_mut(job_id)
                    .and_then(|job| job.steps.get_mut(*index))
                {
                    Some(step) => rule.fix_step(step, &mut patches),
                    None => Err(anyhow::anyhow!(
                        "fix target {job_id}/steps[{index}] no longer exists"
                    )),
                }
            }
            FixTarget::Job { job_id } => match workflow.job_mut(job_id) {
                Some(job) => rule.fix_job(job, &mut patches),
                None => Err(anyhow::anyhow!("fix target {job_id} no longer exists")),
            },
        };

        if let Err(err) = outcome {
            tracing::warn!("autofix for {} skipped: {err}", rule.name());
        }
    }

    if patches.is_empty() {
        return Ok(None);
    }

    let patched = yaml_patch::apply_patches(workflow.source(), &patches)
        .context("applying autofix patches")?;

    Ok(Some(patched))
}

/// Persists a fixed workflow, restoring the original contents if the
/// write fails partway.
pub(crate) fn write_fixed(path: &Path, fixed: &str, original: &str) -> Result<()> {
    if let Err(err) = std::fs::write(path, fixed) {
        let _ = std::fs::write(path, original);
        return Err(err).with_context(|| format!("writing fixed workflow to {}", path.display()));
    }

    Ok(())
}
