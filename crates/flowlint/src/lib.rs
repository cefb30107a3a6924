//! flowlint — static security analysis for CI workflow definitions.
//!
//! The engine parses workflow YAML into a typed, position-bearing AST,
//! walks it once dispatching every registered [`Rule`]'s callbacks,
//! and collects [`Finding`]s. Rules with a mechanical repair register
//! autofixes during the pass; the fix engine replays them afterwards,
//! patching the document text while preserving comments and layout.
//!
//! The CLI shell, file discovery, and output formatting live with the
//! callers of [`analyze`] and [`analyze_file`]; this crate is the rule
//! engine.

use std::path::Path;

use thiserror::Error;

pub mod config;
pub mod finding;
pub mod location;
pub mod models;
pub mod rules;
pub mod visitor;

mod fix;
mod github_api;
mod utils;
mod yaml_patch;

pub use config::{Config, FixMode};
pub use finding::{Finding, Severity};
pub use location::Position;
pub use models::{ParseError, Workflow};
pub use visitor::{Driver, Rule};

/// Top-level analysis errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The workflow couldn't be parsed; other workflows in the same
    /// run are unaffected.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// An internal engine failure.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// The result of analyzing one workflow.
#[derive(Debug)]
pub struct Analysis {
    /// Findings, in traversal order per rule, with ignore patterns
    /// applied.
    pub findings: Vec<Finding>,
    /// The autofixed document text, when fixes applied and the fix
    /// mode asked for them.
    pub fixed: Option<String>,
}

impl Analysis {
    /// Renders findings through the configured format template (or
    /// the default presentation).
    pub fn render(&self, config: &Config) -> Vec<String> {
        self.findings
            .iter()
            .map(|finding| match &config.format {
                Some(template) => finding.render(template),
                None => finding.to_string(),
            })
            .collect()
    }
}

/// Analyzes a single workflow document.
///
/// Rule callback errors are contained per rule, and autofix or API
/// failures never fail the lint; only unparseable input errors out.
pub fn analyze(path: &str, contents: &str, config: &Config) -> Result<Analysis, Error> {
    let mut workflow = Workflow::from_string(path, contents)?;

    let mut driver = Driver::new(rules::default_rules(config));
    let requests = driver.visit(&workflow);

    let findings = driver
        .take_findings()
        .into_iter()
        .filter(|finding| !config.ignores(finding))
        .collect();

    let fixed = match config.fix_mode {
        FixMode::Off => None,
        FixMode::On | FixMode::DryRun => {
            match fix::apply_fix_requests(&mut workflow, &mut driver.rules, &requests) {
                Ok(fixed) => fixed,
                Err(err) => {
                    // Engine errors in autofix are reported and
                    // skipped, never fatal.
                    tracing::warn!("autofix failed for {path}: {err}");
                    None
                }
            }
        }
    };

    Ok(Analysis { findings, fixed })
}

/// Analyzes a workflow file on disk, rewriting it in place when the
/// fix mode is [`FixMode::On`] and fixes applied.
pub fn analyze_file(path: &Path, config: &Config) -> Result<Analysis, Error> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Internal(anyhow::Error::new(e).context("reading workflow")))?;

    let analysis = analyze(&path.display().to_string(), &contents, config)?;

    if config.fix_mode == FixMode::On {
        if let Some(fixed) = &analysis.fixed {
            fix::write_fixed(path, fixed, &contents)?;
        }
    }

    Ok(analysis)
}

/// Process exit statuses for lint runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// No findings.
    NoFindings,
    /// At least one finding.
    FindingsPresent,
    /// The caller's invocation was invalid.
    InvalidInvocation,
    /// The engine failed internally.
    InternalError,
}

impl ExitStatus {
    /// The numeric exit code.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::NoFindings => 0,
            ExitStatus::FindingsPresent => 1,
            ExitStatus::InvalidInvocation => 2,
            ExitStatus::InternalError => 3,
        }
    }

    /// The status an analysis outcome maps to.
    pub fn from_outcome(outcome: &Result<Analysis, Error>) -> Self {
        match outcome {
            Ok(analysis) if analysis.findings.is_empty() => ExitStatus::NoFindings,
            Ok(_) => ExitStatus::FindingsPresent,
            Err(Error::Parse(_)) => ExitStatus::InvalidInvocation,
            Err(Error::Internal(_)) => ExitStatus::InternalError,
        }
    }
}
