//! Self-hosted runner exposure: persistent runners in public
//! repositories carry state (and compromise) between runs.

use anyhow::Result;
use flowlint_exprs::{Expr, ExplicitExpr};

use crate::{
    finding::Severity,
    models::{Job, MatrixKind, MatrixRowKind, Workflow},
    rules::{RuleCore, rule_meta},
    visitor::Rule,
};

pub(crate) struct SelfHostedRunner {
    core: RuleCore,
}

rule_meta!(
    SelfHostedRunner,
    "self-hosted-runner",
    "job runs on a self-hosted runner"
);

/// The matrix axis a `runs-on: ${{ matrix.X }}` expression selects.
fn matrix_axis(expr: &str) -> Option<String> {
    let bare = ExplicitExpr::from_curly(expr)?;
    let parsed = Expr::parse(bare.as_bare()).ok()?;

    let Expr::Context(ctx) = parsed else {
        return None;
    };
    if !ctx.child_of("matrix") {
        return None;
    }

    ctx.single_tail().map(|axis| axis.to_string())
}

/// Whether a raw matrix cell mentions `self-hosted`, descending into
/// list-valued cells.
fn cell_is_self_hosted(value: &serde_yaml::Value) -> bool {
    match value {
        serde_yaml::Value::String(s) => s.eq_ignore_ascii_case("self-hosted"),
        serde_yaml::Value::Sequence(values) => values.iter().any(cell_is_self_hosted),
        _ => false,
    }
}

impl SelfHostedRunner {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
        }
    }
}

impl Rule for SelfHostedRunner {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn job_pre(&mut self, job: &Job, _workflow: &Workflow) -> Result<()> {
        let Some(runner) = &job.runs_on else {
            return Ok(());
        };

        if runner
            .labels
            .iter()
            .any(|l| l.as_str().eq_ignore_ascii_case("self-hosted"))
        {
            self.report(
                runner.position,
                format!(
                    "{} job `{}` runs on a self-hosted runner",
                    Severity::Medium.tag(),
                    job.id.as_str()
                ),
            );
        }

        if let Some(group) = &runner.group {
            self.report(
                runner.position,
                format!(
                    "{} job `{}` targets the runner group `{}`; runner groups are typically self-hosted",
                    Severity::Medium.tag(),
                    job.id.as_str(),
                    group.as_str()
                ),
            );
        }

        Ok(())
    }

    fn job_post(&mut self, job: &Job, workflow: &Workflow) -> Result<()> {
        // `runs-on: ${{ matrix.X }}`: scan the axis's static values.
        let Some(runner) = &job.runs_on else {
            return Ok(());
        };
        let Some(expr) = &runner.labels_expr else {
            return Ok(());
        };
        let Some(axis) = matrix_axis(expr.as_str()) else {
            return Ok(());
        };

        let Some(matrix) = &job.matrix else {
            return Ok(());
        };
        let MatrixKind::Rows(rows) = &matrix.kind else {
            // A wholly dynamic matrix has nothing static to scan.
            return Ok(());
        };
        let Some(row) = rows.get(&axis) else {
            return Ok(());
        };
        let MatrixRowKind::Values(values) = &row.kind else {
            // Dynamic axes are skipped.
            return Ok(());
        };

        for (idx, value) in values.iter().enumerate() {
            if cell_is_self_hosted(value) {
                let position = workflow.locate(&row.route.with_index(idx));
                self.report(
                    position,
                    format!(
                        "{} matrix axis `{axis}` expands `runs-on` to a self-hosted runner",
                        Severity::Medium.tag(),
                    ),
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rules::test_support::{assert_no_findings, run_rule};

    use super::SelfHostedRunner;

    #[test]
    fn test_static_label() {
        let (findings, _) = run_rule(
            Box::new(SelfHostedRunner::new()),
            r#"
on: push
jobs:
  build:
    runs-on: [self-hosted, linux, x64]
    steps:
      - run: make
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("self-hosted"));
    }

    #[test]
    fn test_bare_string_label_case_insensitive() {
        let (findings, _) = run_rule(
            Box::new(SelfHostedRunner::new()),
            r#"
on: push
jobs:
  build:
    runs-on: Self-Hosted
    steps:
      - run: make
"#,
        );

        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_runner_group() {
        let (findings, _) = run_rule(
            Box::new(SelfHostedRunner::new()),
            r#"
on: push
jobs:
  build:
    runs-on:
      group: datacenter-runners
    steps:
      - run: make
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("datacenter-runners"));
    }

    #[test]
    fn test_matrix_expansion() {
        let (findings, _) = run_rule(
            Box::new(SelfHostedRunner::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ${{ matrix.os }}
    strategy:
      matrix:
        os: [ubuntu-latest, self-hosted]
    steps:
      - run: make test
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("matrix axis `os`"));
        // The finding points at the matrix cell.
        assert_eq!(findings[0].position.line, 8);
    }

    #[test]
    fn test_matrix_list_cells() {
        let (findings, _) = run_rule(
            Box::new(SelfHostedRunner::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ${{ matrix.runner }}
    strategy:
      matrix:
        runner:
          - [self-hosted, linux]
          - ubuntu-latest
    steps:
      - run: make test
"#,
        );

        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_dynamic_axis_skipped() {
        assert_no_findings(
            Box::new(SelfHostedRunner::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ${{ matrix.os }}
    strategy:
      matrix:
        os: ${{ fromJSON(inputs.runners) }}
    steps:
      - run: make test
"#,
        );
    }

    #[test]
    fn test_hosted_runners_are_silent() {
        assert_no_findings(
            Box::new(SelfHostedRunner::new()),
            r#"
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: make
  windows:
    runs-on: [windows-latest]
    steps:
      - run: make
"#,
        );
    }
}
