//! Obfuscated action references and shells: `.`/`..`/empty path
//! components gum up every pattern-matching consumer of `uses:`, and
//! `shell: cmd` swallows quoting in ways reviewers rarely anticipate.

use anyhow::{Result, anyhow};

use crate::{
    finding::Severity,
    models::{Defaults, Exec, Job, Step, Workflow, uses::parse_action_ref},
    rules::{RuleCore, rule_meta},
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

pub(crate) struct Obfuscation {
    core: RuleCore,
}

rule_meta!(
    Obfuscation,
    "obfuscation",
    "obfuscated action reference or shell"
);

/// The obfuscated components of an action reference's subpath.
fn obfuscated_components(subpath: &str) -> Vec<&'static str> {
    let mut components = vec![];

    for component in subpath.split('/') {
        match component {
            "." => components.push("'.'"),
            ".." => components.push("'..'"),
            "" => components.push("an empty component"),
            _ => {}
        }
    }

    components
}

/// Resolves `.`/`..`/empty components within the subpath. Fails when
/// `..` would climb out of the repository.
fn normalize_subpath(subpath: &str) -> Result<Option<String>> {
    let mut stack: Vec<&str> = vec![];

    for component in subpath.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if stack.pop().is_none() {
                    return Err(anyhow!(
                        "refusing to fix: path normalization escapes the repository"
                    ));
                }
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        Ok(None)
    } else {
        Ok(Some(stack.join("/")))
    }
}

impl Obfuscation {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
        }
    }

    fn check_shell(&mut self, shell: &crate::models::StrValue, level: &str) {
        if shell.as_str().eq_ignore_ascii_case("cmd") {
            self.report(
                shell.position,
                format!(
                    "{} {level} sets `shell: cmd`, whose quoting rules hide command boundaries",
                    Severity::Low.tag(),
                ),
            );
        }
    }

    fn check_defaults(&mut self, defaults: Option<&Defaults>, level: &str) {
        if let Some(shell) = defaults.and_then(|d| d.shell.as_ref()) {
            self.check_shell(shell, level);
        }
    }
}

impl Rule for Obfuscation {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn workflow_pre(&mut self, workflow: &Workflow) -> Result<()> {
        self.check_defaults(workflow.defaults.as_ref(), "workflow defaults block");
        Ok(())
    }

    fn job_pre(&mut self, job: &Job, _workflow: &Workflow) -> Result<()> {
        self.check_defaults(job.defaults.as_ref(), "job defaults block");
        Ok(())
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        if let Some(shell) = step.shell() {
            self.check_shell(shell, "step");
        }

        let Some(uses) = step.uses() else {
            return Ok(());
        };
        let Some(action) = parse_action_ref(uses.as_str()) else {
            return Ok(());
        };
        let Some(subpath) = action.subpath else {
            return Ok(());
        };

        let obfuscated = obfuscated_components(subpath);
        if obfuscated.is_empty() {
            return Ok(());
        }

        for component in &obfuscated {
            self.report(
                step.position,
                format!(
                    "{} action reference `{}` contains {component}",
                    Severity::Low.tag(),
                    uses.as_str()
                ),
            );
        }
        self.register_step_fix(job, step);

        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        let Exec::Action { uses, .. } = &mut step.exec else {
            anyhow::bail!("refusing to fix: step is not an action invocation");
        };

        let normalized = {
            let action = parse_action_ref(uses.as_str())
                .ok_or_else(|| anyhow!("refusing to fix: malformed action reference"))?;
            let Some(subpath) = action.subpath else {
                return Ok(());
            };

            if obfuscated_components(subpath).is_empty() {
                return Ok(());
            }

            let slug = action.slug();
            let git_ref = action.git_ref.to_string();
            match normalize_subpath(subpath)? {
                Some(normalized) => format!("{slug}/{normalized}@{git_ref}"),
                None => format!("{slug}@{git_ref}"),
            }
        };

        let old = uses.as_str().to_string();
        uses.set_value(normalized.clone());
        patches.push(Patch {
            route: uses.route.clone(),
            operation: Op::RewriteFragment {
                from: old,
                to: normalized,
                after: None,
            },
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rules::test_support::{assert_no_findings, run_rule};

    use super::{Obfuscation, normalize_subpath, obfuscated_components};

    #[test]
    fn test_obfuscated_components() {
        assert_eq!(obfuscated_components("a/./b").len(), 1);
        assert_eq!(obfuscated_components("a/../b").len(), 1);
        assert_eq!(obfuscated_components("a//b").len(), 1);
        assert_eq!(obfuscated_components("././/..").len(), 4);
        assert!(obfuscated_components("plain/path").is_empty());
    }

    #[test]
    fn test_normalize_subpath() {
        assert_eq!(normalize_subpath("a/./b").unwrap().as_deref(), Some("a/b"));
        assert_eq!(normalize_subpath("a/../b").unwrap().as_deref(), Some("b"));
        assert_eq!(normalize_subpath("a//b").unwrap().as_deref(), Some("a/b"));
        assert_eq!(normalize_subpath("a/..").unwrap(), None);

        // Escaping the repo prefix is refused.
        assert!(normalize_subpath("../x").is_err());
        assert!(normalize_subpath("a/../../x").is_err());
    }

    #[test]
    fn test_dotted_path_flagged_and_normalized() {
        let (findings, fixed) = run_rule(
            Box::new(Obfuscation::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: octo-org/toolkit/sub/./action@v2
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(
            fixed
                .unwrap()
                .contains("uses: octo-org/toolkit/sub/action@v2")
        );
    }

    #[test]
    fn test_multiple_components_multiple_findings() {
        let (findings, _) = run_rule(
            Box::new(Obfuscation::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: octo-org/toolkit/.//action@v2
"#,
        );

        assert_eq!(findings.len(), 2);
    }

    #[test]
    fn test_escape_is_reported_but_not_fixed() {
        let (findings, fixed) = run_rule(
            Box::new(Obfuscation::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: octo-org/toolkit/../../evil@v2
"#,
        );

        assert_eq!(findings.len(), 2);
        // The fixer refuses to normalize past the repo prefix.
        assert!(fixed.is_none());
    }

    #[test]
    fn test_cmd_shell_flagged_at_all_levels() {
        let (findings, _) = run_rule(
            Box::new(Obfuscation::new()),
            r#"
on: push
defaults:
  run:
    shell: cmd
jobs:
  test:
    runs-on: windows-latest
    defaults:
      run:
        shell: CMD
    steps:
      - run: echo hi
        shell: cmd
"#,
        );

        assert_eq!(findings.len(), 3);
    }

    #[test]
    fn test_clean_references_are_silent() {
        assert_no_findings(
            Box::new(Obfuscation::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - uses: octo-org/toolkit/sub/action@v2
      - run: echo hi
        shell: bash
"#,
        );
    }
}
