//! Untrusted event data flowing into `$GITHUB_PATH` / `$GITHUB_ENV`
//! writes: both files let the current job rewrite its own (and later
//! steps') execution environment.

use anyhow::Result;
use flowlint_exprs::Expr;
use indexmap::IndexMap;

use crate::{
    finding::Severity,
    models::{Env, EnvVar, Exec, Job, Step, StrValue, Workflow},
    rules::{RuleCore, rule_meta},
    utils::{bare_expression, extract_expressions},
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

/// Triggers that run with the base repository's permissions/secrets.
const PRIVILEGED_TRIGGERS: &[&str] = &[
    "pull_request_target",
    "workflow_run",
    "issue_comment",
    "issues",
    "discussion_comment",
];

/// One untrusted expression feeding a runner-file write.
#[derive(Debug, Clone)]
struct InjectionSite {
    /// Zero-based line within the script.
    line: usize,
    /// The `${{ ... }}` fragment exactly as written.
    fenced: String,
    /// The untrusted context inside it.
    context: String,
}

/// Whether the line appends to the given runner file (quoted or not).
fn writes_to(line: &str, sink: &str) -> bool {
    line.contains(&format!(">> \"${sink}\"")) || line.contains(&format!(">> ${sink}"))
}

/// Collects the `github.event.*` contexts in an expression.
fn event_contexts(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Context(ctx) => {
            if ctx.child_of("github.event") {
                out.push(ctx.as_str().to_string());
            }
        }
        Expr::Call { args, .. } => {
            for arg in args {
                event_contexts(arg, out);
            }
        }
        Expr::Index(inner) => event_contexts(inner, out),
        Expr::BinOp { lhs, rhs, .. } => {
            event_contexts(lhs, out);
            event_contexts(rhs, out);
        }
        Expr::UnOp { expr, .. } => event_contexts(expr, out),
        _ => {}
    }
}

/// Finds untrusted expressions in the value a script line appends to
/// `sink`.
fn scan_script(script: &str, sink: &str) -> Vec<InjectionSite> {
    let mut sites = vec![];

    for (line_idx, line) in script.lines().enumerate() {
        if !writes_to(line, sink) {
            continue;
        }

        // Only the appended value matters, not the redirection target.
        let prefix = line.split(">>").next().unwrap_or(line);

        for (fenced, _) in extract_expressions(prefix) {
            let Ok(expr) = Expr::parse(bare_expression(fenced)) else {
                tracing::warn!("couldn't parse expression: {fenced}");
                continue;
            };

            let mut contexts = vec![];
            event_contexts(&expr, &mut contexts);
            for context in contexts {
                sites.push(InjectionSite {
                    line: line_idx,
                    fenced: fenced.to_string(),
                    context,
                });
            }
        }
    }

    sites
}

/// A shell-safe environment variable name for a context.
fn env_var_name(context: &str) -> String {
    let mut name: String = context
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();

    while name.contains("__") {
        name = name.replace("__", "_");
    }

    name.trim_matches('_').to_string()
}

/// Applies the step-level env bindings a fix introduced: the AST gains
/// the variables and a `MergeInto` patch mirrors them into the
/// document.
fn bind_step_env(
    step: &mut Step,
    bindings: &IndexMap<String, String>,
    patches: &mut Vec<Patch>,
) {
    if bindings.is_empty() {
        return;
    }

    match &mut step.env {
        Some(Env::Expr(_)) => {
            // A whole-block env expression can't be merged into.
            tracing::warn!("step env is an expression; leaving bindings unmerged");
            return;
        }
        Some(Env::Vars(vars)) => {
            for (name, value) in bindings {
                if vars.contains_key(name) {
                    continue;
                }
                vars.insert(
                    name.clone(),
                    EnvVar {
                        name: name.clone(),
                        value: StrValue::new(
                            value.clone(),
                            step.position,
                            step.route.with_key("env").with_key(name.as_str()),
                        ),
                    },
                );
            }
        }
        None => {
            let mut vars = IndexMap::new();
            for (name, value) in bindings {
                vars.insert(
                    name.clone(),
                    EnvVar {
                        name: name.clone(),
                        value: StrValue::new(
                            value.clone(),
                            step.position,
                            step.route.with_key("env").with_key(name.as_str()),
                        ),
                    },
                );
            }
            step.env = Some(Env::Vars(vars));
        }
    }

    let mut env = serde_yaml::Mapping::new();
    for (name, value) in bindings {
        env.insert(name.as_str().into(), value.as_str().into());
    }
    patches.push(Patch {
        route: step.route.clone(),
        operation: Op::MergeInto {
            key: "env".into(),
            value: serde_yaml::Value::Mapping(env),
        },
    });
}

/// Replaces the step's script in both the AST and the document.
fn replace_script(step: &mut Step, new_script: String, patches: &mut Vec<Patch>) {
    if let Exec::Run { script, .. } = &mut step.exec {
        patches.push(Patch {
            route: script.route.clone(),
            operation: Op::Replace(new_script.clone().into()),
        });
        script.set_value(new_script);
    }
}

/// Untrusted event data appended to `$GITHUB_PATH`.
pub(crate) struct PathInjection {
    core: RuleCore,
    privileged: bool,
}

rule_meta!(
    PathInjection,
    "path-injection",
    "untrusted input appended to $GITHUB_PATH"
);

impl PathInjection {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
            privileged: false,
        }
    }
}

impl Rule for PathInjection {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn workflow_pre(&mut self, workflow: &Workflow) -> Result<()> {
        self.privileged = workflow.has_any_event(PRIVILEGED_TRIGGERS);
        Ok(())
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        let Some(script) = step.run_script() else {
            return Ok(());
        };

        let sites = scan_script(script.as_str(), "GITHUB_PATH");
        if sites.is_empty() {
            return Ok(());
        }

        let severity = if self.privileged {
            Severity::High
        } else {
            Severity::Medium
        };

        for site in &sites {
            self.report(
                script.position,
                format!(
                    "{} `{}` flows into $GITHUB_PATH (script line {}); an attacker-chosen directory would shadow every later command",
                    severity.tag(),
                    site.context,
                    site.line + 1,
                ),
            );
        }
        self.register_step_fix(job, step);

        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        let Some(script) = step.run_script() else {
            anyhow::bail!("refusing to fix: step is not a run script");
        };

        let sites = scan_script(script.as_str(), "GITHUB_PATH");
        if sites.is_empty() {
            return Ok(());
        }

        // Bind each untrusted expression to an env var and resolve it
        // through realpath, so symlink tricks can't escape either.
        let mut new_script = script.as_str().to_string();
        let mut bindings = IndexMap::new();
        for site in &sites {
            let var = env_var_name(&site.context);
            new_script = new_script.replace(
                &site.fenced,
                &format!("$(realpath \"${{{var}}}\")"),
            );
            bindings.entry(var).or_insert_with(|| site.fenced.clone());
        }

        replace_script(step, new_script, patches);
        bind_step_env(step, &bindings, patches);

        Ok(())
    }
}

/// Untrusted event data appended to `$GITHUB_ENV`.
pub(crate) struct EnvInjection {
    core: RuleCore,
    privileged: bool,
}

rule_meta!(
    EnvInjection,
    "env-injection",
    "untrusted input appended to $GITHUB_ENV"
);

impl EnvInjection {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
            privileged: false,
        }
    }

    /// Rewrites one `echo "NAME=..." >> $GITHUB_ENV` line into a
    /// delimited heredoc fed from env-bound values. Returns `None`
    /// when the line doesn't have that mechanical shape.
    fn heredoc_rewrite(
        line: &str,
        sites: &[&InjectionSite],
        bindings: &mut IndexMap<String, String>,
    ) -> Option<String> {
        let env_re = regex::Regex::new(
            r#"^(\s*)echo\s+"?([A-Za-z_][A-Za-z0-9_]*)=(.*?)"?\s*>>\s*"?\$GITHUB_ENV"?\s*$"#,
        )
        .unwrap();

        let caps = env_re.captures(line)?;
        let indent = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let name = &caps[2];
        let mut value = caps[3].to_string();

        for site in sites {
            let var = env_var_name(&site.context);
            value = value.replace(&site.fenced, &format!("${{{var}}}"));
            bindings.entry(var).or_insert_with(|| site.fenced.clone());
        }

        let delim = format!("{name}_EOF");
        Some(format!(
            "{indent}echo \"{name}<<{delim}\" >> \"$GITHUB_ENV\"\n{indent}echo \"{value}\" >> \"$GITHUB_ENV\"\n{indent}echo \"{delim}\" >> \"$GITHUB_ENV\""
        ))
    }
}

impl Rule for EnvInjection {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn workflow_pre(&mut self, workflow: &Workflow) -> Result<()> {
        self.privileged = workflow.has_any_event(PRIVILEGED_TRIGGERS);
        Ok(())
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        let Some(script) = step.run_script() else {
            return Ok(());
        };

        let sites = scan_script(script.as_str(), "GITHUB_ENV");
        if sites.is_empty() {
            return Ok(());
        }

        let severity = if self.privileged {
            Severity::High
        } else {
            Severity::Medium
        };

        for site in &sites {
            self.report(
                script.position,
                format!(
                    "{} `{}` flows into $GITHUB_ENV (script line {}); attacker-chosen variables like LD_PRELOAD compromise later steps",
                    severity.tag(),
                    site.context,
                    site.line + 1,
                ),
            );
        }
        self.register_step_fix(job, step);

        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        let Some(script) = step.run_script() else {
            anyhow::bail!("refusing to fix: step is not a run script");
        };

        let sites = scan_script(script.as_str(), "GITHUB_ENV");
        if sites.is_empty() {
            return Ok(());
        }

        let mut bindings = IndexMap::new();
        let mut rewritten_lines = Vec::new();
        for (idx, line) in script.as_str().lines().enumerate() {
            let line_sites: Vec<&InjectionSite> =
                sites.iter().filter(|s| s.line == idx).collect();

            if line_sites.is_empty() {
                rewritten_lines.push(line.to_string());
                continue;
            }

            match Self::heredoc_rewrite(line, &line_sites, &mut bindings) {
                Some(rewritten) => rewritten_lines.push(rewritten),
                None => {
                    // No mechanical rewrite for this shape; leave the
                    // line as-is.
                    tracing::warn!("no mechanical rewrite for env write: {line}");
                    rewritten_lines.push(line.to_string());
                }
            }
        }

        if bindings.is_empty() {
            return Ok(());
        }

        replace_script(step, rewritten_lines.join("\n"), patches);
        bind_step_env(step, &bindings, patches);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use crate::rules::test_support::{assert_no_findings, run_rule};

    use super::{EnvInjection, PathInjection, env_var_name, scan_script};

    #[test]
    fn test_scan_script() {
        let script = r#"echo "${{ github.event.pull_request.head.ref }}/bin" >> "$GITHUB_PATH"
echo "$HOME/.local/bin" >> $GITHUB_PATH
echo done"#;

        let sites = scan_script(script, "GITHUB_PATH");
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].line, 0);
        assert_eq!(sites[0].context, "github.event.pull_request.head.ref");
    }

    #[test]
    fn test_workspace_context_not_flagged() {
        // github.workspace is not event data.
        let script = r#"echo "${{ github.workspace }}/bin" >> "$GITHUB_PATH""#;
        assert!(scan_script(script, "GITHUB_PATH").is_empty());
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(
            env_var_name("github.event.pull_request.head.ref"),
            "GITHUB_EVENT_PULL_REQUEST_HEAD_REF"
        );
        assert_eq!(env_var_name("github.event.issue.title"), "GITHUB_EVENT_ISSUE_TITLE");
    }

    #[test]
    fn test_path_injection_privileged_severity() {
        let (findings, fixed) = run_rule(
            Box::new(PathInjection::new()),
            r#"
on: issue_comment
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: echo "${{ github.event.comment.body }}" >> "$GITHUB_PATH"
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.starts_with("[High]"));

        assert_snapshot!(fixed.unwrap(), @r#"
        on: issue_comment
        jobs:
          test:
            runs-on: ubuntu-latest
            steps:
              - run: echo "$(realpath "${GITHUB_EVENT_COMMENT_BODY}")" >> "$GITHUB_PATH"
                env:
                  GITHUB_EVENT_COMMENT_BODY: ${{ github.event.comment.body }}
        "#);
    }

    #[test]
    fn test_path_injection_unprivileged_is_medium() {
        let (findings, _) = run_rule(
            Box::new(PathInjection::new()),
            r#"
on: push
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: echo "${{ github.event.head_commit.message }}" >> $GITHUB_PATH
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.starts_with("[Medium]"));
    }

    #[test]
    fn test_env_injection_heredoc_rewrite() {
        let (findings, fixed) = run_rule(
            Box::new(EnvInjection::new()),
            r#"
on: issues
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: |
          echo "TITLE=${{ github.event.issue.title }}" >> "$GITHUB_ENV"
          echo done
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.starts_with("[High]"));

        assert_snapshot!(fixed.unwrap(), @r#"
        on: issues
        jobs:
          test:
            runs-on: ubuntu-latest
            steps:
              - run: |
                  echo "TITLE<<TITLE_EOF" >> "$GITHUB_ENV"
                  echo "${GITHUB_EVENT_ISSUE_TITLE}" >> "$GITHUB_ENV"
                  echo "TITLE_EOF" >> "$GITHUB_ENV"
                  echo done
                env:
                  GITHUB_EVENT_ISSUE_TITLE: ${{ github.event.issue.title }}
        "#);
    }

    #[test]
    fn test_static_writes_are_silent() {
        assert_no_findings(
            Box::new(EnvInjection::new()),
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - run: echo "MODE=release" >> "$GITHUB_ENV"
      - run: echo "$HOME/bin" >> "$GITHUB_PATH"
"#,
        );
    }
}
