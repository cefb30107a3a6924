//! Values derived from secrets via `fromJSON(...)` accesses: the
//! runner masks the secret itself, but not fields projected out of it.

use anyhow::Result;
use flowlint_exprs::{Context, Expr};
use indexmap::IndexMap;

use crate::{
    finding::Severity,
    models::{Env, Exec, Job, Step, StrValue, Workflow},
    rules::{RuleCore, rule_meta},
    utils::{bare_expression, extract_expressions},
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

/// One derived-secret access.
#[derive(Debug, Clone)]
struct DerivedSecret {
    /// The whole `${{ ... }}` fragment carrying the access.
    fenced: String,
    /// The secret's name under the `secrets` context, if recoverable.
    secret: Option<String>,
    /// The projected property, if recoverable.
    property: Option<String>,
}

impl DerivedSecret {
    /// The env var the fix binds the derived value to:
    /// `<SECRET>_<PROPERTY>`, falling back to `<SECRET>_DERIVED`.
    fn env_var_name(&self) -> String {
        let secret = self.secret.as_deref().unwrap_or("SECRET");
        let sanitized = |s: &str| {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        };

        match &self.property {
            Some(property) => format!("{}_{}", sanitized(secret), sanitized(property)),
            None => format!("{}_DERIVED", sanitized(secret)),
        }
    }
}

/// Whether the expression transitively reads the `secrets` context.
fn touches_secrets(expr: &Expr) -> bool {
    match expr {
        Expr::Context(ctx) => {
            matches!(ctx.parts.first(), Some(Expr::Identifier(ident)) if ident == "secrets")
                || ctx.parts.iter().any(touches_secrets)
        }
        Expr::Call { args, .. } => args.iter().any(touches_secrets),
        Expr::Index(inner) => touches_secrets(inner),
        Expr::BinOp { lhs, rhs, .. } => touches_secrets(lhs) || touches_secrets(rhs),
        Expr::UnOp { expr, .. } => touches_secrets(expr),
        _ => false,
    }
}

/// The name component of a `secrets.<NAME>` context in the call's
/// argument tree.
fn secret_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Context(ctx) => {
            if matches!(ctx.parts.first(), Some(Expr::Identifier(ident)) if ident == "secrets") {
                match ctx.parts.get(1) {
                    Some(Expr::Identifier(ident)) => return Some(ident.as_str().to_string()),
                    Some(Expr::Index(idx)) => {
                        if let Expr::String(s) = idx.as_ref() {
                            return Some(s.clone());
                        }
                    }
                    _ => {}
                }
            }
            ctx.parts.iter().find_map(secret_name)
        }
        Expr::Call { args, .. } => args.iter().find_map(secret_name),
        Expr::Index(inner) => secret_name(inner),
        Expr::BinOp { lhs, rhs, .. } => secret_name(lhs).or_else(|| secret_name(rhs)),
        Expr::UnOp { expr, .. } => secret_name(expr),
        _ => None,
    }
}

/// A context whose receiver is a secrets-fed `fromJson` call and which
/// goes on to project a member or index out of it.
fn derived_secret_access(ctx: &Context) -> Option<(Option<String>, Option<String>)> {
    let head = ctx.parts.first()?;

    let Expr::Call { func, args } = head else {
        return None;
    };
    if func != "fromJson" || !args.iter().any(touches_secrets) {
        return None;
    }

    // The deref/index after the call is the unmasked projection.
    let property = match ctx.parts.get(1)? {
        Expr::Identifier(ident) => Some(ident.as_str().to_string()),
        Expr::Index(idx) => match idx.as_ref() {
            Expr::String(s) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    };

    Some((args.iter().find_map(secret_name), property))
}

/// Walks an expression tree for derived-secret accesses, descending
/// through logical, comparison, not, and call nodes.
fn find_derived_secrets(expr: &Expr, fenced: &str, out: &mut Vec<DerivedSecret>) {
    match expr {
        Expr::Context(ctx) => {
            if let Some((secret, property)) = derived_secret_access(ctx) {
                out.push(DerivedSecret {
                    fenced: fenced.to_string(),
                    secret,
                    property,
                });
            } else {
                for part in &ctx.parts {
                    find_derived_secrets(part, fenced, out);
                }
            }
        }
        Expr::Call { args, .. } => {
            for arg in args {
                find_derived_secrets(arg, fenced, out);
            }
        }
        Expr::Index(inner) => find_derived_secrets(inner, fenced, out),
        Expr::BinOp { lhs, rhs, .. } => {
            find_derived_secrets(lhs, fenced, out);
            find_derived_secrets(rhs, fenced, out);
        }
        Expr::UnOp { expr, .. } => find_derived_secrets(expr, fenced, out),
        _ => {}
    }
}

/// Scans a carrier value for derived-secret accesses.
fn scan_value(value: &str) -> Vec<DerivedSecret> {
    let mut found = vec![];

    for (fenced, _) in extract_expressions(value) {
        let Ok(expr) = Expr::parse(bare_expression(fenced)) else {
            tracing::warn!("couldn't parse expression: {fenced}");
            continue;
        };

        find_derived_secrets(&expr, fenced, &mut found);
    }

    found
}

pub(crate) struct UnmaskedSecrets {
    core: RuleCore,
}

rule_meta!(
    UnmaskedSecrets,
    "unmasked-secrets",
    "secret-derived value is not masked in logs"
);

impl UnmaskedSecrets {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
        }
    }

    fn scan_env(&mut self, env: Option<&Env>) {
        let Some(Env::Vars(vars)) = env else {
            return;
        };

        for var in vars.values() {
            self.report_derived(&var.value);
        }
    }

    fn report_derived(&mut self, value: &StrValue) {
        for derived in scan_value(value.as_str()) {
            let what = derived
                .secret
                .as_deref()
                .map(|s| format!("secrets.{s}"))
                .unwrap_or_else(|| "a secret".to_string());

            self.report(
                value.position,
                format!(
                    "{} value derived from {what} via fromJSON is not masked in logs",
                    Severity::Medium.tag(),
                ),
            );
        }
    }
}

impl Rule for UnmaskedSecrets {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn workflow_pre(&mut self, workflow: &Workflow) -> Result<()> {
        self.scan_env(workflow.env.as_ref());
        Ok(())
    }

    fn job_pre(&mut self, job: &Job, _workflow: &Workflow) -> Result<()> {
        self.scan_env(job.env.as_ref());
        Ok(())
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        self.scan_env(step.env.as_ref());

        match &step.exec {
            Exec::Action { inputs, .. } => {
                for input in inputs.values() {
                    self.report_derived(&input.value);
                }
            }
            Exec::Run { script, .. } => {
                let derived = scan_value(script.as_str());
                if !derived.is_empty() {
                    self.report_derived(script);
                    // Only run scripts have a mechanical fix: mask the
                    // derived value before the script uses it.
                    self.register_step_fix(job, step);
                }
            }
        }

        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        let Some(script) = step.run_script() else {
            anyhow::bail!("refusing to fix: step is not a run script");
        };

        let derived = scan_value(script.as_str());
        if derived.is_empty() {
            return Ok(());
        }

        let mut bindings: IndexMap<String, String> = IndexMap::new();
        let mut mask_lines = vec![];
        for item in &derived {
            let var = item.env_var_name();
            let mask = format!("echo \"::add-mask::${var}\"");
            // An identical add-mask line already present means this
            // fix (or the author) got there first.
            if script.as_str().contains(&mask) {
                continue;
            }
            if !mask_lines.contains(&mask) {
                mask_lines.push(mask);
            }
            bindings.entry(var).or_insert_with(|| item.fenced.clone());
        }

        if mask_lines.is_empty() {
            return Ok(());
        }

        // Masks go first, but never above a shebang.
        let old = script.as_str().to_string();
        let new_script = if old.starts_with("#!") {
            match old.split_once('\n') {
                Some((shebang, rest)) => {
                    format!("{shebang}\n{}\n{rest}", mask_lines.join("\n"))
                }
                None => format!("{old}\n{}", mask_lines.join("\n")),
            }
        } else {
            format!("{}\n{old}", mask_lines.join("\n"))
        };

        if let Exec::Run { script, .. } = &mut step.exec {
            patches.push(Patch {
                route: script.route.clone(),
                operation: Op::Replace(new_script.clone().into()),
            });
            script.set_value(new_script);
        }

        // Bind the derived values so the masks have something to echo.
        let mut env = serde_yaml::Mapping::new();
        for (name, value) in &bindings {
            env.insert(name.as_str().into(), value.as_str().into());
        }

        match &mut step.env {
            Some(Env::Expr(_)) => {
                tracing::warn!("step env is an expression; leaving mask bindings unmerged");
            }
            Some(Env::Vars(vars)) => {
                for (name, value) in &bindings {
                    if !vars.contains_key(name) {
                        vars.insert(
                            name.clone(),
                            crate::models::EnvVar {
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
                patches.push(Patch {
                    route: step.route.clone(),
                    operation: Op::MergeInto {
                        key: "env".into(),
                        value: serde_yaml::Value::Mapping(env),
                    },
                });
            }
            None => {
                let mut vars = IndexMap::new();
                for (name, value) in &bindings {
                    vars.insert(
                        name.clone(),
                        crate::models::EnvVar {
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
                patches.push(Patch {
                    route: step.route.clone(),
                    operation: Op::MergeInto {
                        key: "env".into(),
                        value: serde_yaml::Value::Mapping(env),
                    },
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use crate::rules::test_support::{assert_no_findings, run_rule};

    use super::{UnmaskedSecrets, scan_value};

    #[test]
    fn test_scan_value() {
        let found = scan_value("token: ${{ fromJson(secrets.DEPLOY_CREDS).token }}");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].secret.as_deref(), Some("DEPLOY_CREDS"));
        assert_eq!(found[0].property.as_deref(), Some("token"));
        assert_eq!(found[0].env_var_name(), "DEPLOY_CREDS_TOKEN");

        // Index projection counts too.
        let found = scan_value("${{ fromJSON(secrets.CREDS)['api-key'] }}");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].property.as_deref(), Some("api-key"));

        // Function casing is irrelevant.
        assert_eq!(
            scan_value("${{ fromjson(secrets.CREDS).a }}").len(),
            1
        );

        // Nested inside logical expressions.
        assert_eq!(
            scan_value("${{ github.ref == 'x' && fromJson(secrets.C).k }}").len(),
            1
        );

        // A bare fromJSON over a secret without projection is the
        // whole (masked) secret.
        assert!(scan_value("${{ fromJson(secrets.CREDS) }}").is_empty());

        // fromJSON over non-secret data doesn't count.
        assert!(scan_value("${{ fromJson(steps.out.outputs.data).id }}").is_empty());

        // The plain secret is masked by the runner already.
        assert!(scan_value("${{ secrets.CREDS }}").is_empty());
    }

    #[test]
    fn test_run_script_fix_adds_mask() {
        let (findings, fixed) = run_rule(
            Box::new(UnmaskedSecrets::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    steps:
      - run: |
          curl -H "Authorization: ${{ fromJson(secrets.DEPLOY_CREDS).token }}" https://example.com
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("secrets.DEPLOY_CREDS"));

        assert_snapshot!(fixed.unwrap(), @r#"
        on: push
        jobs:
          deploy:
            runs-on: ubuntu-latest
            steps:
              - run: |
                  echo "::add-mask::$DEPLOY_CREDS_TOKEN"
                  curl -H "Authorization: ${{ fromJson(secrets.DEPLOY_CREDS).token }}" https://example.com
                env:
                  DEPLOY_CREDS_TOKEN: ${{ fromJson(secrets.DEPLOY_CREDS).token }}
        "#);
    }

    #[test]
    fn test_mask_respects_shebang() {
        let (_, fixed) = run_rule(
            Box::new(UnmaskedSecrets::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    steps:
      - run: |
          #!/bin/bash
          use_token "${{ fromJson(secrets.CREDS).token }}"
"#,
        );

        let fixed = fixed.unwrap();
        let script_start = fixed.find("#!/bin/bash").unwrap();
        let mask_pos = fixed.find("::add-mask::").unwrap();
        assert!(mask_pos > script_start);
    }

    #[test]
    fn test_existing_mask_not_duplicated() {
        let (findings, fixed) = run_rule(
            Box::new(UnmaskedSecrets::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    steps:
      - run: |
          echo "::add-mask::$CREDS_TOKEN"
          use_token "${{ fromJson(secrets.CREDS).token }}"
"#,
        );

        // Still reported, but the fix declines to stack masks.
        assert_eq!(findings.len(), 1);
        assert!(fixed.is_none());
    }

    #[test]
    fn test_with_input_reported_without_fix() {
        let (findings, fixed) = run_rule(
            Box::new(UnmaskedSecrets::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    steps:
      - uses: octo-org/deploy@v2
        with:
          token: ${{ fromJson(secrets.DEPLOY_CREDS).token }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(fixed.is_none());
    }

    #[test]
    fn test_env_value_reported() {
        let (findings, _) = run_rule(
            Box::new(UnmaskedSecrets::new()),
            r#"
on: push
env:
  API_KEY: ${{ fromJSON(secrets.BUNDLE).key }}
jobs: {}
"#,
        );

        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_ordinary_secrets_are_silent() {
        assert_no_findings(
            Box::new(UnmaskedSecrets::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    env:
      TOKEN: ${{ secrets.TOKEN }}
    steps:
      - run: echo ok
"#,
        );
    }
}
