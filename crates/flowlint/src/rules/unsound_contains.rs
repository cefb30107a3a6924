//! Unsound `contains()` conditions: `contains('a b', ctx)` is a
//! substring check, so an attacker controlling `ctx` passes it with
//! any fragment of the literal.

use anyhow::Result;
use flowlint_exprs::{Context, Expr, ExplicitExpr};

use crate::{
    models::{Job, Step, StrValue, Workflow},
    rules::{RuleCore, rule_meta},
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

/// Contexts an attacker can influence directly.
const USER_CONTROLLABLE_CONTEXTS: &[&str] = &[
    "github.actor",
    "github.base_ref",
    "github.head_ref",
    "github.ref",
    "github.ref_name",
    "github.sha",
    "github.triggering_actor",
    "github.event.sender.type",
];

/// Context prefixes that carry user-controllable data.
const USER_CONTROLLABLE_PREFIXES: &[&str] = &["env", "inputs", "github.event"];

/// A `contains(<string literal>, <context>)` call found in a condition.
#[derive(Debug, Clone)]
struct UnsoundCall {
    literal: String,
    context: String,
    user_controllable: bool,
}

fn context_is_user_controllable(ctx: &Context) -> bool {
    USER_CONTROLLABLE_CONTEXTS.iter().any(|c| ctx.matches(c))
        || USER_CONTROLLABLE_PREFIXES.iter().any(|p| ctx.child_of(p))
}

fn walk(expr: &Expr, out: &mut Vec<UnsoundCall>) {
    match expr {
        Expr::Call { func, args } if func == "contains" => {
            if let [Expr::String(literal), Expr::Context(ctx)] = args.as_slice() {
                out.push(UnsoundCall {
                    literal: literal.clone(),
                    context: ctx.as_str().to_string(),
                    user_controllable: context_is_user_controllable(ctx),
                });
            } else {
                for arg in args {
                    walk(arg, out);
                }
            }
        }
        Expr::Call { args, .. } => {
            for arg in args {
                walk(arg, out);
            }
        }
        Expr::Context(ctx) => {
            for part in &ctx.parts {
                walk(part, out);
            }
        }
        Expr::Index(inner) => walk(inner, out),
        Expr::BinOp { lhs, rhs, .. } => {
            walk(lhs, out);
            walk(rhs, out);
        }
        Expr::UnOp { expr, .. } => walk(expr, out),
        _ => {}
    }
}

fn unsound_calls(cond: &str) -> Vec<UnsoundCall> {
    let bare = match ExplicitExpr::from_curly(cond) {
        Some(expr) => expr.as_bare().to_string(),
        None => cond.to_string(),
    };

    let Ok(expr) = Expr::parse(&bare) else {
        tracing::warn!("couldn't parse condition expression: {cond}");
        return vec![];
    };

    let mut calls = vec![];
    walk(&expr, &mut calls);
    calls
}

/// The `contains(fromJSON('[...]'), ctx)` replacement for a flagged
/// call: the literal splits on whitespace/commas into exact-match
/// array elements.
fn exact_match_rewrite(call: &UnsoundCall) -> String {
    let items = call
        .literal
        .split([' ', '\t', '\n', ','])
        .filter(|item| !item.is_empty())
        .map(|item| format!("\"{item}\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "contains(fromJSON('[{items}]'), {context})",
        context = call.context
    )
}

pub(crate) struct UnsoundContains {
    core: RuleCore,
}

rule_meta!(
    UnsoundContains,
    "unsound-contains",
    "contains() condition with substring semantics"
);

impl UnsoundContains {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
        }
    }

    fn check_condition(&mut self, cond: &StrValue) -> bool {
        let calls = unsound_calls(cond.as_str());

        for call in &calls {
            let severity = if call.user_controllable {
                "[HIGH]"
            } else {
                "[INFORMATIONAL]"
            };

            self.report(
                cond.position,
                format!(
                    "{severity} contains() condition can be bypassed with a substring if `{}` is attacker-influenced",
                    call.context
                ),
            );
        }

        !calls.is_empty()
    }

    fn fix_condition(cond: &mut StrValue, patches: &mut Vec<Patch>) {
        for call in unsound_calls(cond.as_str()) {
            // Re-locate the call's exact source spelling so the
            // rewrite tolerates authoring whitespace.
            let pattern = regex::Regex::new(&format!(
                r"contains\(\s*'{literal}'\s*,\s*{context}\s*\)",
                literal = regex::escape(&call.literal),
                context = regex::escape(&call.context),
            ))
            .expect("escaped pattern is always valid");

            let Some(found) = pattern.find(cond.as_str()) else {
                continue;
            };
            let old = found.as_str().to_string();
            let new = exact_match_rewrite(&call);

            cond.set_value(cond.as_str().replacen(&old, &new, 1));
            patches.push(Patch {
                route: cond.route.clone(),
                operation: Op::RewriteFragment {
                    from: old,
                    to: new,
                    after: None,
                },
            });
        }
    }
}

impl Rule for UnsoundContains {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn job_pre(&mut self, job: &Job, _workflow: &Workflow) -> Result<()> {
        if let Some(cond) = &job.cond {
            if self.check_condition(&cond.clone()) {
                self.register_job_fix(job);
            }
        }
        Ok(())
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        if let Some(cond) = &step.cond {
            if self.check_condition(&cond.clone()) {
                self.register_step_fix(job, step);
            }
        }
        Ok(())
    }

    fn fix_job(&mut self, job: &mut Job, patches: &mut Vec<Patch>) -> Result<()> {
        if let Some(cond) = job.cond.as_mut() {
            Self::fix_condition(cond, patches);
        }
        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        if let Some(cond) = step.cond.as_mut() {
            Self::fix_condition(cond, patches);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rules::test_support::{assert_no_findings, run_rule};

    use super::{UnsoundContains, unsound_calls};

    #[test]
    fn test_unsound_calls() {
        let calls = unsound_calls("contains('refs/heads/main refs/heads/develop', github.ref)");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].user_controllable);

        // Safe argument order (haystack is the context) isn't flagged.
        assert!(unsound_calls("contains(github.ref, 'main')").is_empty());

        // Array haystacks are sound.
        assert!(
            unsound_calls("contains(fromJSON('[\"a\"]'), github.ref)").is_empty()
        );

        // Prefix-based user control.
        assert!(unsound_calls("contains('a b', inputs.name)")[0].user_controllable);
        assert!(unsound_calls("contains('a b', env.BRANCH)")[0].user_controllable);
        assert!(
            unsound_calls("contains('a b', github.event.comment.body)")[0].user_controllable
        );

        // Non-user-controllable context still registers, informationally.
        let calls = unsound_calls("contains('push schedule', github.event_name)");
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].user_controllable);
    }

    #[test]
    fn test_job_condition_rewrite() {
        let (findings, fixed) = run_rule(
            Box::new(UnsoundContains::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    if: contains('refs/heads/main refs/heads/develop', github.ref)
    steps:
      - run: ./deploy.sh
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.starts_with("[HIGH]"));

        assert!(fixed.unwrap().contains(
            r#"if: contains(fromJSON('["refs/heads/main", "refs/heads/develop"]'), github.ref)"#
        ));
    }

    #[test]
    fn test_informational_severity() {
        let (findings, _) = run_rule(
            Box::new(UnsoundContains::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    steps:
      - if: contains('push schedule', github.event_name)
        run: ./deploy.sh
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.starts_with("[INFORMATIONAL]"));
    }

    #[test]
    fn test_comma_separated_literal() {
        let (_, fixed) = run_rule(
            Box::new(UnsoundContains::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    if: contains('alpha,beta', inputs.channel)
    steps:
      - run: ./deploy.sh
"#,
        );

        assert!(
            fixed
                .unwrap()
                .contains(r#"contains(fromJSON('["alpha", "beta"]'), inputs.channel)"#)
        );
    }

    #[test]
    fn test_sound_conditions_are_silent() {
        assert_no_findings(
            Box::new(UnsoundContains::new()),
            r#"
on: push
jobs:
  deploy:
    runs-on: ubuntu-latest
    if: github.ref == 'refs/heads/main'
    steps:
      - run: ./deploy.sh
"#,
        );
    }
}
