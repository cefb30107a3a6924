//! Spoofable bot-identity checks in `if:` conditions.
//!
//! `github.actor` names whoever *last touched* the triggering entity,
//! not whoever opened it, so `github.actor == 'dependabot[bot]'` is an
//! attacker-satisfiable gate. The fix swaps in the event payload's
//! originating user.

use std::sync::LazyLock;

use anyhow::Result;
use flowlint_exprs::{BinOp, Expr, ExplicitExpr};
use regex::Regex;

use crate::{
    finding::Severity,
    models::{Job, Step, StrValue, Workflow},
    rules::{RuleCore, rule_meta},
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

/// Name-bearing contexts an attacker can steer onto a bot identity.
const SPOOFABLE_LOGIN_CONTEXTS: &[&str] = &[
    "github.actor",
    "github.triggering_actor",
    "github.event.pull_request.sender.login",
];

/// Id-bearing contexts with the same problem.
const SPOOFABLE_ID_CONTEXTS: &[&str] = &["github.actor_id", "github.event.pull_request.sender.id"];

/// Actor ids of the well-known automation bots people gate on.
const KNOWN_BOT_IDS: &[f64] = &[29110.0, 49699333.0, 27856297.0, 29139614.0];

static BOT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w-]+\[bot\]$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq)]
enum ContextKind {
    Login,
    Id,
}

#[derive(Debug)]
struct SpoofableCheck {
    /// The context exactly as spelled in the source.
    context: String,
    kind: ContextKind,
    /// Whether this check alone decides the condition in the
    /// attacker's favor.
    dominant: bool,
}

/// Safe replacements, keyed by the workflow's primary trigger.
fn trigger_replacements(event: &str) -> Option<(&'static str, &'static str)> {
    match event {
        "pull_request_target" | "pull_request" => Some((
            "github.event.pull_request.user.login",
            "github.event.pull_request.user.id",
        )),
        "issue_comment" | "pull_request_review_comment" => Some((
            "github.event.comment.user.login",
            "github.event.comment.user.id",
        )),
        "pull_request_review" => Some((
            "github.event.review.user.login",
            "github.event.review.user.id",
        )),
        "issues" => Some((
            "github.event.issue.user.login",
            "github.event.issue.user.id",
        )),
        "release" => Some((
            "github.event.release.author.login",
            "github.event.release.author.id",
        )),
        "workflow_run" => Some((
            "github.event.workflow_run.actor.login",
            "github.event.workflow_run.actor.id",
        )),
        _ => None,
    }
}

const FALLBACK_REPLACEMENTS: (&str, &str) =
    ("github.event.sender.login", "github.event.sender.id");

pub(crate) struct BotConditions {
    core: RuleCore,
    replacements: (&'static str, &'static str),
}

rule_meta!(BotConditions, "bot-conditions", "spoofable bot actor check");

impl BotConditions {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
            replacements: FALLBACK_REPLACEMENTS,
        }
    }

    /// Finds spoofable identity checks in a condition.
    fn scan(cond: &str) -> Vec<SpoofableCheck> {
        let bare = match ExplicitExpr::from_curly(cond) {
            Some(expr) => expr.as_bare().to_string(),
            None => cond.to_string(),
        };

        let Ok(expr) = Expr::parse(&bare) else {
            tracing::warn!("couldn't parse condition expression: {cond}");
            return vec![];
        };

        let mut checks = vec![];
        let mut has_and = false;
        Self::walk(&expr, true, &mut has_and, &mut checks);

        // A check dominates when the condition has no `&&` at all, or
        // when the check sits in an `||` chain at the outermost level.
        for check in &mut checks {
            check.dominant = check.dominant || !has_and;
        }

        checks
    }

    /// Walks the expression tree. `or_chain` tracks whether the
    /// current node is still in the outermost `||` chain.
    fn walk(expr: &Expr, or_chain: bool, has_and: &mut bool, out: &mut Vec<SpoofableCheck>) {
        match expr {
            Expr::BinOp {
                lhs,
                op: BinOp::Or,
                rhs,
            } => {
                Self::walk(lhs, or_chain, has_and, out);
                Self::walk(rhs, or_chain, has_and, out);
            }
            Expr::BinOp {
                lhs,
                op: BinOp::And,
                rhs,
            } => {
                *has_and = true;
                Self::walk(lhs, false, has_and, out);
                Self::walk(rhs, false, has_and, out);
            }
            Expr::BinOp {
                lhs,
                op: BinOp::Eq,
                rhs,
            } => {
                if let Some(check) = Self::spoofable_eq(lhs, rhs, or_chain) {
                    out.push(check);
                } else {
                    Self::walk(lhs, false, has_and, out);
                    Self::walk(rhs, false, has_and, out);
                }
            }
            Expr::BinOp { lhs, rhs, .. } => {
                Self::walk(lhs, false, has_and, out);
                Self::walk(rhs, false, has_and, out);
            }
            Expr::UnOp { expr, .. } => Self::walk(expr, false, has_and, out),
            Expr::Call { args, .. } => {
                for arg in args {
                    Self::walk(arg, false, has_and, out);
                }
            }
            Expr::Context(ctx) => {
                for part in &ctx.parts {
                    Self::walk(part, false, has_and, out);
                }
            }
            Expr::Index(inner) => Self::walk(inner, false, has_and, out),
            _ => {}
        }
    }

    /// Classifies an equality as a spoofable identity check.
    fn spoofable_eq(lhs: &Expr, rhs: &Expr, dominant: bool) -> Option<SpoofableCheck> {
        let (ctx, literal) = match (lhs, rhs) {
            (Expr::Context(ctx), lit) | (lit, Expr::Context(ctx)) => (ctx, lit),
            _ => return None,
        };

        match literal {
            Expr::String(s) if BOT_NAME.is_match(s) => SPOOFABLE_LOGIN_CONTEXTS
                .iter()
                .any(|c| ctx.matches(c))
                .then(|| SpoofableCheck {
                    context: ctx.as_str().to_string(),
                    kind: ContextKind::Login,
                    dominant,
                }),
            Expr::Number(n) if KNOWN_BOT_IDS.contains(n) => SPOOFABLE_ID_CONTEXTS
                .iter()
                .any(|c| ctx.matches(c))
                .then(|| SpoofableCheck {
                    context: ctx.as_str().to_string(),
                    kind: ContextKind::Id,
                    dominant,
                }),
            _ => None,
        }
    }

    fn check_condition(&mut self, cond: &StrValue) -> bool {
        let checks = Self::scan(cond.as_str());
        if checks.is_empty() {
            return false;
        }

        let dominant = checks.iter().any(|c| c.dominant);
        let (severity, confidence) = if dominant {
            (Severity::High, "High")
        } else {
            (Severity::Medium, "Medium")
        };

        let context = &checks[0].context;
        self.report(
            cond.position,
            format!(
                "{} condition gates on the spoofable context `{context}` ({confidence} confidence)",
                severity.tag(),
            ),
        );

        true
    }

    /// Rewrites every spoofable context in the condition to the
    /// trigger-appropriate safe replacement.
    fn fix_condition(&self, cond: &mut StrValue, patches: &mut Vec<Patch>) {
        let (login_repl, id_repl) = self.replacements;

        for check in Self::scan(cond.as_str()) {
            let replacement = match check.kind {
                ContextKind::Login => login_repl,
                ContextKind::Id => id_repl,
            };

            if !cond.as_str().contains(&check.context) {
                continue;
            }

            let rewritten = cond.as_str().replace(&check.context, replacement);
            cond.set_value(rewritten);

            patches.push(Patch {
                route: cond.route.clone(),
                operation: Op::RewriteFragment {
                    from: check.context.clone(),
                    to: replacement.to_string(),
                    after: None,
                },
            });
        }
    }
}

impl Rule for BotConditions {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn workflow_pre(&mut self, workflow: &Workflow) -> Result<()> {
        self.replacements = workflow
            .events
            .iter()
            .find_map(|e| trigger_replacements(e.name()))
            .unwrap_or(FALLBACK_REPLACEMENTS);
        Ok(())
    }

    fn job_pre(&mut self, job: &Job, _workflow: &Workflow) -> Result<()> {
        if let Some(cond) = job.cond.clone() {
            if self.check_condition(&cond) {
                self.register_job_fix(job);
            }
        }
        Ok(())
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        if let Some(cond) = step.cond.clone() {
            if self.check_condition(&cond) {
                self.register_step_fix(job, step);
            }
        }
        Ok(())
    }

    fn fix_job(&mut self, job: &mut Job, patches: &mut Vec<Patch>) -> Result<()> {
        if let Some(cond) = job.cond.as_mut() {
            self.fix_condition(cond, patches);
        }
        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        if let Some(cond) = step.cond.as_mut() {
            self.fix_condition(cond, patches);
        }
        Ok(())
    }
}
