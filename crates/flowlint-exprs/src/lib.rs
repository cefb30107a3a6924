//! Parsing and analysis for the GitHub Actions expression language,
//! i.e. the language that appears inside `${{ ... }}` fences.
//!
//! The parser produces an [`Expr`] tree suitable for pattern matching;
//! no evaluation is performed.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use itertools::Itertools as _;
use pest::{Parser as _, iterators::Pair};
use thiserror::Error;

use self::parser::{ExprParser, Rule};

pub mod context;

pub use context::Context;

// Isolates the generated parser types so `missing_docs` can apply to
// the rest of the crate.
mod parser {
    use pest_derive::Parser;

    /// A parser for GitHub Actions' expression language.
    #[derive(Parser)]
    #[grammar = "expr.pest"]
    pub struct ExprParser;
}

/// The error produced when an expression fails to parse.
#[derive(Error, Debug)]
#[error("invalid expression: {0}")]
pub struct ExprError(String);

/// A function name in an expression. Comparisons are case-insensitive.
#[derive(Debug)]
pub struct Function<'src>(pub &'src str);

impl PartialEq for Function<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(other.0)
    }
}

impl PartialEq<str> for Function<'_> {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

/// A single context component, e.g. `github` in `github.actor`.
/// Comparisons are case-insensitive.
#[derive(Debug)]
pub struct Identifier<'src>(pub &'src str);

impl Identifier<'_> {
    /// The identifier's raw text.
    pub fn as_str(&self) -> &str {
        self.0
    }
}

impl PartialEq for Identifier<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(other.0)
    }
}

impl PartialEq<str> for Identifier<'_> {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

/// Binary operators.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BinOp {
    /// `&&`
    And,
    /// `||`
    Or,
    /// `==`
    Eq,
    /// `!=`
    Neq,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

/// Unary operators.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum UnOp {
    /// `!`
    Not,
}

/// A parsed GitHub Actions expression.
#[derive(Debug, PartialEq)]
pub enum Expr<'src> {
    /// A number literal.
    Number(f64),
    /// A string literal, with `''` escapes resolved.
    String(String),
    /// A boolean literal.
    Boolean(bool),
    /// The `null` literal.
    Null,
    /// The `*` wildcard within a context or index.
    Star,
    /// A function call.
    Call {
        /// The called function.
        func: Function<'src>,
        /// The call's arguments.
        args: Vec<Expr<'src>>,
    },
    /// A bare context component.
    Identifier(Identifier<'src>),
    /// An index component, e.g. `[0]` in `foo[0]`.
    Index(Box<Expr<'src>>),
    /// A full context reference, e.g. `github.event.number`.
    Context(Context<'src>),
    /// A binary operation.
    BinOp {
        /// Left operand.
        lhs: Box<Expr<'src>>,
        /// Operator.
        op: BinOp,
        /// Right operand.
        rhs: Box<Expr<'src>>,
    },
    /// A unary operation.
    UnOp {
        /// Operator.
        op: UnOp,
        /// Operand.
        expr: Box<Expr<'src>>,
    },
}

impl<'src> Expr<'src> {
    fn string(s: impl Into<String>) -> Box<Self> {
        Self::String(s.into()).into()
    }

    fn ident(i: &'src str) -> Self {
        Self::Identifier(Identifier(i))
    }

    /// Parses the given source into an expression tree.
    pub fn parse(src: &str) -> Result<Expr<'_>, ExprError> {
        // The top-level `expression` is a single `or_expr`.
        let or_expr = ExprParser::parse(Rule::expression, src)
            .map_err(|e| ExprError(e.to_string()))?
            .next()
            .unwrap()
            .into_inner()
            .next()
            .unwrap();

        Ok(*parse_pair(or_expr))
    }
}

/// Folds a pest pair into an [`Expr`].
///
/// The grammar isn't left-recursive, so the operator rules produce
/// one-or-many-headed matches; single heads punch through to their
/// operand and many heads fold left into binary nodes.
fn parse_pair(pair: Pair<'_, Rule>) -> Box<Expr<'_>> {
    match pair.as_rule() {
        Rule::or_expr => {
            let mut pairs = pair.into_inner();
            let lhs = parse_pair(pairs.next().unwrap());
            pairs.fold(lhs, |lhs, rhs| {
                Expr::BinOp {
                    lhs,
                    op: BinOp::Or,
                    rhs: parse_pair(rhs),
                }
                .into()
            })
        }
        Rule::and_expr => {
            let mut pairs = pair.into_inner();
            let lhs = parse_pair(pairs.next().unwrap());
            pairs.fold(lhs, |lhs, rhs| {
                Expr::BinOp {
                    lhs,
                    op: BinOp::And,
                    rhs: parse_pair(rhs),
                }
                .into()
            })
        }
        Rule::eq_expr | Rule::comp_expr => {
            // These capture their operators, so fold over
            // (operator, operand) two-chunks.
            let mut pairs = pair.into_inner();
            let lhs = parse_pair(pairs.next().unwrap());

            let chunks = pairs.chunks(2);
            chunks.into_iter().fold(lhs, |lhs, mut chunk| {
                let op = match chunk.next().unwrap().as_str() {
                    "==" => BinOp::Eq,
                    "!=" => BinOp::Neq,
                    ">" => BinOp::Gt,
                    ">=" => BinOp::Ge,
                    "<" => BinOp::Lt,
                    "<=" => BinOp::Le,
                    _ => unreachable!(),
                };

                Expr::BinOp {
                    lhs,
                    op,
                    rhs: parse_pair(chunk.next().unwrap()),
                }
                .into()
            })
        }
        Rule::unary_expr => {
            let mut pairs = pair.into_inner();
            let pair = pairs.next().unwrap();

            match pair.as_rule() {
                Rule::unary_op => Expr::UnOp {
                    op: UnOp::Not,
                    expr: parse_pair(pairs.next().unwrap()),
                }
                .into(),
                Rule::primary_expr => parse_pair(pair),
                _ => unreachable!(),
            }
        }
        Rule::primary_expr => parse_pair(pair.into_inner().next().unwrap()),
        Rule::number => Expr::Number(pair.as_str().parse().unwrap()).into(),
        Rule::string => Expr::string(
            // string -> string_inner
            pair.into_inner().next().unwrap().as_str().replace("''", "'"),
        ),
        Rule::boolean => Expr::Boolean(pair.as_str().parse().unwrap()).into(),
        Rule::null => Expr::Null.into(),
        Rule::star => Expr::Star.into(),
        Rule::function_call => {
            let mut pairs = pair.into_inner();
            let func = Function(pairs.next().unwrap().as_str());
            let args = pairs.map(|p| *parse_pair(p)).collect();

            Expr::Call { func, args }.into()
        }
        Rule::identifier => Expr::ident(pair.as_str()).into(),
        Rule::index => Expr::Index(parse_pair(pair.into_inner().next().unwrap())).into(),
        Rule::context => {
            let raw = pair.as_str();
            let mut parts: Vec<Expr> = pair.into_inner().map(|p| *parse_pair(p)).collect();

            // The `context` rule wholly encloses `function_call`, so a
            // single-call context is really just the call.
            if parts.len() == 1 && matches!(parts[0], Expr::Call { .. }) {
                parts.remove(0).into()
            } else {
                Expr::Context(Context::new(raw, parts)).into()
            }
        }
        r => unreachable!("unrecognized rule: {r:?}"),
    }
}

/// A `${{ ... }}`-fenced expression.
///
/// `from_curly` accepts only strings that are, in their entirety, a
/// single fenced expression; use this to distinguish "this value *is*
/// an expression" from "this value merely contains one".
#[derive(Debug, PartialEq)]
pub struct ExplicitExpr(String);

impl ExplicitExpr {
    /// Parses a whole-string `${{ ... }}` fence, returning `None` for
    /// anything else (including strings with surrounding text or more
    /// than one fence).
    pub fn from_curly(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();

        let inner = trimmed.strip_prefix("${{")?.strip_suffix("}}")?;
        if inner.contains("${{") || inner.contains("}}") {
            return None;
        }

        Some(ExplicitExpr(value))
    }

    /// The raw fenced text, as given.
    pub fn as_curly(&self) -> &str {
        self.0.trim()
    }

    /// The expression body, with fencing and padding removed.
    pub fn as_bare(&self) -> &str {
        self.as_curly()
            .strip_prefix("${{")
            .and_then(|s| s.strip_suffix("}}"))
            .map(str::trim)
            .unwrap_or_else(|| self.as_curly())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{BinOp, Expr, ExplicitExpr, Function, UnOp};

    #[test]
    fn test_function_eq() {
        let func = Function("fromJSON");
        assert_eq!(&func, "fromjson");
        assert_eq!(&func, "FROMJSON");
        assert_eq!(func, Function("FromJson"));
    }

    #[test]
    fn test_parse_strings() {
        for (case, expected) in [
            ("''", ""),
            ("' '", " "),
            ("''''", "'"),
            ("'test'", "test"),
            ("'escaping '' works'", "escaping ' works"),
        ] {
            assert_eq!(Expr::parse(case).unwrap(), Expr::String(expected.into()));
        }
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(Expr::parse("true").unwrap(), Expr::Boolean(true));
        assert_eq!(Expr::parse("false").unwrap(), Expr::Boolean(false));
        assert_eq!(Expr::parse("null").unwrap(), Expr::Null);
        assert_eq!(Expr::parse("1.5").unwrap(), Expr::Number(1.5));
        assert_eq!(Expr::parse("-2").unwrap(), Expr::Number(-2.0));
    }

    #[test]
    fn test_parse_contexts() {
        for case in [
            "github.actor",
            "inputs.foo-bar",
            "secrets.GH_TOKEN",
            "github.event.issue.labels.*.name",
            "github['event']['inputs']['dry-run']",
            "matrix.os",
        ] {
            let expr = Expr::parse(case).unwrap();
            assert!(
                matches!(expr, Expr::Context(_)),
                "expected context for {case}, got {expr:?}"
            );
        }
    }

    #[test]
    fn test_parse_calls() {
        let expr = Expr::parse("contains('a b', github.ref)").unwrap();
        let Expr::Call { func, args } = expr else {
            panic!("expected call");
        };
        assert_eq!(&func, "contains");
        assert_eq!(args.len(), 2);
        assert_eq!(args[0], Expr::String("a b".into()));
        assert!(matches!(&args[1], Expr::Context(ctx) if ctx.as_str() == "github.ref"));
    }

    #[test]
    fn test_parse_call_context() {
        // A call followed by derefs is a context headed by the call.
        let expr = Expr::parse("fromJson(steps.runs.outputs.data).workflow_runs[0].id").unwrap();
        let Expr::Context(ctx) = expr else {
            panic!("expected context");
        };
        assert!(matches!(ctx.parts[0], Expr::Call { .. }));
        assert_eq!(ctx.parts.len(), 4);
    }

    #[test]
    fn test_parse_operators() {
        let expr = Expr::parse("!true || false || true").unwrap();
        assert_eq!(
            expr,
            Expr::BinOp {
                lhs: Expr::BinOp {
                    lhs: Expr::UnOp {
                        op: UnOp::Not,
                        expr: Expr::Boolean(true).into(),
                    }
                    .into(),
                    op: BinOp::Or,
                    rhs: Expr::Boolean(false).into(),
                }
                .into(),
                op: BinOp::Or,
                rhs: Expr::Boolean(true).into(),
            }
        );
    }

    #[test]
    fn test_parse_precedence() {
        // `a == b && c || d` groups as `((a == b) && c) || d`.
        let expr = Expr::parse("'a' == 'b' && 'c' || 'd'").unwrap();
        let Expr::BinOp { op: BinOp::Or, lhs, .. } = expr else {
            panic!("top-level operator should be ||");
        };
        assert!(matches!(*lhs, Expr::BinOp { op: BinOp::And, .. }));
    }

    #[test]
    fn test_parse_parenthesized() {
        let expr = Expr::parse("(true || false) == true").unwrap();
        assert!(matches!(expr, Expr::BinOp { op: BinOp::Eq, .. }));
    }

    #[test]
    fn test_parse_multiline() {
        let expr = Expr::parse(
            "github.repository_owner == 'octo-org' &&\n  (github.event_name == 'pull_request_review' ||\n   github.event_name == 'pull_request_target')",
        )
        .unwrap();
        assert!(matches!(expr, Expr::BinOp { op: BinOp::And, .. }));
    }

    #[test]
    fn test_parse_spaced_derefs() {
        let expr = Expr::parse("foo . bar").unwrap();
        assert!(matches!(expr, Expr::Context(_)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for case in ["", "==", "'unterminated", "foo ||", "(foo"] {
            assert!(Expr::parse(case).is_err(), "should reject {case}");
        }
    }

    #[test]
    fn test_explicit_expr() {
        let expr = ExplicitExpr::from_curly("${{ github.actor }}").unwrap();
        assert_eq!(expr.as_bare(), "github.actor");
        assert_eq!(expr.as_curly(), "${{ github.actor }}");

        let expr = ExplicitExpr::from_curly("  ${{ foo }}  ").unwrap();
        assert_eq!(expr.as_bare(), "foo");

        // Not whole-string fences:
        assert!(ExplicitExpr::from_curly("prefix ${{ foo }}").is_none());
        assert!(ExplicitExpr::from_curly("${{ foo }} suffix").is_none());
        assert!(ExplicitExpr::from_curly("${{ a }} ${{ b }}").is_none());
        assert!(ExplicitExpr::from_curly("no expression").is_none());
    }
}
