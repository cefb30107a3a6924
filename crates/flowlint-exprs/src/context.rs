//! Matching helpers for expression contexts (e.g. `github.event.number`).

use crate::Expr;

/// A context reference in an expression.
///
/// Usually a dotted identifier chain like `github.actor`, but the head
/// may also be a call (`fromJSON(...).foo`) and components may be
/// indices (`foo['bar']`, `foo[0]`) or wildcards (`foo.*.name`).
#[derive(Debug, PartialEq)]
pub struct Context<'src> {
    raw: &'src str,
    /// The context's components, in order.
    pub parts: Vec<Expr<'src>>,
}

impl<'src> Context<'src> {
    pub(crate) fn new(raw: &'src str, parts: impl Into<Vec<Expr<'src>>>) -> Self {
        Self {
            raw,
            parts: parts.into(),
        }
    }

    /// The context's raw source text.
    pub fn as_str(&self) -> &str {
        self.raw
    }

    /// A component's comparable text: identifiers and string indices
    /// compare by value, `*` and computed indices only against `*`.
    fn part_matches(part: &Expr, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }

        match part {
            Expr::Identifier(ident) => ident == pattern,
            Expr::Index(idx) => match idx.as_ref() {
                Expr::String(s) => s.eq_ignore_ascii_case(pattern),
                _ => false,
            },
            _ => false,
        }
    }

    fn compare(&self, pattern: &str) -> Option<bool> {
        let mut pattern_parts = pattern.split('.').peekable();
        let mut ctx_parts = self.parts.iter().peekable();

        while let (Some(pat), Some(part)) = (pattern_parts.peek(), ctx_parts.peek()) {
            if !Self::part_matches(part, pat) {
                return None;
            }

            pattern_parts.next();
            ctx_parts.next();
        }

        match (pattern_parts.next(), ctx_parts.next()) {
            // Both exhausted: exact match.
            (None, None) => Some(true),
            // Pattern exhausted first: the context is a strict child.
            (None, Some(_)) => Some(false),
            _ => None,
        }
    }

    /// Whether this context matches the dotted pattern exactly
    /// (case-insensitively; string indices count as components, so
    /// `github['actor']` matches `github.actor`).
    pub fn matches(&self, pattern: &str) -> bool {
        matches!(self.compare(pattern), Some(true))
    }

    /// Whether this context is the pattern itself or a descendant of it:
    /// `github.event.number` is a child of `github.event` and of itself.
    pub fn child_of(&self, pattern: &str) -> bool {
        self.compare(pattern).is_some()
    }

    /// For two-component contexts like `env.FOO` or `inputs['bar']`,
    /// the tail component's name. `None` for anything deeper or for
    /// call-headed contexts.
    pub fn single_tail(&self) -> Option<&str> {
        if self.parts.len() != 2 || !matches!(self.parts[0], Expr::Identifier(_)) {
            return None;
        }

        match &self.parts[1] {
            Expr::Identifier(ident) => Some(ident.as_str()),
            Expr::Index(idx) => match idx.as_ref() {
                Expr::String(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }
}

impl PartialEq<str> for Context<'_> {
    fn eq(&self, other: &str) -> bool {
        self.matches(other)
    }
}
