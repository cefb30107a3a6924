//! Finding and severity models.

use std::fmt;

use crate::location::Position;

/// The severity tier of a finding, rendered as the bracketed prefix of
/// its description (e.g. `[High]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational only.
    Informational,
    /// Low severity.
    Low,
    /// Medium severity.
    Medium,
    /// High severity.
    High,
    /// Critical severity.
    Critical,
}

impl Severity {
    /// The bracketed description prefix for this severity.
    pub fn tag(&self) -> &'static str {
        match self {
            Severity::Informational => "[Informational]",
            Severity::Low => "[Low]",
            Severity::Medium => "[Medium]",
            Severity::High => "[High]",
            Severity::Critical => "[Critical]",
        }
    }
}

/// A single diagnostic produced by a rule.
#[derive(Debug, Clone)]
pub struct Finding {
    /// The emitting rule's fixed identifier.
    pub rule: &'static str,
    /// Path of the workflow file the finding is in.
    pub path: String,
    /// 1-based position of the offending syntax.
    pub position: Position,
    /// Human-readable description. Severity-bearing findings start with
    /// a bracketed tag such as `[High]`.
    pub description: String,
}

impl Finding {
    /// The bracketed severity prefix of the description, if it carries
    /// one (e.g. `[High]`, `[HIGH]`, `[Informational]`).
    pub fn severity_prefix(&self) -> Option<&str> {
        let desc = self.description.trim_start();
        if !desc.starts_with('[') {
            return None;
        }

        desc.find(']').map(|end| &desc[..=end])
    }

    /// Renders this finding through a user-supplied format template.
    ///
    /// Recognized placeholders: `{path}`, `{line}`, `{col}`, `{rule}`,
    /// `{desc}`. Unknown text is passed through verbatim.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{path}", &self.path)
            .replace("{line}", &self.position.line.to_string())
            .replace("{col}", &self.position.col.to_string())
            .replace("{rule}", self.rule)
            .replace("{desc}", &self.description)
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{path}:{pos}: {desc} [{rule}]",
            path = self.path,
            pos = self.position,
            desc = self.description,
            rule = self.rule
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::location::Position;

    use super::{Finding, Severity};

    fn finding() -> Finding {
        Finding {
            rule: "artipacked",
            path: "ci.yml".into(),
            position: Position::new(12, 9),
            description: "[High] credential persistence risk".into(),
        }
    }

    #[test]
    fn test_severity_tags() {
        assert_eq!(Severity::Critical.tag(), "[Critical]");
        assert_eq!(Severity::High.tag(), "[High]");
        assert_eq!(Severity::Informational.tag(), "[Informational]");
    }

    #[test]
    fn test_severity_prefix() {
        assert_eq!(finding().severity_prefix(), Some("[High]"));

        let untagged = Finding {
            description: "no prefix here".into(),
            ..finding()
        };
        assert_eq!(untagged.severity_prefix(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            finding().to_string(),
            "ci.yml:12:9: [High] credential persistence risk [artipacked]"
        );
    }

    #[test]
    fn test_render_template() {
        assert_eq!(
            finding().render("{rule}|{path}|{line}|{col}|{desc}"),
            "artipacked|ci.yml|12|9|[High] credential persistence risk"
        );
    }
}
