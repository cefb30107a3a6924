//! Configuration consumed by the rule engine.
//!
//! Loading configuration from disk is the caller's concern; this module
//! only models the keys the core consumes.

use regex::Regex;
use std::collections::BTreeSet;

use crate::finding::Finding;

/// Whether and how autofixes are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FixMode {
    /// Report findings only.
    #[default]
    Off,
    /// Apply fixes and rewrite the workflow file.
    On,
    /// Compute the fixed document but don't persist it.
    DryRun,
}

/// Per-rule enablement.
///
/// With an `only` set present, rules are opt-in; otherwise every rule
/// runs except those in `disabled`.
#[derive(Debug, Clone, Default)]
pub struct RuleSelection {
    /// Opt-in allowlist. `None` means "all rules".
    pub only: Option<BTreeSet<String>>,
    /// Opt-out denylist, applied after `only`.
    pub disabled: BTreeSet<String>,
}

/// Configuration keys consumed by the engine.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Rule enablement map.
    pub rules: RuleSelection,
    /// Findings whose rendered descriptions match any of these patterns
    /// are dropped.
    pub ignore_patterns: Vec<Regex>,
    /// Autofix mode.
    pub fix_mode: FixMode,
    /// Emit rule debug output through `tracing` at debug level.
    pub verbose: bool,
    /// Custom finding format template (see [`Finding::render`]).
    pub format: Option<String>,
}

impl Config {
    /// Whether the named rule is disabled by this configuration.
    pub fn disables(&self, ident: &str) -> bool {
        if let Some(only) = &self.rules.only {
            if !only.contains(ident) {
                return true;
            }
        }

        self.rules.disabled.contains(ident)
    }

    /// Whether the given finding should be suppressed.
    pub fn ignores(&self, finding: &Finding) -> bool {
        let rendered = finding.to_string();
        self.ignore_patterns.iter().any(|p| p.is_match(&rendered))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use regex::Regex;

    use crate::{finding::Finding, location::Position};

    use super::Config;

    #[test]
    fn test_disables() {
        let mut config = Config::default();
        assert!(!config.disables("artipacked"));

        config.rules.disabled.insert("artipacked".into());
        assert!(config.disables("artipacked"));
        assert!(!config.disables("bot-conditions"));

        config.rules.only = Some(BTreeSet::from(["needs-cycle".into()]));
        assert!(config.disables("bot-conditions"));
        assert!(!config.disables("needs-cycle"));
    }

    #[test]
    fn test_ignores() {
        let mut config = Config::default();
        config
            .ignore_patterns
            .push(Regex::new(r"persist-credentials").unwrap());

        let finding = Finding {
            rule: "artipacked",
            path: "ci.yml".into(),
            position: Position::default(),
            description: "[High] does not set persist-credentials: false".into(),
        };
        assert!(config.ignores(&finding));

        let other = Finding {
            description: "[High] something else".into(),
            ..finding
        };
        assert!(!config.ignores(&other));
    }
}
