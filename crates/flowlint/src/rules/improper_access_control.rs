//! Label-gated checkout of a mutable PR ref on `pull_request_target`:
//! the label approves one commit, the ref checks out whatever the
//! branch points at by the time the job runs.

use anyhow::Result;

use crate::{
    finding::Severity,
    location::Route,
    models::{Job, Step, TriggerStyle, Workflow, uses::parse_action_ref},
    rules::{RuleCore, has_mutable_pr_ref, fix_mutable_checkout_ref, rule_meta},
    visitor::Rule,
    yaml_patch::{Op, Patch},
};

/// Condition fragments that gate a step on PR labels.
const LABEL_CONDITIONS: &[&str] = &[
    "github.event.pull_request.labels",
    "contains(github.event.pull_request.labels",
    "github.event.label",
];

pub(crate) struct ImproperAccessControl {
    core: RuleCore,
    /// Whether `pull_request_target` fires for synchronize events
    /// (explicitly, or implicitly via an absent `types:`).
    synchronizes: bool,
    active: bool,
    /// The `types:` correction, computed once per workflow and emitted
    /// by the first fixer invocation.
    types_patch: Option<Patch>,
}

rule_meta!(
    ImproperAccessControl,
    "improper-access-control",
    "label-gated checkout of a mutable pull request ref"
);

impl ImproperAccessControl {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
            synchronizes: false,
            active: false,
            types_patch: None,
        }
    }

    /// Builds the patch that stops the workflow from re-running on
    /// synchronize once a label is present:
    ///
    /// - explicit `types:` containing `synchronize` → replace it with
    ///   `labeled` (or drop it when `labeled` is already listed);
    /// - no `types:` at all → install `types: [labeled]`.
    fn types_correction(workflow: &Workflow) -> Option<Patch> {
        let hook = workflow.webhook("pull_request_target")?;

        if hook.types_specified {
            if !hook.types.iter().any(|t| t == "synchronize") {
                return None;
            }

            let mut types: Vec<serde_yaml::Value> = hook
                .types
                .iter()
                .filter(|t| *t != "synchronize")
                .map(|t| serde_yaml::Value::String(t.clone()))
                .collect();
            if !types.iter().any(|t| t.as_str() == Some("labeled")) {
                types.push("labeled".into());
            }

            return Some(Patch {
                route: hook.route.with_key("types"),
                operation: Op::Replace(serde_yaml::Value::Sequence(types)),
            });
        }

        // No explicit types. For the detailed spelling the event entry
        // exists to add under; the bare/list spellings need the whole
        // `on:` block rebuilt as a mapping.
        match workflow.trigger_style {
            TriggerStyle::Detailed => Some(Patch {
                route: hook.route.clone(),
                operation: Op::Add {
                    key: "types".into(),
                    value: serde_yaml::Value::Sequence(vec!["labeled".into()]),
                },
            }),
            TriggerStyle::Bare | TriggerStyle::List => {
                let mut events = serde_yaml::Mapping::new();
                for event in &workflow.events {
                    if event.name() == "pull_request_target" {
                        let mut body = serde_yaml::Mapping::new();
                        body.insert(
                            "types".into(),
                            serde_yaml::Value::Sequence(vec!["labeled".into()]),
                        );
                        events.insert(event.name().into(), serde_yaml::Value::Mapping(body));
                    } else {
                        events.insert(event.name().into(), serde_yaml::Value::Null);
                    }
                }

                Some(Patch {
                    route: Route::root().with_key("on"),
                    operation: Op::Replace(serde_yaml::Value::Mapping(events)),
                })
            }
        }
    }
}

impl Rule for ImproperAccessControl {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn workflow_pre(&mut self, workflow: &Workflow) -> Result<()> {
        self.active = workflow.has_event("pull_request_target");

        self.synchronizes = workflow
            .webhook("pull_request_target")
            .map(|hook| !hook.types_specified || hook.types.iter().any(|t| t == "synchronize"))
            .unwrap_or(self.active);

        self.types_patch = if self.active {
            Self::types_correction(workflow)
        } else {
            None
        };

        Ok(())
    }

    fn step(&mut self, step: &Step, job: &Job, _workflow: &Workflow) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        let is_checkout = step
            .uses()
            .and_then(|u| parse_action_ref(u.as_str()))
            .map(|action| action.matches_slug("actions/checkout"))
            .unwrap_or(false);
        if !is_checkout {
            return Ok(());
        }

        let Some(ref_input) = step.input("ref") else {
            return Ok(());
        };
        if !has_mutable_pr_ref(ref_input.value.as_str()) {
            return Ok(());
        }

        let label_gated = step
            .cond
            .as_ref()
            .map(|cond| {
                LABEL_CONDITIONS
                    .iter()
                    .any(|needle| cond.as_str().contains(needle))
            })
            .unwrap_or(false);

        if label_gated && self.synchronizes {
            self.report(
                step.position,
                format!(
                    "{} label-gated checkout uses the mutable ref `{}`; the approved commit can be swapped after labeling",
                    Severity::High.tag(),
                    ref_input.value.as_str().trim()
                ),
            );
        } else {
            self.report(
                step.position,
                format!(
                    "{} checkout of mutable pull request ref `{}` under pull_request_target",
                    Severity::Medium.tag(),
                    ref_input.value.as_str().trim()
                ),
            );
        }

        self.register_step_fix(job, step);
        Ok(())
    }

    fn fix_step(&mut self, step: &mut Step, patches: &mut Vec<Patch>) -> Result<()> {
        fix_mutable_checkout_ref(step, patches);

        if let Some(types_patch) = self.types_patch.take() {
            patches.push(types_patch);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use crate::rules::test_support::{assert_no_findings, run_rule};

    use super::ImproperAccessControl;

    #[test]
    fn test_label_gated_mutable_checkout() {
        let (findings, fixed) = run_rule(
            Box::new(ImproperAccessControl::new()),
            r#"
on:
  pull_request_target:
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - if: contains(github.event.pull_request.labels.*.name, 'safe-to-test')
        uses: actions/checkout@v4
        with:
          ref: ${{ github.event.pull_request.head.ref }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("[High]"));

        let fixed = fixed.unwrap();
        assert!(fixed.contains("ref: ${{ github.event.pull_request.head.sha }}"));
        assert!(fixed.contains("types: [labeled]"));
    }

    #[test]
    fn test_mutable_ref_without_label_gate() {
        let (findings, fixed) = run_rule(
            Box::new(ImproperAccessControl::new()),
            r#"
on:
  pull_request_target:
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.head_ref }}
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("[Medium]"));
        assert!(
            fixed
                .unwrap()
                .contains("ref: ${{ github.event.pull_request.head.sha }}")
        );
    }

    #[test]
    fn test_synchronize_replaced_in_types() {
        let (_, fixed) = run_rule(
            Box::new(ImproperAccessControl::new()),
            r#"
on:
  pull_request_target:
    types: [synchronize, opened]
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - if: contains(github.event.pull_request.labels.*.name, 'ok')
        uses: actions/checkout@v4
        with:
          ref: ${{ github.event.pull_request.head.ref }}
"#,
        );

        let fixed = fixed.unwrap();
        assert!(fixed.contains("types: [opened, labeled]"));
        assert!(!fixed.contains("synchronize"));
    }

    #[test]
    fn test_synchronize_dropped_when_labeled_present() {
        let (_, fixed) = run_rule(
            Box::new(ImproperAccessControl::new()),
            r#"
on:
  pull_request_target:
    types: [synchronize, labeled]
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.head_ref }}
"#,
        );

        assert!(fixed.unwrap().contains("types: [labeled]"));
    }

    #[test]
    fn test_bare_trigger_rewritten_to_mapping() {
        let (_, fixed) = run_rule(
            Box::new(ImproperAccessControl::new()),
            r#"
on: pull_request_target
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.head_ref }}
"#,
        );

        assert_snapshot!(fixed.unwrap(), @r"
        on:
          pull_request_target:
            types:
            - labeled
        jobs:
          test:
            runs-on: ubuntu-latest
            steps:
              - uses: actions/checkout@v4
                with:
                  ref: ${{ github.event.pull_request.head.sha }}
        ");
    }

    #[test]
    fn test_pinned_ref_is_silent() {
        assert_no_findings(
            Box::new(ImproperAccessControl::new()),
            r#"
on:
  pull_request_target:
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.event.pull_request.head.sha }}
"#,
        );
    }

    #[test]
    fn test_other_triggers_are_silent() {
        assert_no_findings(
            Box::new(ImproperAccessControl::new()),
            r#"
on: pull_request
jobs:
  test:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          ref: ${{ github.head_ref }}
"#,
        );
    }
}
