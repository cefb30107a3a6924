//! The rule suite and the kernel every rule embeds.

use crate::{
    config::Config,
    finding::Finding,
    location::Position,
    models::{Exec, Input, Step, StrValue},
    visitor::{FixTarget, Rule},
    yaml_patch::{Op, Patch},
};

pub(crate) mod artifact_poisoning;
pub(crate) mod artipacked;
pub(crate) mod bot_conditions;
pub(crate) mod env_path_injection;
pub(crate) mod impostor_commit;
pub(crate) mod improper_access_control;
pub(crate) mod needs_cycle;
pub(crate) mod obfuscation;
pub(crate) mod ref_confusion;
pub(crate) mod self_hosted_runner;
pub(crate) mod toctou;
pub(crate) mod unmasked_secrets;
pub(crate) mod unpinned_uses;
pub(crate) mod unsound_condition;
pub(crate) mod unsound_contains;

/// Shared state for every rule: its fixed metadata, the findings it
/// has accumulated this workflow, and its pending fix registrations.
#[derive(Debug)]
pub struct RuleCore {
    name: &'static str,
    desc: &'static str,
    path: String,
    findings: Vec<Finding>,
    fixes: Vec<FixTarget>,
}

impl RuleCore {
    /// Builds a kernel with the rule's fixed metadata.
    pub fn new(name: &'static str, desc: &'static str) -> Self {
        Self {
            name,
            desc,
            path: String::new(),
            findings: vec![],
            fixes: vec![],
        }
    }

    /// The rule's fixed identifier.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The rule's fixed description.
    pub fn desc(&self) -> &'static str {
        self.desc
    }

    pub(crate) fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    pub(crate) fn push_finding(
        &mut self,
        rule: &'static str,
        position: Position,
        description: String,
    ) {
        tracing::debug!("{rule}: {description} at {position}");
        self.findings.push(Finding {
            rule,
            path: self.path.clone(),
            position,
            description,
        });
    }

    pub(crate) fn push_fix(&mut self, target: FixTarget) {
        self.fixes.push(target);
    }

    pub(crate) fn take_findings(&mut self) -> Vec<Finding> {
        std::mem::take(&mut self.findings)
    }

    pub(crate) fn take_fixes(&mut self) -> Vec<FixTarget> {
        std::mem::take(&mut self.fixes)
    }
}

/// Pins a rule's fixed identifier and description.
macro_rules! rule_meta {
    ($rule:ty, $name:literal, $desc:literal) => {
        impl $rule {
            pub(crate) const NAME: &'static str = $name;
            pub(crate) const DESC: &'static str = $desc;

            pub(crate) fn meta_core() -> crate::rules::RuleCore {
                crate::rules::RuleCore::new(Self::NAME, Self::DESC)
            }
        }
    };
}

pub(crate) use rule_meta;

/// Sets `key: value` under a step's `with:` block, in both the typed
/// AST and the document.
///
/// An existing same-named key is never overwritten; a missing `with:`
/// block is created. Returns whether anything was done (false for
/// non-action steps and already-present keys).
pub(crate) fn ensure_with_entry(
    step: &mut Step,
    key: &str,
    value: serde_yaml::Value,
    patches: &mut Vec<Patch>,
) -> bool {
    let Exec::Action { inputs, .. } = &mut step.exec else {
        return false;
    };

    if inputs.contains_key(key) {
        return false;
    }

    let rendered = match &value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim_end().to_string(),
    };

    inputs.insert(
        key.to_string(),
        Input {
            name: key.to_string(),
            value: StrValue::new(
                rendered,
                step.position,
                step.route.with_key("with").with_key(key),
            ),
        },
    );

    let mut with = serde_yaml::Mapping::new();
    with.insert(key.into(), value);
    patches.push(Patch {
        route: step.route.clone(),
        operation: Op::MergeInto {
            key: "with".into(),
            value: serde_yaml::Value::Mapping(with),
        },
    });

    true
}

/// Contexts that make a checkout `ref:` follow the pull request's
/// moving branch head instead of the reviewed commit.
pub(crate) const MUTABLE_PR_REFS: &[&str] =
    &["github.event.pull_request.head.ref", "github.head_ref"];

/// The reviewed-commit context the mutable forms rewrite to.
pub(crate) const PINNED_PR_SHA: &str = "github.event.pull_request.head.sha";

/// Whether a checkout `ref:` value follows the PR's mutable head.
pub(crate) fn has_mutable_pr_ref(value: &str) -> bool {
    MUTABLE_PR_REFS.iter().any(|needle| value.contains(needle))
}

/// Rewrites every mutable PR-head context in the step's `ref:` input
/// to the head SHA, in both the AST and the document. No-op when the
/// input is already pinned.
pub(crate) fn fix_mutable_checkout_ref(step: &mut Step, patches: &mut Vec<Patch>) {
    let Some(inputs) = step.inputs_mut() else {
        return;
    };
    let Some(input) = inputs.get_mut("ref") else {
        return;
    };

    for needle in MUTABLE_PR_REFS {
        if !input.value.as_str().contains(needle) {
            continue;
        }

        let rewritten = input.value.as_str().replace(needle, PINNED_PR_SHA);
        input.value.set_value(rewritten);

        patches.push(Patch {
            route: input.value.route.clone(),
            operation: Op::RewriteFragment {
                from: needle.to_string(),
                to: PINNED_PR_SHA.to_string(),
                after: None,
            },
        });
    }
}

/// Builds the rule registry for a run, honoring the configuration's
/// enablement map. Registry order is fixed; findings and fixes follow
/// it deterministically.
pub fn default_rules(config: &Config) -> Vec<Box<dyn Rule>> {
    let mut rules: Vec<Box<dyn Rule>> = Vec::new();

    macro_rules! register {
        ($rule:ty) => {
            if !config.disables(<$rule>::NAME) {
                rules.push(Box::new(<$rule>::new()));
            }
        };
    }

    register!(artifact_poisoning::ArtifactPoisoning);
    register!(artifact_poisoning::UntrustedArtifactDownload);
    register!(artipacked::Artipacked);
    register!(improper_access_control::ImproperAccessControl);
    register!(toctou::ToctouCheckout);
    register!(bot_conditions::BotConditions);
    register!(impostor_commit::ImpostorCommit);
    register!(ref_confusion::RefConfusion);
    register!(unpinned_uses::UnpinnedUses);
    register!(env_path_injection::PathInjection);
    register!(env_path_injection::EnvInjection);
    register!(unmasked_secrets::UnmaskedSecrets);
    register!(self_hosted_runner::SelfHostedRunner);
    register!(obfuscation::Obfuscation);
    register!(unsound_contains::UnsoundContains);
    register!(unsound_condition::UnsoundCondition);
    register!(needs_cycle::NeedsCycle);

    rules
}

/// Every rule identifier, in registry order.
pub fn all_rule_names() -> Vec<&'static str> {
    vec![
        artifact_poisoning::ArtifactPoisoning::NAME,
        artifact_poisoning::UntrustedArtifactDownload::NAME,
        artipacked::Artipacked::NAME,
        improper_access_control::ImproperAccessControl::NAME,
        toctou::ToctouCheckout::NAME,
        bot_conditions::BotConditions::NAME,
        impostor_commit::ImpostorCommit::NAME,
        ref_confusion::RefConfusion::NAME,
        unpinned_uses::UnpinnedUses::NAME,
        env_path_injection::PathInjection::NAME,
        env_path_injection::EnvInjection::NAME,
        unmasked_secrets::UnmaskedSecrets::NAME,
        self_hosted_runner::SelfHostedRunner::NAME,
        obfuscation::Obfuscation::NAME,
        unsound_contains::UnsoundContains::NAME,
        unsound_condition::UnsoundCondition::NAME,
        needs_cycle::NeedsCycle::NAME,
    ]
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared scaffolding for rule tests.

    use crate::{
        config::Config,
        finding::Finding,
        fix,
        models::Workflow,
        visitor::{Driver, Rule},
    };

    /// Runs a single rule over the given workflow YAML, returning the
    /// findings and the fixed document (when any fixes registered).
    pub(crate) fn run_rule(
        rule: Box<dyn Rule>,
        contents: &str,
    ) -> (Vec<Finding>, Option<String>) {
        let mut workflow = Workflow::from_string("test.yml", contents).unwrap();
        let mut driver = Driver::new(vec![rule]);

        let requests = driver.visit(&workflow);
        let findings = driver.take_findings();

        let fixed = fix::apply_fix_requests(&mut workflow, &mut driver.rules, &requests)
            .expect("fix application failed");

        (findings, fixed)
    }

    /// Runs a single rule and asserts it produced no findings.
    pub(crate) fn assert_no_findings(rule: Box<dyn Rule>, contents: &str) {
        let (findings, _) = run_rule(rule, contents);
        assert!(
            findings.is_empty(),
            "expected no findings, got: {findings:?}"
        );
    }

    /// Full-registry run with the online rules disabled, used by
    /// cross-rule tests.
    pub(crate) fn offline_config() -> Config {
        let mut config = Config::default();
        config.rules.disabled.insert("impostor-commit".into());
        config.rules.disabled.insert("ref-confusion".into());
        config
    }
}
