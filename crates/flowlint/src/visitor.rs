//! The rule trait and the single-pass visitor driver.

use anyhow::Result;

use crate::{
    finding::Finding,
    location::Position,
    models::{Job, Step, Workflow},
    rules::RuleCore,
    yaml_patch::Patch,
};

/// The node an autofixer was registered against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixTarget {
    /// A whole job.
    Job {
        /// The job's id.
        job_id: String,
    },
    /// A single step.
    Step {
        /// The enclosing job's id.
        job_id: String,
        /// The step's index within the job.
        index: usize,
    },
}

/// A security rule.
///
/// Every rule embeds a [`RuleCore`] (findings, fix registrations, and
/// its fixed name/description) and overrides whichever of the five
/// traversal callbacks it needs; the rest default to no-ops. Rules
/// that repair what they flag also override [`Rule::fix_step`] or
/// [`Rule::fix_job`]; the engine invokes those with the targets the
/// rule registered during the pass.
pub trait Rule {
    /// The rule's kernel.
    fn core(&self) -> &RuleCore;

    /// The rule's kernel, mutably.
    fn core_mut(&mut self) -> &mut RuleCore;

    /// The rule's fixed identifier.
    fn name(&self) -> &'static str {
        self.core().name()
    }

    /// The rule's fixed one-line description.
    fn desc(&self) -> &'static str {
        self.core().desc()
    }

    /// Called once per workflow, before any job.
    fn workflow_pre(&mut self, _workflow: &Workflow) -> Result<()> {
        Ok(())
    }

    /// Called once per job, before its steps.
    fn job_pre(&mut self, _job: &Job, _workflow: &Workflow) -> Result<()> {
        Ok(())
    }

    /// Called once per step, in source order.
    fn step(&mut self, _step: &Step, _job: &Job, _workflow: &Workflow) -> Result<()> {
        Ok(())
    }

    /// Called once per job, after its steps.
    fn job_post(&mut self, _job: &Job, _workflow: &Workflow) -> Result<()> {
        Ok(())
    }

    /// Called once per workflow, after every job.
    fn workflow_post(&mut self, _workflow: &Workflow) -> Result<()> {
        Ok(())
    }

    /// Repairs a step this rule registered a fix against: mutate the
    /// typed AST in place and append the matching document patches.
    fn fix_step(&mut self, _step: &mut Step, _patches: &mut Vec<Patch>) -> Result<()> {
        anyhow::bail!("{} has no step fixer", self.name())
    }

    /// Repairs a job this rule registered a fix against.
    fn fix_job(&mut self, _job: &mut Job, _patches: &mut Vec<Patch>) -> Result<()> {
        anyhow::bail!("{} has no job fixer", self.name())
    }

    /// Records a finding at the given position.
    fn report(&mut self, position: Position, description: impl Into<String>)
    where
        Self: Sized,
    {
        let rule = self.name();
        self.core_mut().push_finding(rule, position, description.into());
    }

    /// Registers this rule's step fixer against the given step.
    fn register_step_fix(&mut self, job: &Job, step: &Step)
    where
        Self: Sized,
    {
        self.core_mut().push_fix(FixTarget::Step {
            job_id: job.id.as_str().to_string(),
            index: step.index,
        });
    }

    /// Registers this rule's job fixer against the given job.
    fn register_job_fix(&mut self, job: &Job)
    where
        Self: Sized,
    {
        self.core_mut().push_fix(FixTarget::Job {
            job_id: job.id.as_str().to_string(),
        });
    }
}

/// A fix registration, in the order it was made during the pass.
#[derive(Debug)]
pub struct FixRequest {
    /// Index of the registering rule in the driver's registry.
    pub(crate) rule: usize,
    /// The registered target.
    pub target: FixTarget,
}

/// Walks one workflow and dispatches the five callbacks to every
/// registered rule in a single coordinated pass.
///
/// A rule error kills only that rule's remaining callbacks for the
/// current workflow; every other rule continues.
pub struct Driver {
    pub(crate) rules: Vec<Box<dyn Rule>>,
}

impl Driver {
    /// Builds a driver over the given rules.
    pub fn new(rules: Vec<Box<dyn Rule>>) -> Self {
        Self { rules }
    }

    /// Runs the pass, returning fix registrations in order.
    pub fn visit(&mut self, workflow: &Workflow) -> Vec<FixRequest> {
        let mut dead = vec![false; self.rules.len()];
        let mut requests = Vec::new();

        for rule in &mut self.rules {
            rule.core_mut().set_path(&workflow.path);
        }

        macro_rules! dispatch {
            ($name:literal, $call:expr) => {
                for (idx, rule) in self.rules.iter_mut().enumerate() {
                    if dead[idx] {
                        continue;
                    }

                    #[allow(clippy::redundant_closure_call)]
                    if let Err(err) = $call(rule) {
                        tracing::warn!("rule {} failed in {}: {err}", rule.name(), $name);
                        dead[idx] = true;
                        continue;
                    }

                    for target in rule.core_mut().take_fixes() {
                        requests.push(FixRequest { rule: idx, target });
                    }
                }
            };
        }

        dispatch!("workflow_pre", |rule: &mut Box<dyn Rule>| rule
            .workflow_pre(workflow));

        for job in workflow.jobs() {
            dispatch!("job_pre", |rule: &mut Box<dyn Rule>| rule
                .job_pre(job, workflow));

            for step in &job.steps {
                dispatch!("step", |rule: &mut Box<dyn Rule>| rule
                    .step(step, job, workflow));
            }

            dispatch!("job_post", |rule: &mut Box<dyn Rule>| rule
                .job_post(job, workflow));
        }

        dispatch!("workflow_post", |rule: &mut Box<dyn Rule>| rule
            .workflow_post(workflow));

        requests
    }

    /// Drains every rule's accumulated findings, in registry order.
    pub fn take_findings(&mut self) -> Vec<Finding> {
        self.rules
            .iter_mut()
            .flat_map(|rule| rule.core_mut().take_findings())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use anyhow::Result;

    use crate::{
        models::{Job, Step, Workflow},
        rules::RuleCore,
    };

    use super::{Driver, Rule};

    type CallLog = Rc<RefCell<Vec<String>>>;

    /// Records callback deliveries for the pass-shape invariants.
    struct SpyRule {
        core: RuleCore,
        calls: CallLog,
        fail_on_step: bool,
    }

    impl SpyRule {
        fn new(calls: CallLog, fail_on_step: bool) -> Self {
            Self {
                core: RuleCore::new("spy", "records callbacks"),
                calls,
                fail_on_step,
            }
        }
    }

    impl Rule for SpyRule {
        fn core(&self) -> &RuleCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut RuleCore {
            &mut self.core
        }

        fn workflow_pre(&mut self, _wf: &Workflow) -> Result<()> {
            self.calls.borrow_mut().push("workflow_pre".into());
            Ok(())
        }

        fn job_pre(&mut self, job: &Job, _wf: &Workflow) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("job_pre:{}", job.id.as_str()));
            Ok(())
        }

        fn step(&mut self, step: &Step, job: &Job, _wf: &Workflow) -> Result<()> {
            if self.fail_on_step {
                anyhow::bail!("boom");
            }
            self.calls
                .borrow_mut()
                .push(format!("step:{}:{}", job.id.as_str(), step.index));
            Ok(())
        }

        fn job_post(&mut self, job: &Job, _wf: &Workflow) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("job_post:{}", job.id.as_str()));
            Ok(())
        }

        fn workflow_post(&mut self, _wf: &Workflow) -> Result<()> {
            self.calls.borrow_mut().push("workflow_post".into());
            Ok(())
        }
    }

    fn workflow() -> Workflow {
        Workflow::from_string(
            "spy.yml",
            r#"
on: push
jobs:
  alpha:
    runs-on: ubuntu-latest
    steps:
      - run: echo one
      - run: echo two
  beta:
    runs-on: ubuntu-latest
    steps:
      - run: echo three
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_single_pass_callback_shape() {
        let wf = workflow();
        let calls: CallLog = Default::default();
        let mut driver = Driver::new(vec![Box::new(SpyRule::new(calls.clone(), false))]);
        driver.visit(&wf);

        assert_eq!(
            *calls.borrow(),
            [
                "workflow_pre",
                "job_pre:alpha",
                "step:alpha:0",
                "step:alpha:1",
                "job_post:alpha",
                "job_pre:beta",
                "step:beta:0",
                "job_post:beta",
                "workflow_post",
            ]
        );
    }

    #[test]
    fn test_failed_rule_is_short_circuited() {
        let wf = workflow();
        let failing_calls: CallLog = Default::default();
        let healthy_calls: CallLog = Default::default();

        let mut driver = Driver::new(vec![
            Box::new(SpyRule::new(failing_calls.clone(), true)),
            Box::new(SpyRule::new(healthy_calls.clone(), false)),
        ]);
        driver.visit(&wf);

        // The failing rule saw workflow_pre and the first job_pre, then
        // nothing after its step error.
        assert_eq!(*failing_calls.borrow(), ["workflow_pre", "job_pre:alpha"]);

        // The healthy rule's traversal is unaffected.
        assert_eq!(healthy_calls.borrow().len(), 9);
    }
}
