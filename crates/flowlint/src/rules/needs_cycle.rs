//! The job dependency graph: duplicate ids, duplicate or dangling
//! `needs:` entries, and dependency cycles.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::{
    finding::Severity,
    location::Position,
    models::Workflow,
    rules::{RuleCore, rule_meta},
    visitor::Rule,
};

pub(crate) struct NeedsCycle {
    core: RuleCore,
}

rule_meta!(
    NeedsCycle,
    "needs-cycle",
    "invalid or cyclic job dependency graph"
);

/// DFS colors.
#[derive(Clone, Copy, PartialEq)]
enum Color {
    New,
    Active,
    Inactive,
}

impl NeedsCycle {
    pub(crate) fn new() -> Self {
        Self {
            core: Self::meta_core(),
        }
    }

    /// Iterative DFS over the adjacency map; a back-edge to an active
    /// node reconstructs the cycle from the walk stack.
    fn find_cycle(
        nodes: &[String],
        edges: &BTreeMap<String, Vec<String>>,
    ) -> Option<Vec<String>> {
        let mut colors: BTreeMap<&str, Color> =
            nodes.iter().map(|n| (n.as_str(), Color::New)).collect();

        for root in nodes {
            if colors[root.as_str()] != Color::New {
                continue;
            }

            // (node, next child index) frames; `path` mirrors the
            // active chain for cycle reconstruction.
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            let mut path: Vec<&str> = vec![root.as_str()];
            colors.insert(root.as_str(), Color::Active);

            while let Some((node, child_idx)) = stack.pop() {
                let children = edges.get(node).map(Vec::as_slice).unwrap_or_default();

                match children.get(child_idx) {
                    Some(child) => {
                        stack.push((node, child_idx + 1));

                        match colors.get(child.as_str()).copied() {
                            Some(Color::Active) => {
                                // Back-edge: the cycle runs from the
                                // child's position in the path to here.
                                let start = path
                                    .iter()
                                    .position(|n| *n == child.as_str())
                                    .unwrap_or(0);
                                let mut cycle: Vec<String> =
                                    path[start..].iter().map(|n| n.to_string()).collect();
                                cycle.push(child.clone());
                                return Some(cycle);
                            }
                            Some(Color::New) => {
                                colors.insert(child.as_str(), Color::Active);
                                stack.push((child.as_str(), 0));
                                path.push(child.as_str());
                            }
                            // Inactive nodes (and dangling refs) are done.
                            _ => {}
                        }
                    }
                    None => {
                        colors.insert(node, Color::Inactive);
                        path.pop();
                    }
                }
            }
        }

        None
    }
}

impl Rule for NeedsCycle {
    fn core(&self) -> &RuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RuleCore {
        &mut self.core
    }

    fn workflow_post(&mut self, workflow: &Workflow) -> Result<()> {
        // Nodes are lowercased job ids; ids must be unique
        // case-insensitively.
        let mut nodes: Vec<String> = vec![];
        let mut positions: BTreeMap<String, Position> = BTreeMap::new();
        for job in workflow.jobs() {
            let id = job.id.as_str().to_lowercase();

            if positions.contains_key(&id) {
                self.report(
                    job.position,
                    format!(
                        "{} duplicate job id `{}` (job ids are case-insensitive)",
                        Severity::High.tag(),
                        job.id.as_str()
                    ),
                );
                continue;
            }

            positions.insert(id.clone(), job.position);
            nodes.push(id);
        }

        // Edges from `needs:`; duplicates and dangling targets are
        // findings of their own.
        let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for job in workflow.jobs() {
            let id = job.id.as_str().to_lowercase();
            let mut seen = BTreeSet::new();

            for needed in &job.needs {
                let target = needed.as_str().to_lowercase();

                if !seen.insert(target.clone()) {
                    self.report(
                        needed.position,
                        format!(
                            "{} job `{}` lists `{}` in needs more than once",
                            Severity::Low.tag(),
                            job.id.as_str(),
                            needed.as_str()
                        ),
                    );
                    continue;
                }

                if !positions.contains_key(&target) {
                    self.report(
                        needed.position,
                        format!(
                            "{} job `{}` needs undefined job `{}`",
                            Severity::High.tag(),
                            job.id.as_str(),
                            needed.as_str()
                        ),
                    );
                    continue;
                }

                edges.entry(id.clone()).or_default().push(target);
            }
        }

        if let Some(cycle) = Self::find_cycle(&nodes, &edges) {
            let rendered = cycle
                .iter()
                .zip(cycle.iter().skip(1))
                .map(|(from, to)| format!("`{from}` -> `{to}`"))
                .collect::<Vec<_>>()
                .join(", ");

            let position = positions
                .get(&cycle[0])
                .copied()
                .unwrap_or(workflow.position);

            self.report(
                position,
                format!(
                    "{} job dependencies form a cycle: {rendered}",
                    Severity::High.tag(),
                ),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::rules::test_support::{assert_no_findings, run_rule};

    use super::NeedsCycle;

    #[test]
    fn test_three_job_cycle() {
        let (findings, _) = run_rule(
            Box::new(NeedsCycle::new()),
            r#"
on: push
jobs:
  a:
    needs: b
    runs-on: ubuntu-latest
    steps: []
  b:
    needs: c
    runs-on: ubuntu-latest
    steps: []
  c:
    needs: a
    runs-on: ubuntu-latest
    steps: []
"#,
        );

        assert_eq!(findings.len(), 1);
        let desc = &findings[0].description;
        assert!(desc.contains("cycle"));
        // All three edges are named.
        assert_eq!(desc.matches("->").count(), 3);
    }

    #[test]
    fn test_self_cycle() {
        let (findings, _) = run_rule(
            Box::new(NeedsCycle::new()),
            r#"
on: push
jobs:
  a:
    needs: a
    runs-on: ubuntu-latest
    steps: []
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("cycle"));
    }

    #[test]
    fn test_undefined_needs() {
        let (findings, _) = run_rule(
            Box::new(NeedsCycle::new()),
            r#"
on: push
jobs:
  a:
    needs: [missing]
    runs-on: ubuntu-latest
    steps: []
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("undefined job `missing`"));
    }

    #[test]
    fn test_duplicate_needs() {
        let (findings, _) = run_rule(
            Box::new(NeedsCycle::new()),
            r#"
on: push
jobs:
  a:
    runs-on: ubuntu-latest
    steps: []
  b:
    needs: [a, A]
    runs-on: ubuntu-latest
    steps: []
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("more than once"));
    }

    #[test]
    fn test_duplicate_job_ids() {
        let (findings, _) = run_rule(
            Box::new(NeedsCycle::new()),
            r#"
on: push
jobs:
  Build:
    runs-on: ubuntu-latest
    steps: []
  build:
    runs-on: ubuntu-latest
    steps: []
"#,
        );

        assert_eq!(findings.len(), 1);
        assert!(findings[0].description.contains("duplicate job id"));
    }

    #[test]
    fn test_dag_is_silent() {
        assert_no_findings(
            Box::new(NeedsCycle::new()),
            r#"
on: push
jobs:
  lint:
    runs-on: ubuntu-latest
    steps: []
  build:
    needs: lint
    runs-on: ubuntu-latest
    steps: []
  test:
    needs: [lint, build]
    runs-on: ubuntu-latest
    steps: []
"#,
        );
    }
}
