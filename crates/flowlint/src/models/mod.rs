//! The typed workflow AST and the glue that builds it from raw YAML.
//!
//! Every node carries a 1-based [`Position`] and a [`Route`]
//! back-pointer into the underlying document, so findings can report
//! exact locations and autofixes can patch the original text without
//! disturbing comments or layout.

use indexmap::IndexMap;
use thiserror::Error;

use crate::{
    location::{Position, Route},
    utils,
};

mod raw;
pub mod uses;

pub use raw::{BasePermission, Permission, Permissions};

/// Errors from turning YAML text into a [`Workflow`].
#[derive(Error, Debug)]
pub enum ParseError {
    /// The document isn't valid YAML.
    #[error("invalid YAML syntax: {0}")]
    Syntax(#[from] yamlspan::QueryError),
    /// The document is YAML but doesn't fit the workflow schema.
    #[error("invalid workflow structure: {0}")]
    Schema(#[from] serde_yaml::Error),
}

/// A string value together with its source position, block-scalar
/// flag, and YAML back-pointer.
#[derive(Debug, Clone)]
pub struct StrValue {
    value: String,
    /// Where the value appears.
    pub position: Position,
    /// Whether the value was written as a `|` literal block.
    pub literal_block: bool,
    /// Back-pointer into the document.
    pub route: Route,
}

impl StrValue {
    /// Builds a synthesized value, e.g. for inputs inserted by an
    /// autofixer.
    pub(crate) fn new(value: impl Into<String>, position: Position, route: Route) -> Self {
        Self {
            value: value.into(),
            position,
            literal_block: false,
            route,
        }
    }

    /// The string value.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Replaces the value. Used by autofixers, which pair every call
    /// with a patch against [`StrValue::route`].
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    /// Whether the value contains a `${{ ... }}` expression.
    pub fn contains_expression(&self) -> bool {
        !utils::extract_expressions(&self.value).is_empty()
    }
}

impl std::ops::Deref for StrValue {
    type Target = str;

    fn deref(&self) -> &str {
        &self.value
    }
}

impl PartialEq for StrValue {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl PartialEq<str> for StrValue {
    fn eq(&self, other: &str) -> bool {
        self.value == other
    }
}

/// How the workflow's `on:` block was spelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStyle {
    /// `on: push`
    Bare,
    /// `on: [push, pull_request]`
    List,
    /// `on:` with per-event bodies.
    Detailed,
}

/// An event trigger.
#[derive(Debug)]
pub enum Event {
    /// An ordinary webhook event.
    Webhook(WebhookEvent),
    /// `schedule:`
    Schedule(ScheduleEvent),
    /// `workflow_dispatch:`
    WorkflowDispatch(WorkflowDispatchEvent),
    /// `workflow_call:`
    WorkflowCall(WorkflowCallEvent),
    /// `repository_dispatch:`
    RepositoryDispatch(RepositoryDispatchEvent),
}

impl Event {
    /// The event's trigger name as written.
    pub fn name(&self) -> &str {
        match self {
            Event::Webhook(e) => &e.hook,
            Event::Schedule(_) => "schedule",
            Event::WorkflowDispatch(_) => "workflow_dispatch",
            Event::WorkflowCall(_) => "workflow_call",
            Event::RepositoryDispatch(_) => "repository_dispatch",
        }
    }

    /// The event's source position.
    pub fn position(&self) -> Position {
        match self {
            Event::Webhook(e) => e.position,
            Event::Schedule(e) => e.position,
            Event::WorkflowDispatch(e) => e.position,
            Event::WorkflowCall(e) => e.position,
            Event::RepositoryDispatch(e) => e.position,
        }
    }
}

/// A webhook trigger with its activity types and filters.
#[derive(Debug)]
pub struct WebhookEvent {
    /// The hook name (`push`, `pull_request_target`, ...).
    pub hook: String,
    /// Activity types, empty when unspecified.
    pub types: Vec<String>,
    /// Whether a `types:` list was written out.
    pub types_specified: bool,
    /// `branches:` filters.
    pub branches: Vec<String>,
    /// `tags:` filters.
    pub tags: Vec<String>,
    /// `paths:` filters.
    pub paths: Vec<String>,
    /// The event's source position.
    pub position: Position,
    /// Back-pointer to the event entry.
    pub route: Route,
}

/// A `schedule:` trigger.
#[derive(Debug)]
pub struct ScheduleEvent {
    /// The cron lines.
    pub crons: Vec<String>,
    /// The event's source position.
    pub position: Position,
    /// Back-pointer to the event entry.
    pub route: Route,
}

/// A `workflow_dispatch:` trigger. Inputs stay unmodeled.
#[derive(Debug)]
pub struct WorkflowDispatchEvent {
    /// The event's source position.
    pub position: Position,
    /// Back-pointer to the event entry.
    pub route: Route,
}

/// A `workflow_call:` trigger. Inputs/secrets stay unmodeled.
#[derive(Debug)]
pub struct WorkflowCallEvent {
    /// The event's source position.
    pub position: Position,
    /// Back-pointer to the event entry.
    pub route: Route,
}

/// A `repository_dispatch:` trigger.
#[derive(Debug)]
pub struct RepositoryDispatchEvent {
    /// Activity types, empty when unspecified.
    pub types: Vec<String>,
    /// The event's source position.
    pub position: Position,
    /// Back-pointer to the event entry.
    pub route: Route,
}

/// `defaults.run` at workflow or job level.
#[derive(Debug, Default)]
pub struct Defaults {
    /// `defaults.run.shell`
    pub shell: Option<StrValue>,
    /// `defaults.run.working-directory`
    pub working_directory: Option<StrValue>,
}

/// An env block: either a whole-block expression or a mapping.
#[derive(Debug)]
pub enum Env {
    /// `env: ${{ ... }}` — unanalyzable.
    Expr(StrValue),
    /// A name → variable mapping, in source order.
    Vars(IndexMap<String, EnvVar>),
}

impl Env {
    /// The block's variables, when static.
    pub fn vars(&self) -> Option<&IndexMap<String, EnvVar>> {
        match self {
            Env::Expr(_) => None,
            Env::Vars(vars) => Some(vars),
        }
    }
}

/// A single environment variable.
#[derive(Debug)]
pub struct EnvVar {
    /// The variable name.
    pub name: String,
    /// The (stringified) value.
    pub value: StrValue,
}

/// A job's runner configuration.
#[derive(Debug)]
pub struct Runner {
    /// Static labels, when `runs-on` is a label or label list.
    pub labels: Vec<StrValue>,
    /// The single-expression form of `runs-on`.
    pub labels_expr: Option<StrValue>,
    /// A runner `group:`, independent of labels.
    pub group: Option<StrValue>,
    /// The `runs-on` position.
    pub position: Position,
    /// Back-pointer to the `runs-on` entry.
    pub route: Route,
}

/// A `strategy.matrix` block.
#[derive(Debug)]
pub struct Matrix {
    /// The matrix content.
    pub kind: MatrixKind,
    /// The matrix's source position.
    pub position: Position,
    /// Back-pointer to the matrix entry.
    pub route: Route,
}

/// Matrix content: a whole-matrix expression or per-axis rows.
#[derive(Debug)]
pub enum MatrixKind {
    /// `matrix: ${{ ... }}` — unanalyzable.
    Expr(StrValue),
    /// Axis name → row, in source order.
    Rows(IndexMap<String, MatrixRow>),
}

/// One matrix axis.
#[derive(Debug)]
pub struct MatrixRow {
    /// The axis content.
    pub kind: MatrixRowKind,
    /// Back-pointer to the axis entry.
    pub route: Route,
}

/// Matrix axis content.
#[derive(Debug)]
pub enum MatrixRowKind {
    /// `axis: ${{ ... }}` — unanalyzable.
    Expr(StrValue),
    /// The axis's raw YAML values.
    Values(Vec<serde_yaml::Value>),
}

/// A job's `environment:` setting.
#[derive(Debug)]
pub struct Environment {
    /// The environment name.
    pub name: Option<StrValue>,
    /// The environment URL, in the `{ name, url }` form.
    pub url: Option<StrValue>,
}

impl Environment {
    /// The environment name for display, or `(unnamed)`.
    pub fn display_name(&self) -> &str {
        self.name.as_ref().map(|n| n.as_str()).unwrap_or("(unnamed)")
    }
}

/// A `with:` input on an action step.
#[derive(Debug)]
pub struct Input {
    /// The input name.
    pub name: String,
    /// The (stringified) input value.
    pub value: StrValue,
}

/// What a step executes.
#[derive(Debug)]
pub enum Exec {
    /// An action invocation (`uses:` + `with:`).
    Action {
        /// The action reference.
        uses: StrValue,
        /// The `with:` block, in source order.
        inputs: IndexMap<String, Input>,
    },
    /// An inline script (`run:`).
    Run {
        /// The script text.
        script: StrValue,
        /// The step-level `shell:`.
        shell: Option<StrValue>,
        /// The step-level `working-directory:`.
        working_directory: Option<StrValue>,
    },
}

/// A single job step.
#[derive(Debug)]
pub struct Step {
    /// The step's index within its job.
    pub index: usize,
    /// The step's `id:`, if any.
    pub id: Option<String>,
    /// The step's `name:`, if any.
    pub name: Option<String>,
    /// The step's `if:` condition.
    pub cond: Option<StrValue>,
    /// What the step executes.
    pub exec: Exec,
    /// The step's env block.
    pub env: Option<Env>,
    /// The step's source position.
    pub position: Position,
    /// Back-pointer to the step entry.
    pub route: Route,
}

impl Step {
    /// The action reference, for action steps.
    pub fn uses(&self) -> Option<&StrValue> {
        match &self.exec {
            Exec::Action { uses, .. } => Some(uses),
            Exec::Run { .. } => None,
        }
    }

    /// The `with:` inputs, for action steps.
    pub fn inputs(&self) -> Option<&IndexMap<String, Input>> {
        match &self.exec {
            Exec::Action { inputs, .. } => Some(inputs),
            Exec::Run { .. } => None,
        }
    }

    /// A named `with:` input, for action steps.
    pub fn input(&self, name: &str) -> Option<&Input> {
        self.inputs().and_then(|inputs| inputs.get(name))
    }

    pub(crate) fn inputs_mut(&mut self) -> Option<&mut IndexMap<String, Input>> {
        match &mut self.exec {
            Exec::Action { inputs, .. } => Some(inputs),
            Exec::Run { .. } => None,
        }
    }

    /// The script, for run steps.
    pub fn run_script(&self) -> Option<&StrValue> {
        match &self.exec {
            Exec::Run { script, .. } => Some(script),
            Exec::Action { .. } => None,
        }
    }

    /// The step-level `shell:`, for run steps.
    pub fn shell(&self) -> Option<&StrValue> {
        match &self.exec {
            Exec::Run { shell, .. } => shell.as_ref(),
            Exec::Action { .. } => None,
        }
    }
}

/// A single job.
#[derive(Debug)]
pub struct Job {
    /// The job's id (its key in `jobs:`).
    pub id: StrValue,
    /// The job's `name:`, if any.
    pub name: Option<String>,
    /// The job's `if:` condition.
    pub cond: Option<StrValue>,
    /// The job's `needs:` entries, in source order.
    pub needs: Vec<StrValue>,
    /// The job's runner configuration.
    pub runs_on: Option<Runner>,
    /// The job's `environment:`.
    pub environment: Option<Environment>,
    /// The job's matrix, if it declares a strategy with one.
    pub matrix: Option<Matrix>,
    /// The job's env block.
    pub env: Option<Env>,
    /// The job's `defaults:`.
    pub defaults: Option<Defaults>,
    /// The job's permissions block.
    pub permissions: Option<Permissions>,
    /// The job's steps, in source order.
    pub steps: Vec<Step>,
    /// The reusable workflow reference for workflow-call jobs.
    pub workflow_call: Option<StrValue>,
    /// The job's source position.
    pub position: Position,
    /// Back-pointer to the job entry.
    pub route: Route,
}

/// A parsed workflow.
#[derive(Debug)]
pub struct Workflow {
    /// The path the workflow was loaded from, for reporting.
    pub path: String,
    /// The workflow's `name:`, if any.
    pub name: Option<String>,
    /// The event triggers, in source order.
    pub events: Vec<Event>,
    /// How the `on:` block was spelled.
    pub trigger_style: TriggerStyle,
    /// The workflow-level permissions block.
    pub permissions: Option<Permissions>,
    /// The workflow-level env block.
    pub env: Option<Env>,
    /// The workflow-level `defaults:`.
    pub defaults: Option<Defaults>,
    /// The jobs, keyed by id, in source order.
    pub jobs: IndexMap<String, Job>,
    /// The workflow's source position.
    pub position: Position,
    document: yamlspan::Document,
}

impl Workflow {
    /// Parses a workflow from YAML text.
    pub fn from_string(path: impl Into<String>, contents: &str) -> Result<Self, ParseError> {
        let document = yamlspan::Document::new(contents)?;
        let raw: raw::RawWorkflow = serde_yaml::from_str(contents)?;

        Ok(Builder { doc: &document }.build(path.into(), raw, document.clone()))
    }

    /// The underlying document.
    pub fn document(&self) -> &yamlspan::Document {
        &self.document
    }

    /// The workflow's source text.
    pub fn source(&self) -> &str {
        self.document.source()
    }

    /// The source position of the given route, resolved against the
    /// document (falling back to enclosing nodes when the route itself
    /// doesn't resolve).
    pub fn locate(&self, route: &Route) -> Position {
        position_of(&self.document, route)
    }

    /// The jobs, in source order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// A job by id.
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub(crate) fn job_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// The webhook events, in source order.
    pub fn webhooks(&self) -> impl Iterator<Item = &WebhookEvent> {
        self.events.iter().filter_map(|e| match e {
            Event::Webhook(hook) => Some(hook),
            _ => None,
        })
    }

    /// The named webhook event, if the workflow triggers on it.
    pub fn webhook(&self, hook: &str) -> Option<&WebhookEvent> {
        self.webhooks().find(|e| e.hook == hook)
    }

    /// Whether the workflow triggers on the named event.
    pub fn has_event(&self, name: &str) -> bool {
        self.events.iter().any(|e| e.name() == name)
    }

    /// Whether the workflow triggers on any of the named events.
    pub fn has_any_event(&self, names: &[&str]) -> bool {
        names.iter().any(|n| self.has_event(n))
    }
}

/// Resolves a route to a position, walking up through parents when the
/// route itself doesn't resolve (e.g. for synthesized nodes).
fn position_of(doc: &yamlspan::Document, route: &Route) -> Position {
    let mut route = route.clone();
    loop {
        match route.to_query() {
            Some(query) => {
                if let Ok(feature) = doc.query_pretty(&query) {
                    return Position::from_point(feature.location.point_span.0);
                }
                route = route.parent();
            }
            None => {
                return Position::from_point(doc.root().location.point_span.0);
            }
        }
    }
}

/// Assembles the typed AST from the raw layer, querying the document
/// for each node's position and scalar style.
struct Builder<'a> {
    doc: &'a yamlspan::Document,
}

impl Builder<'_> {
    fn build(&self, path: String, raw: raw::RawWorkflow, document: yamlspan::Document) -> Workflow {
        let (events, trigger_style) = self.events(raw.on);

        let jobs = raw
            .jobs
            .into_iter()
            .map(|(id, job)| {
                let built = self.job(&id, job);
                (id, built)
            })
            .collect();

        Workflow {
            path,
            name: raw.name,
            events,
            trigger_style,
            permissions: raw.permissions,
            env: raw
                .env
                .map(|env| self.env(env, Route::root().with_key("env"))),
            defaults: raw.defaults.map(|d| self.defaults(d, Route::root())),
            jobs,
            position: Position::from_point(self.doc.root().location.point_span.0),
            document,
        }
    }

    fn str_value(&self, value: impl Into<String>, route: Route) -> StrValue {
        let literal_block = route
            .to_query()
            .and_then(|q| self.doc.query_exact(&q).ok().flatten())
            .map(|f| self.doc.feature_kind(&f) == yamlspan::FeatureKind::LiteralScalar)
            .unwrap_or(false);

        StrValue {
            value: value.into(),
            position: position_of(self.doc, &route),
            literal_block,
            route,
        }
    }

    fn events(&self, trigger: raw::RawTrigger) -> (Vec<Event>, TriggerStyle) {
        match trigger {
            raw::RawTrigger::Bare(name) => {
                let route = Route::root().with_key("on");
                (vec![self.event(&name, None, route)], TriggerStyle::Bare)
            }
            raw::RawTrigger::Multiple(names) => {
                let events = names
                    .iter()
                    .enumerate()
                    .map(|(idx, name)| {
                        self.event(name, None, Route::root().with_key("on").with_index(idx))
                    })
                    .collect();
                (events, TriggerStyle::List)
            }
            raw::RawTrigger::Detailed(bodies) => {
                let events = bodies
                    .into_iter()
                    .map(|(name, body)| {
                        let route = Route::root().with_key("on").with_key(name.as_str());
                        self.event(&name, Some(body), route)
                    })
                    .collect();
                (events, TriggerStyle::Detailed)
            }
        }
    }

    fn event(&self, name: &str, body: Option<serde_yaml::Value>, route: Route) -> Event {
        let position = position_of(self.doc, &route);

        match name {
            "schedule" => {
                let crons = body
                    .and_then(|b| serde_yaml::from_value::<Vec<raw::RawScheduleEntry>>(b).ok())
                    .map(|entries| entries.into_iter().map(|e| e.cron).collect())
                    .unwrap_or_default();
                Event::Schedule(ScheduleEvent {
                    crons,
                    position,
                    route,
                })
            }
            "workflow_dispatch" => Event::WorkflowDispatch(WorkflowDispatchEvent { position, route }),
            "workflow_call" => Event::WorkflowCall(WorkflowCallEvent { position, route }),
            "repository_dispatch" => {
                let types = self.webhook_body(body).0;
                Event::RepositoryDispatch(RepositoryDispatchEvent {
                    types,
                    position,
                    route,
                })
            }
            _ => {
                let (types, types_specified, branches, tags, paths) = {
                    let (types, body) = self.webhook_body(body);
                    (
                        types,
                        body.as_ref().map(|b| b.types.is_some()).unwrap_or(false),
                        body.as_ref()
                            .and_then(|b| b.branches.as_ref())
                            .map(|v| Vec::from(clone_sov(v)))
                            .unwrap_or_default(),
                        body.as_ref()
                            .and_then(|b| b.tags.as_ref())
                            .map(|v| Vec::from(clone_sov(v)))
                            .unwrap_or_default(),
                        body.as_ref()
                            .and_then(|b| b.paths.as_ref())
                            .map(|v| Vec::from(clone_sov(v)))
                            .unwrap_or_default(),
                    )
                };

                Event::Webhook(WebhookEvent {
                    hook: name.to_string(),
                    types,
                    types_specified,
                    branches,
                    tags,
                    paths,
                    position,
                    route,
                })
            }
        }
    }

    /// Parses a webhook event body, tolerating absent and null bodies.
    fn webhook_body(
        &self,
        body: Option<serde_yaml::Value>,
    ) -> (Vec<String>, Option<raw::RawWebhookBody>) {
        let parsed = body.and_then(|b| serde_yaml::from_value::<raw::RawWebhookBody>(b).ok());
        let types = parsed
            .as_ref()
            .and_then(|b| b.types.clone())
            .unwrap_or_default();
        (types, parsed)
    }

    fn job(&self, id: &str, raw: raw::RawJob) -> Job {
        let route = Route::root().with_key("jobs").with_key(id);

        let needs = match raw.needs {
            None => vec![],
            Some(raw::SoV::One(n)) => vec![self.str_value(n, route.with_key("needs"))],
            Some(raw::SoV::Many(ns)) => ns
                .into_iter()
                .enumerate()
                .map(|(idx, n)| self.str_value(n, route.with_key("needs").with_index(idx)))
                .collect(),
        };

        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(idx, step)| self.step(idx, step, route.with_key("steps").with_index(idx)))
            .collect();

        Job {
            id: self.str_value(id, route.clone()),
            name: raw.name,
            cond: raw
                .cond
                .map(|c| self.str_value(c.into_string(), route.with_key("if"))),
            needs,
            runs_on: raw.runs_on.map(|r| self.runner(r, route.with_key("runs-on"))),
            environment: raw
                .environment
                .map(|e| self.environment(e, route.with_key("environment"))),
            matrix: raw.strategy.and_then(|s| {
                s.matrix.map(|m| {
                    self.matrix(m, route.with_key("strategy").with_key("matrix"))
                })
            }),
            env: raw.env.map(|e| self.env(e, route.with_key("env"))),
            defaults: raw.defaults.map(|d| self.defaults(d, route.clone())),
            permissions: raw.permissions,
            workflow_call: raw.uses.map(|u| self.str_value(u, route.with_key("uses"))),
            position: position_of(self.doc, &route),
            route,
            steps,
        }
    }

    fn runner(&self, raw: raw::RawRunsOn, route: Route) -> Runner {
        let position = position_of(self.doc, &route);

        match raw {
            raw::RawRunsOn::Target(raw::SoV::One(label)) => {
                if flowlint_exprs::ExplicitExpr::from_curly(label.as_str()).is_some() {
                    Runner {
                        labels: vec![],
                        labels_expr: Some(self.str_value(label, route.clone())),
                        group: None,
                        position,
                        route,
                    }
                } else {
                    Runner {
                        labels: vec![self.str_value(label, route.clone())],
                        labels_expr: None,
                        group: None,
                        position,
                        route,
                    }
                }
            }
            raw::RawRunsOn::Target(raw::SoV::Many(labels)) => Runner {
                labels: labels
                    .into_iter()
                    .enumerate()
                    .map(|(idx, l)| self.str_value(l, route.with_index(idx)))
                    .collect(),
                labels_expr: None,
                group: None,
                position,
                route,
            },
            raw::RawRunsOn::Group { group, labels } => Runner {
                labels: match labels {
                    None => vec![],
                    Some(raw::SoV::One(l)) => {
                        vec![self.str_value(l, route.with_key("labels"))]
                    }
                    Some(raw::SoV::Many(ls)) => ls
                        .into_iter()
                        .enumerate()
                        .map(|(idx, l)| self.str_value(l, route.with_key("labels").with_index(idx)))
                        .collect(),
                },
                labels_expr: None,
                group: group.map(|g| self.str_value(g, route.with_key("group"))),
                position,
                route,
            },
        }
    }

    fn environment(&self, raw: raw::RawEnvironment, route: Route) -> Environment {
        match raw {
            raw::RawEnvironment::Name(name) => Environment {
                name: Some(self.str_value(name, route)),
                url: None,
            },
            raw::RawEnvironment::Detailed { name, url } => Environment {
                name: name.map(|n| self.str_value(n, route.with_key("name"))),
                url: url.map(|u| self.str_value(u, route.with_key("url"))),
            },
        }
    }

    fn matrix(&self, raw: raw::LoE<IndexMap<String, serde_yaml::Value>>, route: Route) -> Matrix {
        let position = position_of(self.doc, &route);

        let kind = match raw {
            raw::LoE::Expr(expr) => MatrixKind::Expr(self.str_value(expr.0, route.clone())),
            raw::LoE::Literal(axes) => MatrixKind::Rows(
                axes.into_iter()
                    .map(|(axis, value)| {
                        let row_route = route.with_key(axis.as_str());
                        let kind = match value {
                            serde_yaml::Value::String(s)
                                if flowlint_exprs::ExplicitExpr::from_curly(s.as_str())
                                    .is_some() =>
                            {
                                MatrixRowKind::Expr(self.str_value(s, row_route.clone()))
                            }
                            serde_yaml::Value::Sequence(values) => MatrixRowKind::Values(values),
                            other => MatrixRowKind::Values(vec![other]),
                        };
                        (
                            axis,
                            MatrixRow {
                                kind,
                                route: row_route,
                            },
                        )
                    })
                    .collect(),
            ),
        };

        Matrix {
            kind,
            position,
            route,
        }
    }

    fn env(&self, raw: raw::LoE<IndexMap<String, raw::EnvValue>>, route: Route) -> Env {
        match raw {
            raw::LoE::Expr(expr) => Env::Expr(self.str_value(expr.0, route)),
            raw::LoE::Literal(vars) => Env::Vars(
                vars.into_iter()
                    .map(|(name, value)| {
                        let var_route = route.with_key(name.as_str());
                        let var = EnvVar {
                            name: name.clone(),
                            value: self.str_value(value.to_string(), var_route),
                        };
                        (name, var)
                    })
                    .collect(),
            ),
        }
    }

    fn defaults(&self, raw: raw::RawDefaults, parent: Route) -> Defaults {
        let run_route = parent.with_key("defaults").with_key("run");
        let run = raw.run.unwrap_or_default();

        Defaults {
            shell: run
                .shell
                .map(|s| self.str_value(s, run_route.with_key("shell"))),
            working_directory: run
                .working_directory
                .map(|w| self.str_value(w, run_route.with_key("working-directory"))),
        }
    }

    fn step(&self, index: usize, raw: raw::RawStep, route: Route) -> Step {
        let exec = match raw.body {
            raw::RawStepBody::Uses { uses, with } => Exec::Action {
                uses: self.str_value(uses, route.with_key("uses")),
                inputs: with
                    .into_iter()
                    .map(|(name, value)| {
                        let input_route = route.with_key("with").with_key(name.as_str());
                        let input = Input {
                            name: name.clone(),
                            value: self.str_value(value.to_string(), input_route),
                        };
                        (name, input)
                    })
                    .collect(),
            },
            raw::RawStepBody::Run {
                run,
                shell,
                working_directory,
            } => Exec::Run {
                script: self.str_value(run, route.with_key("run")),
                shell: shell.map(|s| self.str_value(s, route.with_key("shell"))),
                working_directory: working_directory
                    .map(|w| self.str_value(w, route.with_key("working-directory"))),
            },
        };

        Step {
            index,
            id: raw.id,
            name: raw.name,
            cond: raw
                .cond
                .map(|c| self.str_value(c.into_string(), route.with_key("if"))),
            exec,
            env: raw.env.map(|e| self.env(e, route.with_key("env"))),
            position: position_of(self.doc, &route),
            route,
        }
    }
}

fn clone_sov(sov: &raw::SoV<String>) -> raw::SoV<String> {
    match sov {
        raw::SoV::One(s) => raw::SoV::One(s.clone()),
        raw::SoV::Many(v) => raw::SoV::Many(v.clone()),
    }
}
