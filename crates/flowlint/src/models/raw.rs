//! The raw deserialization layer for workflow YAML.
//!
//! These types mirror the workflow schema closely enough to deserialize
//! real-world files; the typed AST in the parent module is assembled
//! from them. Unknown keys are ignored throughout.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RawWorkflow {
    #[serde(default)]
    pub(crate) name: Option<String>,
    pub(crate) on: RawTrigger,
    #[serde(default)]
    pub(crate) permissions: Option<Permissions>,
    #[serde(default)]
    pub(crate) env: Option<LoE<IndexMap<String, EnvValue>>>,
    #[serde(default)]
    pub(crate) defaults: Option<RawDefaults>,
    pub(crate) jobs: IndexMap<String, RawJob>,
}

/// The three spellings of the `on:` block.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub(crate) enum RawTrigger {
    /// `on: push`
    Bare(String),
    /// `on: [push, pull_request]`
    Multiple(Vec<String>),
    /// `on: { push: {...}, ... }`. Bodies stay opaque here; the glue
    /// interprets them per event kind.
    Detailed(IndexMap<String, serde_yaml::Value>),
}

/// A webhook event body (`types` plus the branch/tag/path filters the
/// analyzer consumes; the `-ignore` variants are not modeled).
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RawWebhookBody {
    #[serde(default)]
    pub(crate) types: Option<Vec<String>>,
    #[serde(default)]
    pub(crate) branches: Option<SoV<String>>,
    #[serde(default)]
    pub(crate) tags: Option<SoV<String>>,
    #[serde(default)]
    pub(crate) paths: Option<SoV<String>>,
}

/// A `schedule:` entry.
#[derive(Deserialize, Debug)]
pub(crate) struct RawScheduleEntry {
    pub(crate) cron: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RawJob {
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default, rename = "if")]
    pub(crate) cond: Option<If>,
    #[serde(default)]
    pub(crate) needs: Option<SoV<String>>,
    #[serde(default)]
    pub(crate) runs_on: Option<RawRunsOn>,
    #[serde(default)]
    pub(crate) environment: Option<RawEnvironment>,
    #[serde(default)]
    pub(crate) strategy: Option<RawStrategy>,
    #[serde(default)]
    pub(crate) env: Option<LoE<IndexMap<String, EnvValue>>>,
    #[serde(default)]
    pub(crate) defaults: Option<RawDefaults>,
    #[serde(default)]
    pub(crate) permissions: Option<Permissions>,
    #[serde(default)]
    pub(crate) steps: Vec<RawStep>,
    /// Reusable workflow reference for workflow-call jobs.
    #[serde(default)]
    pub(crate) uses: Option<String>,
}

/// The forms of `runs-on:`.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub(crate) enum RawRunsOn {
    /// A label or list of labels (possibly an expression).
    Target(SoV<String>),
    /// The `group:`/`labels:` form.
    Group {
        #[serde(default)]
        group: Option<String>,
        #[serde(default)]
        labels: Option<SoV<String>>,
    },
}

/// `environment:` as a bare name or a `{ name, url }` block.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub(crate) enum RawEnvironment {
    Name(String),
    Detailed {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        url: Option<String>,
    },
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RawStrategy {
    #[serde(default)]
    pub(crate) matrix: Option<LoE<IndexMap<String, serde_yaml::Value>>>,
}

/// `defaults:` — only the `run:` block matters to the analyzer.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RawDefaults {
    #[serde(default)]
    pub(crate) run: Option<RawRunDefaults>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RawRunDefaults {
    #[serde(default)]
    pub(crate) shell: Option<String>,
    #[serde(default)]
    pub(crate) working_directory: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RawStep {
    #[serde(default)]
    pub(crate) id: Option<String>,
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default, rename = "if")]
    pub(crate) cond: Option<If>,
    #[serde(default)]
    pub(crate) env: Option<LoE<IndexMap<String, EnvValue>>>,
    #[serde(flatten)]
    pub(crate) body: RawStepBody,
}

/// A step runs exactly one of `uses:` or `run:`.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub(crate) enum RawStepBody {
    Uses {
        uses: String,
        #[serde(default)]
        with: IndexMap<String, EnvValue>,
    },
    #[serde(rename_all = "kebab-case")]
    Run {
        #[serde(deserialize_with = "bool_is_string")]
        run: String,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        working_directory: Option<String>,
    },
}

/// `permissions` for a workflow or job.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", untagged)]
pub enum Permissions {
    /// Blanket permissions.
    Base(BasePermission),
    /// Fine-grained scope → level mapping, kept open-ended so all
    /// defined scopes iterate.
    Explicit(IndexMap<String, Permission>),
}

impl Default for Permissions {
    fn default() -> Self {
        Self::Base(BasePermission::Default)
    }
}

/// Blanket permission settings.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum BasePermission {
    /// Whatever the workflow's token defaults to.
    #[default]
    Default,
    /// Read access to all scopes.
    ReadAll,
    /// Write access to all scopes.
    WriteAll,
}

/// A single permission level.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    Read,
    Write,
    #[default]
    None,
}

/// Environment variable values are stringified by the runner, but YAML
/// authors write them as native scalars.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub(crate) enum EnvValue {
    // Missing values are empty strings.
    #[serde(deserialize_with = "null_to_default")]
    String(String),
    Number(f64),
    Boolean(bool),
}

impl fmt::Display for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// A "literal or expression" value: either a native `T` or a whole
/// `${{ ... }}` string.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub(crate) enum LoE<T> {
    Expr(CurlyExpr),
    Literal(T),
}

/// A string that is, in its entirety, a `${{ ... }}` expression.
#[derive(Debug, PartialEq)]
pub(crate) struct CurlyExpr(pub(crate) String);

impl<'de> Deserialize<'de> for CurlyExpr {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(de)?;
        if flowlint_exprs::ExplicitExpr::from_curly(raw.as_str()).is_some() {
            Ok(CurlyExpr(raw))
        } else {
            Err(serde::de::Error::custom("not a whole-string expression"))
        }
    }
}

/// Scalar-or-vector, for keys that accept one value or a list.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub(crate) enum SoV<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<SoV<T>> for Vec<T> {
    fn from(val: SoV<T>) -> Vec<T> {
        match val {
            SoV::One(v) => vec![v],
            SoV::Many(vs) => vs,
        }
    }
}

/// An `if:` condition; either a YAML boolean or an expression string.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub(crate) enum If {
    Bool(bool),
    Expr(String),
}

impl If {
    /// The condition as the string the runner would see.
    pub(crate) fn into_string(self) -> String {
        match self {
            If::Bool(b) => b.to_string(),
            If::Expr(e) => e,
        }
    }
}

/// Bool-or-string, for `run: true` style reinterpretations.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum BoS {
    Bool(bool),
    String(String),
}

fn bool_is_string<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match BoS::deserialize(de)? {
        BoS::Bool(b) => b.to_string(),
        BoS::String(s) => s,
    })
}

fn null_to_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let value = Option::<T>::deserialize(de)?;
    Ok(value.unwrap_or_default())
}
