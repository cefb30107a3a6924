//! Span-exact YAML path queries.
//!
//! `yamlspan` answers "where is `jobs.build.steps[2].uses` in this
//! document?" with the exact source span of that feature, leaving the
//! document text (including comments and formatting) untouched. It is
//! the positioning layer underneath flowlint's AST and patch engine;
//! it is deliberately **not** a generic object query language.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use thiserror::Error;
use tree_sitter::{Language, Node, Parser, Tree};

/// Errors produced while resolving a [`Query`] against a [`Document`].
#[derive(Error, Debug)]
pub enum QueryError {
    /// The tree-sitter backend rejected the YAML grammar.
    #[error("malformed or unsupported tree-sitter grammar")]
    InvalidLanguage(#[from] tree_sitter::LanguageError),
    /// The input is not valid YAML.
    #[error("input is not valid YAML")]
    InvalidInput,
    /// A key component was applied to something that isn't a mapping.
    #[error("expected mapping containing key `{0}`")]
    ExpectedMapping(String),
    /// An index component was applied to something that isn't a sequence.
    #[error("expected sequence for index `[{0}]`")]
    ExpectedSequence(usize),
    /// The mapping exists but doesn't contain the requested key.
    #[error("mapping has no key `{0}`")]
    MissingKey(String),
    /// The sequence exists but is shorter than the requested index.
    #[error("index `[{0}]` exceeds sequence size ({1})")]
    MissingIndex(usize, usize),
    /// The syntax tree wasn't shaped the way the query walker expects.
    #[error("unexpected node: `{0}`")]
    UnexpectedNode(String),
    /// A syntax node is missing a child the walker relies on.
    #[error("syntax node `{0}` is missing expected child `{1}`")]
    MissingChild(String, &'static str),
}

/// A single step of a [`Query`]: descend through a mapping key or a
/// sequence index.
#[derive(Clone, Debug, PartialEq)]
pub enum Component<'a> {
    /// A mapping key.
    Key(&'a str),
    /// A sequence index.
    Index(usize),
}

/// A top-down path into a YAML document.
///
/// For example, in
///
/// ```yaml
/// jobs:
///   build:
///     steps:
///       - uses: actions/checkout@v4
/// ```
///
/// the `uses` value is addressed by
/// `[Key("jobs"), Key("build"), Key("steps"), Index(0), Key("uses")]`.
#[derive(Clone, Debug)]
pub struct Query<'a> {
    components: Vec<Component<'a>>,
}

impl<'a> Query<'a> {
    /// Builds a query from the given components.
    ///
    /// Returns `None` for an empty component list; the document root is
    /// addressed with [`Document::root`] instead.
    pub fn new(components: Vec<Component<'a>>) -> Option<Self> {
        if components.is_empty() {
            None
        } else {
            Some(Self { components })
        }
    }

    /// The query's components, top-down.
    pub fn components(&self) -> &[Component<'a>] {
        &self.components
    }

    /// Returns the query for this query's parent, or `None` at the top.
    pub fn parent(&self) -> Option<Self> {
        let mut components = self.components.clone();
        components.pop();
        Self::new(components)
    }
}

/// The concrete source location of a feature.
#[derive(Debug, Clone, Copy)]
pub struct Location {
    /// Byte span, end-exclusive.
    pub byte_span: (usize, usize),
    /// `((start_row, start_col), (end_row, end_col))`, zero-based.
    pub point_span: ((usize, usize), (usize, usize)),
}

impl From<Node<'_>> for Location {
    fn from(node: Node<'_>) -> Self {
        let start = node.start_position();
        let end = node.end_position();
        Self {
            byte_span: (node.start_byte(), node.end_byte()),
            point_span: ((start.row, start.column), (end.row, end.column)),
        }
    }
}

/// The syntactic shape of a queried feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    /// `foo: bar` style mapping.
    BlockMapping,
    /// `- foo` style sequence.
    BlockSequence,
    /// `{foo: bar}` style mapping.
    FlowMapping,
    /// `[foo, bar]` style sequence.
    FlowSequence,
    /// A plain scalar value.
    Scalar,
    /// A `|` literal block scalar.
    LiteralScalar,
    /// A `>` folded block scalar.
    FoldedScalar,
}

/// A successfully resolved query result.
#[derive(Debug)]
pub struct Feature<'tree> {
    node: Node<'tree>,
    /// The exact location of the feature.
    pub location: Location,
}

impl<'tree> From<Node<'tree>> for Feature<'tree> {
    fn from(node: Node<'tree>) -> Self {
        Feature {
            node,
            location: Location::from(node),
        }
    }
}

/// How much surrounding syntax a query result should capture.
#[derive(Copy, Clone, Debug)]
enum QueryMode {
    /// Capture the span a human would point at: for key-terminated
    /// queries, the whole `key: value` pair.
    Pretty,
    /// Capture only the exact span of the resolved value.
    Exact,
}

/// A parsed, queryable YAML document.
#[derive(Clone, Debug)]
pub struct Document {
    source: String,
    tree: Tree,
    document_id: u16,
    block_node_id: u16,
    flow_node_id: u16,
    block_sequence_id: u16,
    flow_sequence_id: u16,
    block_mapping_id: u16,
    flow_mapping_id: u16,
    block_mapping_pair_id: u16,
    flow_pair_id: u16,
    block_sequence_item_id: u16,
}

impl Document {
    /// Parses the given YAML source into a queryable document.
    pub fn new(source: impl Into<String>) -> Result<Self, QueryError> {
        let source = source.into();

        let mut parser = Parser::new();
        let language: Language = tree_sitter_yaml::LANGUAGE.into();
        parser.set_language(&language)?;

        // Infallible given a well-constructed language above.
        let tree = parser.parse(&source, None).unwrap();
        if tree.root_node().has_error() {
            return Err(QueryError::InvalidInput);
        }

        Ok(Self {
            source,
            tree,
            document_id: language.id_for_node_kind("document", true),
            block_node_id: language.id_for_node_kind("block_node", true),
            flow_node_id: language.id_for_node_kind("flow_node", true),
            block_sequence_id: language.id_for_node_kind("block_sequence", true),
            flow_sequence_id: language.id_for_node_kind("flow_sequence", true),
            block_mapping_id: language.id_for_node_kind("block_mapping", true),
            flow_mapping_id: language.id_for_node_kind("flow_mapping", true),
            block_mapping_pair_id: language.id_for_node_kind("block_mapping_pair", true),
            flow_pair_id: language.id_for_node_kind("flow_pair", true),
            block_sequence_item_id: language.id_for_node_kind("block_sequence_item", true),
        })
    }

    /// The original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// A feature spanning the whole document.
    pub fn root(&self) -> Feature<'_> {
        self.tree.root_node().into()
    }

    /// Whether the query resolves to an existing feature.
    pub fn query_exists(&self, query: &Query) -> bool {
        self.query_node(query, QueryMode::Exact).is_ok()
    }

    /// Resolves a query to its "pretty" span: for key-terminated queries
    /// this includes the key itself (`foo: bar` rather than `bar`).
    pub fn query_pretty(&self, query: &Query) -> Result<Feature<'_>, QueryError> {
        self.query_node(query, QueryMode::Pretty).map(Into::into)
    }

    /// Resolves a query to its exact value span. Returns `Ok(None)` when
    /// the query resolves to a key with an absent value (`foo:`).
    pub fn query_exact(&self, query: &Query) -> Result<Option<Feature<'_>>, QueryError> {
        let node = self.query_node(query, QueryMode::Exact)?;

        if node.kind_id() == self.block_mapping_pair_id || node.kind_id() == self.flow_pair_id {
            // Landing on the pair itself means the key has no value.
            Ok(None)
        } else {
            Ok(Some(node.into()))
        }
    }

    /// The source text of the given feature, exact span only.
    pub fn extract(&self, feature: &Feature) -> &str {
        &self.source[feature.location.byte_span.0..feature.location.byte_span.1]
    }

    /// The source text of the given feature, including any leading
    /// indentation whitespace on its first line.
    pub fn extract_with_leading_whitespace<'a>(&'a self, feature: &Feature) -> &'a str {
        let mut start = feature.location.byte_span.0;
        if let Some(newline) = self.source[..start].rfind('\n') {
            if self.source[newline + 1..start].bytes().all(|b| b == b' ') {
                start = newline + 1;
            }
        }

        &self.source[start..feature.location.byte_span.1]
    }

    /// Classifies the syntactic shape of a feature.
    pub fn feature_kind(&self, feature: &Feature) -> FeatureKind {
        // Unwrap the block_node/flow_node container when present.
        let node = match feature.node.kind() {
            "block_node" | "flow_node" => feature.node.child(0).unwrap(),
            _ => feature.node,
        };

        match node.kind() {
            "block_mapping" => FeatureKind::BlockMapping,
            "block_sequence" => FeatureKind::BlockSequence,
            "flow_mapping" => FeatureKind::FlowMapping,
            "flow_sequence" => FeatureKind::FlowSequence,
            "block_scalar" => {
                let text = self.extract(feature);
                match text.trim_start().as_bytes().first() {
                    Some(b'>') => FeatureKind::FoldedScalar,
                    _ => FeatureKind::LiteralScalar,
                }
            }
            _ => FeatureKind::Scalar,
        }
    }

    /// The topmost semantic object: the first block or flow node under
    /// the document body, skipping leading comments and directives.
    fn top_object(&self) -> Result<Node<'_>, QueryError> {
        let stream = self.tree.root_node();
        let mut cur = stream.walk();

        let document = stream
            .named_children(&mut cur)
            .find(|c| c.kind_id() == self.document_id)
            .ok_or(QueryError::MissingChild("stream".into(), "document"))?;

        let result = document
            .named_children(&mut cur)
            .find(|c| c.kind_id() == self.block_node_id || c.kind_id() == self.flow_node_id)
            .ok_or(QueryError::MissingChild("document".into(), "block_node"));
        result
    }

    fn query_node(&self, query: &Query, mode: QueryMode) -> Result<Node<'_>, QueryError> {
        let mut focus = self.top_object()?;
        for component in query.components() {
            focus = self.descend(&focus, component)?;
        }

        if matches!(mode, QueryMode::Pretty)
            && matches!(query.components().last(), Some(Component::Key(_)))
            && focus.kind_id() != self.block_mapping_pair_id
            && focus.kind_id() != self.flow_pair_id
        {
            // Climb back up to the enclosing pair so the caller sees
            // `key: value` rather than the bare value.
            focus = focus.parent().unwrap();
        }

        Ok(focus)
    }

    fn descend<'b>(&self, node: &Node<'b>, component: &Component) -> Result<Node<'b>, QueryError> {
        // Descent always starts on a block_node/flow_node wrapper whose
        // single child is the aggregate we descend through.
        let child = node.child(0).unwrap();

        if child.kind_id() == self.block_mapping_id || child.kind_id() == self.flow_mapping_id {
            match component {
                Component::Key(key) => self.descend_mapping(&child, key),
                Component::Index(idx) => Err(QueryError::ExpectedSequence(*idx)),
            }
        } else if child.kind_id() == self.block_sequence_id
            || child.kind_id() == self.flow_sequence_id
        {
            match component {
                Component::Index(idx) => self.descend_sequence(&child, *idx),
                Component::Key(key) => Err(QueryError::ExpectedMapping(key.to_string())),
            }
        } else {
            Err(QueryError::UnexpectedNode(child.kind().into()))
        }
    }

    fn descend_mapping<'b>(&self, node: &Node<'b>, expected: &str) -> Result<Node<'b>, QueryError> {
        let mut cur = node.walk();
        for child in node.named_children(&mut cur) {
            let key = if child.kind_id() == self.flow_pair_id
                || child.kind_id() == self.block_mapping_pair_id
            {
                child
                    .child_by_field_name("key")
                    .ok_or(QueryError::MissingChild("pair".into(), "key"))?
            } else if child.kind_id() == self.flow_node_id {
                // `{ foo }` produces a bare flow_node instead of a pair.
                child
            } else {
                continue;
            };

            // Keys can be quoted; compare on the unquoted value.
            let key_value = match key.named_child(0) {
                Some(scalar) => {
                    let text = scalar.utf8_text(self.source.as_bytes()).unwrap();
                    match scalar.kind() {
                        "single_quote_scalar" | "double_quote_scalar" => {
                            let mut chars = text.chars();
                            chars.next();
                            chars.next_back();
                            chars.as_str()
                        }
                        _ => text,
                    }
                }
                None => key.utf8_text(self.source.as_bytes()).unwrap(),
            };

            if key_value == expected {
                // A key without a value terminates on the pair itself.
                return Ok(child.child_by_field_name("value").unwrap_or(child));
            }
        }

        Err(QueryError::MissingKey(expected.into()))
    }

    fn descend_sequence<'b>(&self, node: &Node<'b>, idx: usize) -> Result<Node<'b>, QueryError> {
        let mut cur = node.walk();
        let children = node
            .named_children(&mut cur)
            .filter(|n| {
                n.kind_id() == self.block_sequence_item_id
                    || n.kind_id() == self.flow_node_id
                    || n.kind_id() == self.flow_pair_id
            })
            .collect::<Vec<_>>();

        let Some(child) = children.get(idx) else {
            return Err(QueryError::MissingIndex(idx, children.len()));
        };

        if child.kind_id() == self.block_sequence_item_id {
            // Skip over the `- ` wrapper; comments may intercede.
            child
                .named_children(&mut cur)
                .find(|c| c.kind_id() == self.block_node_id || c.kind_id() == self.flow_node_id)
                .ok_or(QueryError::MissingChild(
                    "block_sequence_item".into(),
                    "block_node",
                ))
        } else if child.kind_id() == self.flow_pair_id {
            Ok(child.child_by_field_name("value").unwrap_or(*child))
        } else {
            Ok(*child)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{Component, Document, FeatureKind, Query};

    fn query<'a>(components: Vec<Component<'a>>) -> Query<'a> {
        Query::new(components).unwrap()
    }

    #[test]
    fn test_query_parent() {
        let q = query(vec![
            Component::Key("foo"),
            Component::Key("bar"),
            Component::Index(3),
        ]);

        assert_eq!(
            q.parent().unwrap().components(),
            &[Component::Key("foo"), Component::Key("bar")]
        );

        let q = query(vec![Component::Key("foo")]);
        assert!(q.parent().is_none());
    }

    #[test]
    fn test_basic_descent() {
        let doc = Document::new(
            r#"
foo: bar
baz:
  sub:
    - 123
    - [a, b, {c: d}]
"#,
        )
        .unwrap();

        let q = query(vec![
            Component::Key("baz"),
            Component::Key("sub"),
            Component::Index(1),
            Component::Index(2),
        ]);

        let feature = doc.query_pretty(&q).unwrap();
        assert_eq!(doc.extract(&feature), "{c: d}");
    }

    #[test]
    fn test_pretty_includes_key() {
        let doc = Document::new("foo:\n  bar: baz\n").unwrap();

        let q = query(vec![Component::Key("foo"), Component::Key("bar")]);
        let feature = doc.query_pretty(&q).unwrap();
        assert_eq!(doc.extract(&feature), "bar: baz");

        let exact = doc.query_exact(&q).unwrap().unwrap();
        assert_eq!(doc.extract(&exact), "baz");
    }

    #[test]
    fn test_absent_value() {
        let doc = Document::new("foo:\nbar: baz\n").unwrap();

        let q = query(vec![Component::Key("foo")]);
        assert!(doc.query_exact(&q).unwrap().is_none());
    }

    #[test]
    fn test_missing_key_errors() {
        let doc = Document::new("foo: bar\n").unwrap();

        let q = query(vec![Component::Key("quux")]);
        assert!(doc.query_pretty(&q).is_err());
        assert!(!doc.query_exists(&q));
    }

    #[test]
    fn test_quoted_keys() {
        let doc = Document::new("\"foo\": 1\n'bar': 2\n").unwrap();

        for key in ["foo", "bar"] {
            let q = query(vec![Component::Key(key)]);
            assert!(doc.query_exists(&q), "missing quoted key {key}");
        }
    }

    #[test]
    fn test_leading_whitespace_extraction() {
        let doc = Document::new("foo:\n  bar:\n    baz: quux\n").unwrap();

        let q = query(vec![Component::Key("foo"), Component::Key("bar")]);
        let feature = doc.query_pretty(&q).unwrap();
        assert_eq!(
            doc.extract_with_leading_whitespace(&feature),
            "  bar:\n    baz: quux"
        );
    }

    #[test]
    fn test_feature_kinds() {
        let doc = Document::new(
            r#"
block-map:
  a: b
block-seq:
  - a
flow-map: {a: b}
flow-seq: [a, b]
plain: abc
literal: |
  line
folded: >
  line
"#,
        )
        .unwrap();

        for (key, kind) in [
            ("block-map", FeatureKind::BlockMapping),
            ("block-seq", FeatureKind::BlockSequence),
            ("flow-map", FeatureKind::FlowMapping),
            ("flow-seq", FeatureKind::FlowSequence),
            ("plain", FeatureKind::Scalar),
            ("literal", FeatureKind::LiteralScalar),
            ("folded", FeatureKind::FoldedScalar),
        ] {
            let q = query(vec![Component::Key(key)]);
            let feature = doc.query_exact(&q).unwrap().unwrap();
            assert_eq!(doc.feature_kind(&feature), kind, "kind mismatch for {key}");
        }
    }

    #[test]
    fn test_point_spans_are_zero_based() {
        let doc = Document::new("foo: bar\nbaz: quux\n").unwrap();

        let q = query(vec![Component::Key("baz")]);
        let feature = doc.query_pretty(&q).unwrap();
        assert_eq!(feature.location.point_span.0, (1, 0));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(Document::new("foo: [unclosed\n").is_err());
    }
}
