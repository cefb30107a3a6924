//! Source positions and YAML back-pointer routes.

use std::fmt;

/// A 1-based line/column position in a workflow file.
///
/// Every AST node carries one; findings report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub col: usize,
}

impl Position {
    pub(crate) fn new(line: usize, col: usize) -> Self {
        Self { line, col }
    }

    /// Converts a zero-based tree-sitter point to a 1-based position.
    pub(crate) fn from_point(point: (usize, usize)) -> Self {
        Self {
            line: point.0 + 1,
            col: point.1 + 1,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self { line: 1, col: 1 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// One step of a [`Route`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteComponent {
    /// A mapping key.
    Key(String),
    /// A sequence index.
    Index(usize),
}

impl From<&str> for RouteComponent {
    fn from(value: &str) -> Self {
        Self::Key(value.into())
    }
}

impl From<String> for RouteComponent {
    fn from(value: String) -> Self {
        Self::Key(value)
    }
}

impl From<usize> for RouteComponent {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

/// An owned path into the underlying YAML document.
///
/// Routes are the back-pointers the AST carries: the document text is
/// the source of truth, and a route re-locates a node in it (including
/// after other patches have been applied, since routes are symbolic
/// rather than byte-positional).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    components: Vec<RouteComponent>,
}

impl Route {
    /// The route addressing the document root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Whether this route addresses the document root.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// The route's final component, if any.
    pub fn last(&self) -> Option<&RouteComponent> {
        self.components.last()
    }

    /// A new route with the given key appended.
    pub fn with_key(&self, key: impl Into<String>) -> Route {
        let mut components = self.components.clone();
        components.push(RouteComponent::Key(key.into()));
        Route { components }
    }

    /// A new route with the given index appended.
    pub fn with_index(&self, index: usize) -> Route {
        let mut components = self.components.clone();
        components.push(RouteComponent::Index(index));
        Route { components }
    }

    /// The parent route. The root is its own parent.
    pub fn parent(&self) -> Route {
        let mut components = self.components.clone();
        components.pop();
        Route { components }
    }

    /// Rebinds this route to a [`yamlspan::Query`] borrowing its keys.
    ///
    /// Returns `None` for the root route, which has no query form.
    pub fn to_query(&self) -> Option<yamlspan::Query<'_>> {
        let components = self
            .components
            .iter()
            .map(|c| match c {
                RouteComponent::Key(key) => yamlspan::Component::Key(key),
                RouteComponent::Index(idx) => yamlspan::Component::Index(*idx),
            })
            .collect();

        yamlspan::Query::new(components)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            match component {
                RouteComponent::Key(key) => write!(f, "/{key}")?,
                RouteComponent::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Position, Route, RouteComponent};

    #[test]
    fn test_route_building() {
        let route = Route::root().with_key("jobs").with_key("build").with_index(2);
        assert_eq!(
            route.last(),
            Some(&RouteComponent::Index(2)),
        );
        assert_eq!(route.to_string(), "/jobs/build[2]");
        assert_eq!(route.parent().to_string(), "/jobs/build");
        assert!(!route.is_root());
        assert!(Route::root().is_root());
    }

    #[test]
    fn test_route_to_query() {
        assert!(Route::root().to_query().is_none());

        let route = Route::root().with_key("jobs").with_index(0);
        let query = route.to_query().unwrap();
        assert_eq!(query.components().len(), 2);
    }

    #[test]
    fn test_position_from_point() {
        let pos = Position::from_point((0, 0));
        assert_eq!(pos, Position::new(1, 1));
        assert_eq!(pos.to_string(), "1:1");
    }
}
