//! Comment and format-preserving YAML patch operations.
//!
//! Patches are symbolic: each targets a [`Route`] rather than a byte
//! offset, so a batch of patches stays valid as earlier patches shift
//! the text. Application re-resolves every route against the current
//! document state.

use thiserror::Error;

use crate::location::{Route, RouteComponent};

/// Errors produced while applying patches.
#[derive(Error, Debug)]
pub enum PatchError {
    /// A route failed to resolve in the document.
    #[error("YAML query error: {0}")]
    Query(#[from] yamlspan::QueryError),
    /// A value failed to serialize.
    #[error("YAML serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
    /// The operation is invalid for its target.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// A single deferred YAML mutation.
#[derive(Debug, Clone)]
pub struct Patch {
    /// The route of the feature to patch.
    pub route: Route,
    /// What to do there.
    pub operation: Op,
}

/// A patch operation.
#[derive(Debug, Clone)]
pub enum Op {
    /// Rewrites the first occurrence of `from` within the feature's
    /// text to `to`, optionally only after the given byte offset into
    /// the feature. Works inside multi-line scalars.
    RewriteFragment {
        /// Text to find.
        from: String,
        /// Replacement text.
        to: String,
        /// Only match at or after this offset into the feature.
        after: Option<usize>,
    },
    /// Replaces the value at the route. The enclosing `key:` is kept.
    Replace(serde_yaml::Value),
    /// Adds a new key/value pair to the mapping at the route. The key
    /// must not already exist.
    Add {
        /// Key to insert.
        key: String,
        /// Value for the key.
        value: serde_yaml::Value,
    },
    /// Merges a key/value pair into the mapping at the route, creating
    /// the key if absent. Mapping values merge entry-wise; anything
    /// else replaces.
    MergeInto {
        /// Key to merge under.
        key: String,
        /// Value to merge in.
        value: serde_yaml::Value,
    },
    /// Removes the key at the route, including its line.
    #[allow(dead_code)]
    Remove,
}

/// Applies a batch of patches to YAML text, preserving comments and
/// formatting outside the patched features.
///
/// Patches are positioned against the incoming document and applied
/// end-to-start so earlier applications don't invalidate later spans.
pub fn apply_patches(content: &str, patches: &[Patch]) -> Result<String, PatchError> {
    if serde_yaml::from_str::<serde_yaml::Value>(content).is_err() {
        return Err(PatchError::InvalidOperation(
            "input is not valid YAML".into(),
        ));
    }

    let mut positioned = Vec::with_capacity(patches.len());
    for patch in patches {
        let doc = yamlspan::Document::new(content)?;
        let feature = route_to_feature_pretty(&patch.route, &doc)?;
        positioned.push((feature.location.byte_span.0, patch));
    }

    // Apply from the end of the document backwards.
    positioned.sort_by(|a, b| b.0.cmp(&a.0));

    let mut result = content.to_string();
    for (_, patch) in positioned {
        result = apply_single_patch(&result, patch)?;
    }

    Ok(result)
}

fn apply_single_patch(content: &str, patch: &Patch) -> Result<String, PatchError> {
    let doc = yamlspan::Document::new(content)?;

    match &patch.operation {
        Op::RewriteFragment { from, to, after } => {
            let Some(feature) = route_to_feature_exact(&patch.route, &doc)? else {
                return Err(PatchError::InvalidOperation(format!(
                    "no pre-existing value to patch at {route}",
                    route = patch.route
                )));
            };

            let extracted = doc.extract(&feature);
            let bias = after.unwrap_or(0);
            if bias > extracted.len() {
                return Err(PatchError::InvalidOperation(format!(
                    "replacement scan index {bias} is out of bounds for feature",
                )));
            }

            let Some(idx) = extracted[bias..].find(from.as_str()) else {
                return Err(PatchError::InvalidOperation(format!(
                    "no match for '{from}' in feature"
                )));
            };
            let (start, end) = (idx + bias, idx + bias + from.len());

            let mut patched = extracted.to_string();
            patched.replace_range(start..end, to);

            let mut result = content.to_string();
            result.replace_range(
                feature.location.byte_span.0..feature.location.byte_span.1,
                &patched,
            );
            Ok(result)
        }
        Op::Replace(value) => {
            let feature = route_to_feature_pretty(&patch.route, &doc)?;
            let replacement = value_replacement(content, &feature, &doc, value)?;

            let mut result = content.to_string();
            result.replace_range(
                feature.location.byte_span.0..feature.location.byte_span.1,
                &replacement,
            );
            Ok(result)
        }
        Op::Add { key, value } => {
            if patch.route.is_root() {
                return Err(PatchError::InvalidOperation(
                    "add operation requires a non-root route".into(),
                ));
            }

            let key_route = patch.route.with_key(key.as_str());
            if key_route
                .to_query()
                .map(|q| doc.query_exists(&q))
                .unwrap_or(false)
            {
                return Err(PatchError::InvalidOperation(format!(
                    "key '{key}' already exists at {route}",
                    route = patch.route
                )));
            }

            let feature = route_to_feature_pretty(&patch.route, &doc)?;

            let value_str = serialize_value(value)?;
            let value_str = value_str.trim_end();

            // Inside a sequence item the new key aligns with the item's
            // other keys; in a mapping it indents one level deeper.
            let leading = leading_whitespace(content, feature.location.byte_span.0);
            let indent = format!("{leading}  ");

            let entry = if let serde_yaml::Value::Mapping(mapping) = value {
                if mapping.is_empty() {
                    format!("\n{indent}{key}: {value_str}")
                } else {
                    let mut entry = format!("\n{indent}{key}:");
                    for line in value_str.lines().filter(|l| !l.trim().is_empty()) {
                        entry.push('\n');
                        entry.push_str(&indent);
                        entry.push_str("  ");
                        entry.push_str(line.trim_start());
                    }
                    entry
                }
            } else if value_str.contains('\n') {
                format!(
                    "\n{indent}{key}: {value}",
                    value = indent_multiline(value_str, &indent)
                )
            } else {
                format!("\n{indent}{key}: {value_str}")
            };

            // Insert after the feature's real content, in front of any
            // trailing comment lines the span may include.
            let is_list_item = matches!(patch.route.last(), Some(RouteComponent::Index(_)));
            let insertion_point = if is_list_item {
                content_end(content, &feature)
            } else {
                feature.location.byte_span.1
            };

            let needs_newline = insertion_point == 0
                || content.as_bytes().get(insertion_point - 1) != Some(&b'\n');
            let entry = if needs_newline {
                entry
            } else {
                entry.strip_prefix('\n').unwrap_or(&entry).to_string()
            };

            let mut result = content.to_string();
            result.insert_str(insertion_point, &entry);
            Ok(result)
        }
        Op::MergeInto { key, value } => {
            let key_route = patch.route.with_key(key.as_str());

            if let Ok(existing) = route_to_feature_pretty(&key_route, &doc) {
                if let serde_yaml::Value::Mapping(new_mapping) = value {
                    // Merge mapping-into-mapping when the existing value
                    // parses as one; the pretty extract includes the key,
                    // so unwrap the outer layer first.
                    let existing_content = doc.extract_with_leading_whitespace(&existing);
                    if let Ok(serde_yaml::Value::Mapping(outer)) =
                        serde_yaml::from_str::<serde_yaml::Value>(existing_content)
                    {
                        let existing_value = outer
                            .get(key.as_str())
                            .cloned()
                            .unwrap_or(serde_yaml::Value::Mapping(outer));

                        if let serde_yaml::Value::Mapping(existing_mapping) = existing_value {
                            let mut merged = existing_mapping;
                            for (k, v) in new_mapping {
                                merged.insert(k.clone(), v.clone());
                            }

                            return replace_mapping_value(
                                content,
                                &doc,
                                &key_route,
                                key,
                                &serde_yaml::Value::Mapping(merged),
                            );
                        }
                    }
                }

                return apply_single_patch(
                    content,
                    &Patch {
                        route: key_route,
                        operation: Op::Replace(value.clone()),
                    },
                );
            }

            apply_single_patch(
                content,
                &Patch {
                    route: patch.route.clone(),
                    operation: Op::Add {
                        key: key.clone(),
                        value: value.clone(),
                    },
                },
            )
        }
        Op::Remove => {
            if patch.route.is_root() {
                return Err(PatchError::InvalidOperation(
                    "cannot remove the document root".into(),
                ));
            }

            let feature = route_to_feature_pretty(&patch.route, &doc)?;
            let start = line_start(content, feature.location.byte_span.0);
            let end = line_end(content, feature.location.byte_span.1);

            let mut result = content.to_string();
            result.replace_range(start..end, "");
            Ok(result)
        }
    }
}

pub(crate) fn route_to_feature_pretty<'a>(
    route: &Route,
    doc: &'a yamlspan::Document,
) -> Result<yamlspan::Feature<'a>, PatchError> {
    match route.to_query() {
        Some(query) => doc.query_pretty(&query).map_err(PatchError::from),
        None => Ok(doc.root()),
    }
}

fn route_to_feature_exact<'a>(
    route: &Route,
    doc: &'a yamlspan::Document,
) -> Result<Option<yamlspan::Feature<'a>>, PatchError> {
    match route.to_query() {
        Some(query) => doc.query_exact(&query).map_err(PatchError::from),
        None => Ok(Some(doc.root())),
    }
}

fn serialize_value(value: &serde_yaml::Value) -> Result<String, PatchError> {
    // Sequences render flow-style (`[a, b]`): block sequences never
    // splice cleanly into an existing `key: value` line.
    if matches!(value, serde_yaml::Value::Sequence(_)) {
        return serialize_flow(value);
    }

    let yaml = serde_yaml::to_string(value)?;
    Ok(yaml.trim_end().to_string())
}

/// Serializes a value in flow layout. Mapping keys must be strings.
fn serialize_flow(value: &serde_yaml::Value) -> Result<String, PatchError> {
    fn inner(value: &serde_yaml::Value, buf: &mut String) -> Result<(), PatchError> {
        match value {
            serde_yaml::Value::Null => {
                buf.push_str("null");
                Ok(())
            }
            serde_yaml::Value::Bool(b) => {
                buf.push_str(if *b { "true" } else { "false" });
                Ok(())
            }
            serde_yaml::Value::Number(n) => {
                buf.push_str(&n.to_string());
                Ok(())
            }
            serde_yaml::Value::String(s) => {
                if s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    buf.push_str(s);
                } else {
                    buf.push_str(
                        &serde_json::to_string(s)
                            .map_err(|e| PatchError::InvalidOperation(e.to_string()))?,
                    );
                }
                Ok(())
            }
            serde_yaml::Value::Sequence(values) => {
                buf.push('[');
                for (i, item) in values.iter().enumerate() {
                    if i > 0 {
                        buf.push_str(", ");
                    }
                    inner(item, buf)?;
                }
                buf.push(']');
                Ok(())
            }
            serde_yaml::Value::Mapping(mapping) => {
                buf.push_str("{ ");
                for (i, (key, value)) in mapping.iter().enumerate() {
                    if i > 0 {
                        buf.push_str(", ");
                    }
                    if !matches!(key, serde_yaml::Value::String(_)) {
                        return Err(PatchError::InvalidOperation(format!(
                            "mapping keys must be strings, found: {key:?}"
                        )));
                    }
                    inner(key, buf)?;
                    buf.push_str(": ");
                    inner(value, buf)?;
                }
                buf.push_str(" }");
                Ok(())
            }
            serde_yaml::Value::Tagged(tagged) => Err(PatchError::InvalidOperation(format!(
                "cannot serialize tagged value: {tagged:?}"
            ))),
        }
    }

    let mut buf = String::new();
    inner(value, &mut buf)?;
    Ok(buf)
}

/// Builds the replacement text for [`Op::Replace`].
///
/// The replacement starts exactly at the feature's first byte (its
/// `key:` for pair features), so callers splice it over the exact
/// feature span. Indentation for multi-line forms derives from the
/// key's column, which handles `- key: value` sequence items where the
/// line's whitespace prefix stops at the dash.
fn value_replacement(
    content: &str,
    feature: &yamlspan::Feature,
    doc: &yamlspan::Document,
    value: &serde_yaml::Value,
) -> Result<String, PatchError> {
    let current = doc.extract(feature);
    let trimmed = current.trim();
    let key_col = feature.location.byte_span.0 - line_start(content, feature.location.byte_span.0);

    // Single-line flow mapping features get rebuilt wholesale.
    if trimmed.starts_with('{') && trimmed.ends_with('}') && !trimmed.contains('\n') {
        let val_str = serialize_value(value)?;
        let key_part = match trimmed.find(':') {
            Some(colon) => trimmed[..colon].trim_start_matches('{').trim(),
            None => trimmed.trim_start_matches('{').trim_end_matches('}').trim(),
        };
        return Ok(format!("{{ {key_part}: {val_str} }}"));
    }

    let Some(colon) = current.find(':') else {
        // A bare value; replace it directly.
        return serialize_value(value);
    };

    let key_part = current[..colon + 1].trim_end();
    let value_part = &current[colon + 1..];

    match value {
        // Multi-line strings become (or stay) literal blocks.
        serde_yaml::Value::String(s)
            if s.contains('\n') || value_part.trim_start().starts_with('|') =>
        {
            let content_indent = " ".repeat(key_col + 2);
            let body = s
                .lines()
                .map(|line| {
                    if line.trim().is_empty() {
                        String::new()
                    } else {
                        format!("{content_indent}{line}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");

            Ok(format!("{key_part} |\n{body}"))
        }
        // Non-empty mappings nest under the key as a block.
        serde_yaml::Value::Mapping(mapping) if !mapping.is_empty() => {
            let serialized = serde_yaml::to_string(value)?;
            let content_indent = " ".repeat(key_col + 2);
            let mut replacement = key_part.to_string();
            for line in serialized.lines().filter(|l| !l.trim().is_empty()) {
                replacement.push('\n');
                replacement.push_str(&content_indent);
                replacement.push_str(line);
            }
            Ok(replacement)
        }
        _ => {
            let val_str = serialize_value(value)?;
            Ok(format!("{key_part} {}", val_str.trim()))
        }
    }
}

/// Replaces an existing `key:`'s mapping value wholesale, preserving
/// the key line. Used by [`Op::MergeInto`] once merged content is
/// computed.
fn replace_mapping_value(
    content: &str,
    doc: &yamlspan::Document,
    key_route: &Route,
    key: &str,
    merged: &serde_yaml::Value,
) -> Result<String, PatchError> {
    let feature = route_to_feature_pretty(key_route, doc)?;

    let leading = leading_whitespace(content, feature.location.byte_span.0);
    let serialized = serde_yaml::to_string(merged)?;

    let mut replacement = format!("{key}:");
    for line in serialized.lines().filter(|l| !l.trim().is_empty()) {
        replacement.push('\n');
        replacement.push_str(&leading);
        replacement.push_str("  ");
        replacement.push_str(line);
    }

    let mut result = content.to_string();
    result.replace_range(
        feature.location.byte_span.0..feature.location.byte_span.1,
        &replacement,
    );
    Ok(result)
}

/// The whitespace prefix of the line containing `pos`.
fn leading_whitespace(content: &str, pos: usize) -> String {
    let start = line_start(content, pos);
    content[start..]
        .chars()
        .take_while(|c| *c == ' ')
        .collect()
}

fn line_start(content: &str, pos: usize) -> usize {
    content[..pos].rfind('\n').map(|p| p + 1).unwrap_or(0)
}

fn line_end(content: &str, pos: usize) -> usize {
    content[pos..]
        .find('\n')
        .map(|p| pos + p + 1)
        .unwrap_or(content.len())
}

/// The absolute offset just past the last non-empty, non-comment line
/// within the feature's span.
fn content_end(content: &str, feature: &yamlspan::Feature) -> usize {
    let (start, end) = feature.location.byte_span;
    let mut cursor = end;

    while cursor > start {
        let ls = line_start(content, cursor.saturating_sub(1)).max(start);
        let line = content[ls..cursor].trim();
        if !line.is_empty() && !line.starts_with('#') {
            return cursor;
        }
        if ls == start {
            break;
        }
        cursor = ls.saturating_sub(1);
    }

    end
}
