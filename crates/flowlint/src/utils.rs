//! Helper routines shared across rules.

use std::ops::Range;

/// Splits a multi-pattern value (e.g. an `upload-artifact` `path:`)
/// into its individual patterns.
///
/// Patterns are separated by newlines or commas; blank entries are
/// dropped. No glob interpretation happens here.
pub(crate) fn split_patterns(patterns: &str) -> impl Iterator<Item = &str> {
    patterns
        .lines()
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

/// Scans free-form text for a `${{ ... }}` fragment starting at
/// `offset`, skipping closers inside single-quoted strings.
///
/// Returns the fenced fragment and its absolute span.
fn extract_expression(text: &str, offset: usize) -> Option<(&str, Range<usize>)> {
    let view = &text[offset..];
    let start = view.find("${{")?;

    let bytes = view.as_bytes();
    let mut end = None;
    let mut in_string = false;

    for idx in start..bytes.len() {
        if bytes[idx] == b'\'' {
            in_string = !in_string;
        } else if !in_string && bytes[idx] == b'}' && idx > 0 && bytes[idx - 1] == b'}' {
            end = Some(idx);
            break;
        }
    }

    end.map(|end| {
        (
            &view[start..=end],
            start + offset..end + offset + 1,
        )
    })
}

/// Extracts every `${{ ... }}` fragment in the given text, with
/// absolute spans.
pub(crate) fn extract_expressions(text: &str) -> Vec<(&str, Range<usize>)> {
    let mut exprs = vec![];
    let mut offset = 0;

    while let Some((expr, span)) = extract_expression(text, offset) {
        let end = span.end;
        exprs.push((expr, span));

        if end >= text.len() {
            break;
        }
        offset = end;
    }

    exprs
}

/// Strips the fencing from a `${{ ... }}` fragment.
pub(crate) fn bare_expression(fenced: &str) -> &str {
    fenced
        .trim()
        .strip_prefix("${{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(fenced)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{bare_expression, extract_expressions, split_patterns};

    #[test]
    fn test_split_patterns() {
        assert_eq!(
            split_patterns("foo, bar,baz").collect::<Vec<_>>(),
            ["foo", "bar", "baz"]
        );
        assert_eq!(
            split_patterns("foo\nbar\n\n  baz  \n").collect::<Vec<_>>(),
            ["foo", "bar", "baz"]
        );
        assert_eq!(split_patterns("").count(), 0);
    }

    #[test]
    fn test_extract_expressions() {
        let text = "echo ${{ github.actor }} and ${{ github.ref }}";
        let exprs = extract_expressions(text);
        assert_eq!(exprs.len(), 2);
        assert_eq!(exprs[0].0, "${{ github.actor }}");
        assert_eq!(&text[exprs[0].1.clone()], "${{ github.actor }}");
        assert_eq!(exprs[1].0, "${{ github.ref }}");
    }

    #[test]
    fn test_extract_expression_quoted_closer() {
        // A }} inside a single-quoted string doesn't close the fence.
        let text = "${{ contains(github.ref, '}}') }}";
        let exprs = extract_expressions(text);
        assert_eq!(exprs.len(), 1);
        assert_eq!(exprs[0].0, text);
    }

    #[test]
    fn test_extract_expression_none() {
        assert!(extract_expressions("no expressions here").is_empty());
        assert!(extract_expressions("${{ unterminated").is_empty());
    }

    #[test]
    fn test_bare_expression() {
        assert_eq!(bare_expression("${{ github.actor }}"), "github.actor");
        assert_eq!(bare_expression("${{github.actor}}"), "github.actor");
        assert_eq!(bare_expression("not fenced"), "not fenced");
    }
}
