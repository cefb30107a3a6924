//! Action reference (`uses:`) parsing.

/// A remote action reference of the form `owner/repo[/subpath]@ref`.
///
/// Only remote references are analyzable; [`parse_action_ref`] returns
/// `None` for local paths, Docker references, and malformed values.
#[derive(Debug, PartialEq)]
pub struct ActionRef<'a> {
    /// The repository owner (user or org).
    pub owner: &'a str,
    /// The repository name.
    pub repo: &'a str,
    /// The path to the action within the repository, if any.
    pub subpath: Option<&'a str>,
    /// The `@ref` the reference is pinned to.
    pub git_ref: &'a str,
}

impl<'a> ActionRef<'a> {
    /// The `owner/repo` slug.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// The full path portion (`owner/repo[/subpath]`).
    pub fn path(&self) -> String {
        match self.subpath {
            Some(subpath) => format!("{}/{}/{}", self.owner, self.repo, subpath),
            None => self.slug(),
        }
    }

    /// Whether this reference's `owner/repo` slug matches, ignoring
    /// case and any subpath.
    pub fn matches_slug(&self, slug: &str) -> bool {
        self.slug().eq_ignore_ascii_case(slug)
    }

    /// Whether the ref is a full commit SHA pin.
    pub fn is_pinned(&self) -> bool {
        is_full_sha(self.git_ref)
    }
}

/// Parses a `uses:` value into a remote [`ActionRef`].
///
/// Returns `None` — "nothing here to analyze" — for local references
/// (`./x`, `.\x`), Docker references (`docker://...`), values without
/// an `@<ref>`, and values whose path has fewer than two segments.
pub fn parse_action_ref(uses: &str) -> Option<ActionRef<'_>> {
    if uses.starts_with("./") || uses.starts_with(".\\") || uses.starts_with("docker://") {
        return None;
    }

    // Refs and subpaths can both contain `@`, but the runner refuses a
    // `uses:` with more than one, so the rightmost split is canonical.
    let (path, git_ref) = uses.rsplit_once('@')?;
    if git_ref.is_empty() {
        return None;
    }

    let mut segments = path.splitn(3, '/');
    let owner = segments.next().filter(|s| !s.is_empty())?;
    let repo = segments.next().filter(|s| !s.is_empty())?;
    let subpath = segments.next();

    Some(ActionRef {
        owner,
        repo,
        subpath,
        git_ref,
    })
}

/// Whether `s` is a full (40-character, lowercase hex) commit SHA.
pub fn is_full_sha(s: &str) -> bool {
    s.len() == 40
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// The numeric major version of a `vN`/`vN.N.N` style ref, or 0 when
/// the ref has no such shape (including full SHA pins).
pub(crate) fn ref_major_version(git_ref: &str) -> u64 {
    if is_full_sha(git_ref) {
        return 0;
    }

    let digits = git_ref
        .strip_prefix('v')
        .unwrap_or(git_ref)
        .split(['.', '-'])
        .next()
        .unwrap_or("");

    digits.parse().unwrap_or(0)
}
