//! A very minimal GitHub API client.
//!
//! Built on synchronous reqwest so the online rules can block with a
//! bounded deadline instead of tainting the engine with async. The
//! client is a lazy process-wide singleton; its caches are shared by
//! every analysis thread and use get-or-compute insertion, so each
//! `(owner, repo)` costs at most one round of lookups per process.

use std::{sync::OnceLock, time::Duration};

use anyhow::{Result, anyhow};
use moka::sync::Cache;
use reqwest::{
    StatusCode,
    blocking,
    header::{ACCEPT, AUTHORIZATION, HeaderMap, USER_AGENT},
};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::instrument;

/// Deadline for lookups made while rules are visiting.
pub(crate) const RULE_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for lookups made inside autofixers.
pub(crate) const FIX_DEADLINE: Duration = Duration::from_secs(10);

static CLIENT: OnceLock<Client> = OnceLock::new();

/// The process-wide client, initialized exactly once. Reads
/// `GITHUB_TOKEN` from the environment for authenticated requests.
pub(crate) fn client() -> &'static Client {
    CLIENT.get_or_init(|| Client::new(std::env::var("GITHUB_TOKEN").ok().as_deref()))
}

/// Process-wide lookup caches.
///
/// `moka`'s get-or-compute insertion gives the double-checked
/// discipline the engine needs: a cached value short-circuits the
/// network entirely, which is also the override hook tests use
/// (pre-populate, then lint offline).
pub(crate) struct Caches {
    /// `(owner, repo)` → tag list.
    pub(crate) tags: Cache<(String, String), Vec<Tag>>,
    /// `(owner, repo)` → branch list.
    pub(crate) branches: Cache<(String, String), Vec<Branch>>,
    /// `(owner, repo, sha)` → whether the commit belongs to the repo's
    /// branch/tag histories.
    pub(crate) commit_verifications: Cache<(String, String, String), bool>,
    /// `(owner, repo, ref)` → whether both a branch and tag exist.
    pub(crate) confusable_refs: Cache<(String, String, String), bool>,
    /// `(owner, repo, ref)` → resolved commit SHA.
    pub(crate) ref_commits: Cache<(String, String, String), Option<String>>,
    /// `(owner, repo)` → highest semver tag name.
    pub(crate) latest_tags: Cache<(String, String), Option<String>>,
}

impl Caches {
    fn new() -> Self {
        Self {
            tags: Cache::new(1000),
            branches: Cache::new(1000),
            commit_verifications: Cache::new(10_000),
            confusable_refs: Cache::new(10_000),
            ref_commits: Cache::new(10_000),
            latest_tags: Cache::new(1000),
        }
    }
}

pub(crate) struct Client {
    api_base: String,
    http: blocking::Client,
    pub(crate) caches: Caches,
}

impl Client {
    pub(crate) fn new(token: Option<&str>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, "flowlint".parse().unwrap());
        headers.insert("X-GitHub-Api-Version", "2022-11-28".parse().unwrap());
        headers.insert(ACCEPT, "application/vnd.github+json".parse().unwrap());
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                format!("Bearer {token}")
                    .parse()
                    .expect("couldn't build authorization header for GitHub client?"),
            );
        }

        Self {
            api_base: "https://api.github.com".into(),
            http: blocking::Client::builder()
                .default_headers(headers)
                .build()
                .expect("couldn't build GitHub client?"),
            caches: Caches::new(),
        }
    }

    fn paginate<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        deadline: Duration,
    ) -> Result<Vec<T>> {
        let mut dest = vec![];
        let url = format!("{api_base}/{endpoint}", api_base = self.api_base);

        // Request pages until GitHub returns an empty one; parsing the
        // `links` header would be kinder but isn't necessary.
        let mut pageno = 1;
        loop {
            let resp = self
                .http
                .get(&url)
                .timeout(deadline)
                .query(&[("page", pageno), ("per_page", 100)])
                .send()?
                .error_for_status()?;

            let page = resp.json::<Vec<T>>()?;
            if page.is_empty() {
                break;
            }

            dest.extend(page);
            pageno += 1;
        }

        Ok(dest)
    }

    #[instrument(skip(self))]
    pub(crate) fn list_tags(&self, owner: &str, repo: &str, deadline: Duration) -> Result<Vec<Tag>> {
        self.caches
            .tags
            .try_get_with((owner.into(), repo.into()), || {
                self.paginate(&format!("repos/{owner}/{repo}/tags"), deadline)
            })
            .map_err(flatten_cache_err)
    }

    #[instrument(skip(self))]
    pub(crate) fn list_branches(
        &self,
        owner: &str,
        repo: &str,
        deadline: Duration,
    ) -> Result<Vec<Branch>> {
        self.caches
            .branches
            .try_get_with((owner.into(), repo.into()), || {
                self.paginate(&format!("repos/{owner}/{repo}/branches"), deadline)
            })
            .map_err(flatten_cache_err)
    }

    /// Branches that have the given commit at their tip, via GitHub's
    /// `branches-where-head` endpoint. No stability guarantees, so
    /// callers treat failures as "fall back to the slow path".
    fn branches_where_head(&self, owner: &str, repo: &str, sha: &str) -> Result<Vec<Branch>> {
        self.paginate(
            &format!("repos/{owner}/{repo}/commits/{sha}/branches-where-head"),
            RULE_DEADLINE,
        )
    }

    /// Compares `base...head`; `None` means the refs are completely
    /// divergent (GitHub answers 404).
    fn compare(
        &self,
        owner: &str,
        repo: &str,
        base: &str,
        head: &str,
    ) -> Result<Option<ComparisonStatus>> {
        let url = format!(
            "{api_base}/repos/{owner}/{repo}/compare/{base}...{head}",
            api_base = self.api_base
        );

        let resp = self.http.get(url).timeout(RULE_DEADLINE).send()?;
        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json::<Comparison>()?.status)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(resp.error_for_status().unwrap_err().into()),
        }
    }

    /// Whether `base` contains `head` in its history.
    fn named_ref_contains_commit(
        &self,
        owner: &str,
        repo: &str,
        base: &str,
        head: &str,
    ) -> Result<bool> {
        Ok(matches!(
            self.compare(owner, repo, base, head)?,
            Some(ComparisonStatus::Behind | ComparisonStatus::Identical)
        ))
    }

    /// Whether the given commit belongs to the repository: at a tag or
    /// branch tip, in the branches-containing-commit index, or in the
    /// ancestor history of a mainline branch (`main`/`master`/
    /// `develop`) or any tag. Cached per `(owner, repo, sha)`.
    #[instrument(skip(self))]
    pub(crate) fn commit_in_repo_history(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<bool> {
        self.caches
            .commit_verifications
            .try_get_with((owner.into(), repo.into(), sha.into()), || {
                // Fastest path: almost all pinned commits sit at a tag
                // or branch tip. Tags first, since version tags are the
                // common pin.
                let tags = self.list_tags(owner, repo, RULE_DEADLINE)?;
                if tags.iter().any(|t| t.commit.sha == sha) {
                    return Ok(true);
                }

                let branches = self.list_branches(owner, repo, RULE_DEADLINE)?;
                if branches.iter().any(|b| b.commit.sha == sha) {
                    return Ok(true);
                }

                match self.branches_where_head(owner, repo, sha) {
                    Ok(containing) => return Ok(!containing.is_empty()),
                    Err(err) => {
                        tracing::warn!("fast-path commit check failed for {owner}/{repo}: {err}")
                    }
                }

                // Slow path: ancestor checks against the mainline
                // branches and every tag.
                for mainline in ["main", "master", "develop"] {
                    if branches.iter().any(|b| b.name == mainline)
                        && self.named_ref_contains_commit(
                            owner,
                            repo,
                            &format!("refs/heads/{mainline}"),
                            sha,
                        )?
                    {
                        return Ok(true);
                    }
                }

                for tag in &tags {
                    if self.named_ref_contains_commit(
                        owner,
                        repo,
                        &format!("refs/tags/{name}", name = tag.name),
                        sha,
                    )? {
                        return Ok(true);
                    }
                }

                Ok(false)
            })
            .map_err(flatten_cache_err)
    }

    /// Whether the given symbolic ref exists as both a branch and a
    /// tag. Cached per `(owner, repo, ref)`.
    #[instrument(skip(self))]
    pub(crate) fn ref_confusable(&self, owner: &str, repo: &str, git_ref: &str) -> Result<bool> {
        self.caches
            .confusable_refs
            .try_get_with((owner.into(), repo.into(), git_ref.into()), || {
                let tags = self.list_tags(owner, repo, RULE_DEADLINE)?;
                let has_tag = tags.iter().any(|t| t.name == git_ref);
                if !has_tag {
                    return Ok(false);
                }

                let branches = self.list_branches(owner, repo, RULE_DEADLINE)?;
                Ok(branches.iter().any(|b| b.name == git_ref))
            })
            .map_err(flatten_cache_err)
    }

    /// Resolves a symbolic ref to its current commit SHA, preferring
    /// the tag namespace. Cached per `(owner, repo, ref)`.
    #[instrument(skip(self))]
    pub(crate) fn commit_for_ref(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
        deadline: Duration,
    ) -> Result<Option<String>> {
        self.caches
            .ref_commits
            .try_get_with((owner.into(), repo.into(), git_ref.into()), || {
                for namespace in ["tags", "heads"] {
                    let url = format!(
                        "{api_base}/repos/{owner}/{repo}/git/ref/{namespace}/{git_ref}",
                        api_base = self.api_base
                    );

                    let resp = self.http.get(url).timeout(deadline).send()?;
                    match resp.status() {
                        StatusCode::OK => {
                            return Ok(Some(resp.json::<GitRef>()?.object.sha));
                        }
                        StatusCode::NOT_FOUND => continue,
                        s => {
                            return Err(anyhow!(
                                "{owner}/{repo}: error from GitHub API while resolving {git_ref}: {s}"
                            ));
                        }
                    }
                }

                Ok(None)
            })
            .map_err(flatten_cache_err)
    }

    /// The repository's highest semantically-versioned tag name.
    /// Cached per `(owner, repo)`.
    #[instrument(skip(self))]
    pub(crate) fn latest_semver_tag(
        &self,
        owner: &str,
        repo: &str,
        deadline: Duration,
    ) -> Result<Option<String>> {
        self.caches
            .latest_tags
            .try_get_with((owner.into(), repo.into()), || {
                let tags = self.list_tags(owner, repo, deadline)?;

                Ok(tags
                    .iter()
                    .filter_map(|t| parse_semver(&t.name).map(|v| (v, &t.name)))
                    .max_by_key(|(v, _)| *v)
                    .map(|(_, name)| name.clone()))
            })
            .map_err(flatten_cache_err)
    }

    /// The longest tag pointing at the given commit.
    ///
    /// There's no rev-parse API, so this scans the tag list; the
    /// longest name wins, getting `sha -> v1.2.3` instead of
    /// `sha -> v1`.
    #[instrument(skip(self))]
    pub(crate) fn longest_tag_for_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        deadline: Duration,
    ) -> Result<Option<Tag>> {
        let tags = self.list_tags(owner, repo, deadline)?;

        Ok(tags
            .into_iter()
            .filter(|t| t.commit.sha == sha)
            .max_by_key(|t| t.name.len()))
    }
}

fn flatten_cache_err(err: std::sync::Arc<anyhow::Error>) -> anyhow::Error {
    anyhow!("{err}")
}

/// `vX.Y.Z` / `X.Y.Z` into a comparable triple.
pub(crate) fn parse_semver(name: &str) -> Option<(u64, u64, u64)> {
    let rest = name.strip_prefix('v').unwrap_or(name);
    let mut parts = rest.split('.');

    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    Some((major, minor, patch))
}

/// A branch, as returned by the branches endpoints. Intentionally
/// incomplete.
#[derive(Deserialize, Clone, Debug)]
pub(crate) struct Branch {
    pub(crate) name: String,
    pub(crate) commit: Object,
}

/// A tag, as returned by the tags endpoints. Intentionally incomplete.
#[derive(Deserialize, Clone, Debug)]
pub(crate) struct Tag {
    pub(crate) name: String,
    pub(crate) commit: Object,
}

/// A git object reference.
#[derive(Deserialize, Clone, Debug)]
pub(crate) struct Object {
    pub(crate) sha: String,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
#[allow(dead_code)]
pub(crate) enum ComparisonStatus {
    Ahead,
    Behind,
    Diverged,
    Identical,
}

#[derive(Deserialize)]
struct Comparison {
    status: ComparisonStatus,
}

#[derive(Deserialize)]
struct GitRef {
    object: Object,
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Cache pre-population helpers: tests seed the process-wide
    //! caches so online rules run without touching the network.

    use super::{Object, Tag, client};

    pub(crate) fn seed_commit_verification(owner: &str, repo: &str, sha: &str, verified: bool) {
        client().caches.commit_verifications.insert(
            (owner.into(), repo.into(), sha.into()),
            verified,
        );
    }

    pub(crate) fn seed_confusable(owner: &str, repo: &str, git_ref: &str, confusable: bool) {
        client().caches.confusable_refs.insert(
            (owner.into(), repo.into(), git_ref.into()),
            confusable,
        );
    }

    pub(crate) fn seed_ref_commit(owner: &str, repo: &str, git_ref: &str, sha: &str) {
        client().caches.ref_commits.insert(
            (owner.into(), repo.into(), git_ref.into()),
            Some(sha.into()),
        );
    }

    pub(crate) fn seed_latest_tag(owner: &str, repo: &str, tag: &str) {
        client()
            .caches
            .latest_tags
            .insert((owner.into(), repo.into()), Some(tag.into()));
    }

    pub(crate) fn seed_tags(owner: &str, repo: &str, tags: &[(&str, &str)]) {
        client().caches.tags.insert(
            (owner.into(), repo.into()),
            tags.iter()
                .map(|(name, sha)| Tag {
                    name: name.to_string(),
                    commit: Object {
                        sha: sha.to_string(),
                    },
                })
                .collect(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::parse_semver;

    #[test]
    fn test_parse_semver() {
        assert_eq!(parse_semver("v1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_semver("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_semver("v10.0.1"), Some((10, 0, 1)));
        assert_eq!(parse_semver("v1"), None);
        assert_eq!(parse_semver("v1.2"), None);
        assert_eq!(parse_semver("v1.2.3.4"), None);
        assert_eq!(parse_semver("v1.2.3-rc1"), None);
        assert_eq!(parse_semver("main"), None);
    }
}
