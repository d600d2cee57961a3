//! Version resolution from repository tag history.
//!
//! The core ([`resolve_version`]) is a pure function over a [`RepoHistory`]
//! snapshot. [`GitHistory`] reads that snapshot from the `git` CLI and
//! [`VersionResolver`] ties the two together with the fallback rules.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Version used when no tag qualifies.
pub const BASE_VERSION: &str = "0.0.1";

/// Default tag prefix (`v1.2.3`).
pub const DEFAULT_TAG_PREFIX: &str = "v";

/// Errors from reading or parsing versions.
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("git is not available: {0}")]
    GitUnavailable(String),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("invalid version '{0}': expected MAJOR.MINOR.PATCH")]
    Invalid(String),
}

/// A plain `MAJOR.MINOR.PATCH` version shared by every artifact of a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(semver::Version);

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    /// Next patch release.
    pub fn bump_patch(&self) -> Self {
        Self::new(self.0.major, self.0.minor, self.0.patch + 1)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed =
            semver::Version::parse(s.trim()).map_err(|_| VersionError::Invalid(s.to_string()))?;
        if !parsed.pre.is_empty() || !parsed.build.is_empty() {
            return Err(VersionError::Invalid(s.to_string()));
        }
        Ok(Self(parsed))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A tag reachable from HEAD and the number of commits between it and HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRef {
    pub name: String,
    pub distance: u32,
}

impl TagRef {
    pub fn new(name: impl Into<String>, distance: u32) -> Self {
        Self {
            name: name.into(),
            distance,
        }
    }
}

/// Snapshot of the repository state the version is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoHistory {
    pub tags: Vec<TagRef>,
    /// Uncommitted changes in the working tree.
    pub dirty: bool,
}

/// How tags map to versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPolicy {
    pub tag_prefix: String,
    pub base: Version,
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self {
            tag_prefix: DEFAULT_TAG_PREFIX.to_string(),
            base: Version::new(0, 0, 1),
        }
    }
}

/// Derive the build version from a history snapshot.
///
/// Picks the highest tag matching the policy prefix. Commits past that tag
/// or a dirty tree bump the patch component. Without a qualifying tag the
/// base version is returned.
pub fn resolve_version(history: &RepoHistory, policy: &VersionPolicy) -> Version {
    let latest = history
        .tags
        .iter()
        .filter_map(|tag| {
            let raw = tag.name.strip_prefix(policy.tag_prefix.as_str())?;
            match raw.parse::<Version>() {
                Ok(version) => Some((version, tag.distance)),
                Err(_) => {
                    tracing::debug!(tag = %tag.name, "ignoring tag that is not a plain version");
                    None
                }
            }
        })
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    match latest {
        None => policy.base.clone(),
        Some((version, distance)) if distance > 0 || history.dirty => version.bump_patch(),
        Some((version, _)) => version,
    }
}

/// Reads [`RepoHistory`] through the `git` CLI.
pub struct GitHistory;

impl GitHistory {
    /// Tags reachable from HEAD matching `prefix`, with their distance to HEAD.
    pub fn read(repo_dir: &Path, prefix: &str) -> Result<RepoHistory, VersionError> {
        let pattern = format!("{}*", prefix);
        let listed = git(repo_dir, &["tag", "--merged", "HEAD", "--list", &pattern])?;

        let mut tags = Vec::new();
        for name in listed.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let range = format!("{}..HEAD", name);
            let count = git(repo_dir, &["rev-list", "--count", &range])?;
            let distance = count.trim().parse::<u32>().map_err(|_| VersionError::Git {
                command: format!("rev-list --count {}", range),
                stderr: format!("unexpected output '{}'", count.trim()),
            })?;
            tags.push(TagRef::new(name, distance));
        }

        // Untracked files (such as the build directory) do not make a tree dirty.
        let status = git(repo_dir, &["status", "--porcelain", "--untracked-files=no"])?;
        Ok(RepoHistory {
            tags,
            dirty: !status.trim().is_empty(),
        })
    }
}

fn git(repo_dir: &Path, args: &[&str]) -> Result<String, VersionError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| VersionError::GitUnavailable(e.to_string()))?;

    if !output.status.success() {
        return Err(VersionError::Git {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check if git is available on the system.
pub(crate) fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Resolves the version for one run. Never creates tags.
#[derive(Debug, Clone)]
pub struct VersionResolver {
    repo_dir: PathBuf,
    policy: VersionPolicy,
    override_version: Option<Version>,
}

impl VersionResolver {
    pub fn new(repo_dir: impl Into<PathBuf>, policy: VersionPolicy) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            policy,
            override_version: None,
        }
    }

    /// Use an explicit version instead of reading history.
    pub fn with_override(mut self, version: Option<Version>) -> Self {
        self.override_version = version;
        self
    }

    pub fn policy(&self) -> &VersionPolicy {
        &self.policy
    }

    /// Resolve the version.
    ///
    /// A directory that is not a repository (or a missing `git`) yields the
    /// base version with a warning instead of failing the build.
    pub fn resolve(&self) -> Version {
        if let Some(version) = &self.override_version {
            tracing::debug!(version = %version, "using explicit version");
            return version.clone();
        }

        if !git_available() {
            tracing::warn!(
                base = %self.policy.base,
                "git not found, using base version"
            );
            return self.policy.base.clone();
        }

        match GitHistory::read(&self.repo_dir, &self.policy.tag_prefix) {
            Ok(history) => resolve_version(&history, &self.policy),
            Err(e) => {
                tracing::warn!(
                    repo = %self.repo_dir.display(),
                    error = %e,
                    base = %self.policy.base,
                    "could not read tag history, using base version"
                );
                self.policy.base.clone()
            }
        }
    }
}
