//! Source references and path normalization.
//!
//! A [`SourceReference`] is the canonical form of whatever the client typed
//! after the host name: `dave/foo`, `github.com/dave/foo`,
//! `gist.github.com/dave/<id>/main.go` and so on. Its normalized path is the
//! key for both the build cache and the admission queue, so two spellings of
//! the same package must collapse to one string.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Longest username the hosting service accepts.
pub const MAX_GITHUB_USERNAME_LEN: usize = 38;

const GITHUB_HOST: &str = "github.com";
const GIST_HOST: &str = "gist.github.com";

/// Where a reference points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    GitHub,
    Gist,
    Local,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Gist => "gist",
            Self::Local => "local",
        }
    }

    fn classify(path: &str) -> Self {
        if path.starts_with("gist.github.com/") {
            Self::Gist
        } else if path.starts_with("github.com/") {
            Self::GitHub
        } else {
            Self::Local
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::GitHub),
            "gist" => Ok(Self::Gist),
            "local" => Ok(Self::Local),
            _ => Err(format!("Invalid source kind: {}", s)),
        }
    }
}

/// A normalized source reference.
///
/// Equality and hashing only consider the normalized path; the kind is
/// derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReference {
    kind: SourceKind,
    normalized_path: String,
}

impl SourceReference {
    /// Build a reference from an already-normalized path.
    ///
    /// Callers holding raw user input should go through
    /// [`PathNormalizer::normalize`] instead.
    pub fn from_normalized(path: impl Into<String>) -> Self {
        let normalized_path = path.into();
        Self {
            kind: SourceKind::classify(&normalized_path),
            normalized_path,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.normalized_path
    }

    /// Path segments, skipping empty ones.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.normalized_path.split('/').filter(|s| !s.is_empty())
    }
}

impl PartialEq for SourceReference {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_path == other.normalized_path
    }
}

impl Eq for SourceReference {}

impl std::hash::Hash for SourceReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized_path.hash(state);
    }
}

impl fmt::Display for SourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized_path)
    }
}

/// Canonicalizes inbound source paths.
///
/// Holds its compiled patterns so they are built once at startup and shared
/// by reference.
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    gist_with_username: Regex,
    github_username: Regex,
}

impl PathNormalizer {
    pub fn new() -> Self {
        // Literal patterns; covered by the unit tests below.
        let gist_with_username = Regex::new(
            r"^gist\.github\.com/[A-Za-z0-9_.\-]+/([a-f0-9]+)((?:/[\p{L}0-9_.\-]+)*)$",
        )
        .expect("gist pattern compiles");
        let github_username =
            Regex::new(r"^[a-zA-Z0-9\-]{0,38}$").expect("username pattern compiles");
        Self {
            gist_with_username,
            github_username,
        }
    }

    /// Normalize a raw path into a [`SourceReference`].
    ///
    /// Pure and idempotent: normalizing the returned path again yields the
    /// same reference.
    pub fn normalize(&self, raw: &str) -> SourceReference {
        SourceReference::from_normalized(self.normalize_path(raw))
    }

    /// String form of [`normalize`](Self::normalize).
    pub fn normalize_path(&self, path: &str) -> String {
        if let Some(stripped) = self.strip_gist_username(path) {
            return stripped;
        }

        if let Some((first, _)) = path.split_once('/')
            && !first.contains('.')
            && self.github_username.is_match(first)
        {
            return format!("{}/{}", GITHUB_HOST, path);
        }

        path.to_string()
    }

    /// `gist.github.com/<user>/<id>[/<sub>]` → `gist.github.com/<id>[/<sub>]`.
    ///
    /// A first segment that is itself all lowercase hex is taken to be the
    /// gist id of an already-stripped path, which keeps the rewrite
    /// idempotent.
    fn strip_gist_username(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix("gist.github.com/")?;
        let first = rest.split('/').next().unwrap_or_default();
        if is_lower_hex(first) {
            return None;
        }
        let captures = self.gist_with_username.captures(path)?;
        let id = captures.get(1)?.as_str();
        let sub = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        Some(format!("{}/{}{}", GIST_HOST, id, sub))
    }
}

impl Default for PathNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn norm(path: &str) -> String {
        PathNormalizer::new().normalize_path(path)
    }

    #[test]
    fn test_qualified_github_path_is_unchanged() {
        assert_eq!(norm("github.com/dave/foo"), "github.com/dave/foo");
    }

    #[test]
    fn test_bare_username_is_qualified() {
        assert_eq!(norm("dave/foo"), "github.com/dave/foo");
        assert_eq!(norm("dave-c/foo/bar"), "github.com/dave-c/foo/bar");
    }

    #[test]
    fn test_gist_username_is_stripped() {
        assert_eq!(
            norm("gist.github.com/dave/abc123/file.go"),
            "gist.github.com/abc123/file.go"
        );
        assert_eq!(norm("gist.github.com/dave/abc123"), "gist.github.com/abc123");
    }

    #[test]
    fn test_hex_looking_gist_username_is_kept() {
        // Indistinguishable from an already-stripped `<id>/<file>` path, so
        // it is left alone and keys separately from the bare id.
        assert_eq!(norm("gist.github.com/cafe/abc123"), "gist.github.com/cafe/abc123");
        assert_ne!(norm("gist.github.com/cafe/abc123"), norm("gist.github.com/abc123"));
        assert_eq!(
            norm(&norm("gist.github.com/cafe/abc123")),
            "gist.github.com/cafe/abc123"
        );
    }

    #[test]
    fn test_gist_with_non_hex_id_is_unchanged() {
        assert_eq!(
            norm("gist.github.com/dave/not-an-id"),
            "gist.github.com/dave/not-an-id"
        );
        assert_eq!(norm("gist.github.com/dave"), "gist.github.com/dave");
    }

    #[test]
    fn test_hostname_first_segment_is_never_prefixed() {
        assert_eq!(norm("golang.org/x/tools"), "golang.org/x/tools");
        assert_eq!(norm("bitbucket.org/foo/bar"), "bitbucket.org/foo/bar");
    }

    #[test]
    fn test_long_username_is_not_qualified() {
        let long = "a".repeat(MAX_GITHUB_USERNAME_LEN + 1);
        let path = format!("{}/repo", long);
        assert_eq!(norm(&path), path);

        let max = "a".repeat(MAX_GITHUB_USERNAME_LEN);
        let path = format!("{}/repo", max);
        assert_eq!(norm(&path), format!("github.com/{}", path));
    }

    #[test]
    fn test_path_without_slash_is_unchanged() {
        assert_eq!(norm("fmt"), "fmt");
        assert_eq!(norm(""), "");
    }

    #[test]
    fn test_username_with_underscore_is_not_qualified() {
        assert_eq!(norm("my_user/repo"), "my_user/repo");
    }

    #[test]
    fn test_reference_kind_and_equality() {
        let normalizer = PathNormalizer::new();
        let a = normalizer.normalize("dave/foo");
        let b = normalizer.normalize("github.com/dave/foo");
        assert_eq!(a, b);
        assert_eq!(a.kind(), SourceKind::GitHub);
        assert_eq!(
            normalizer.normalize("gist.github.com/dave/abc123").kind(),
            SourceKind::Gist
        );
        assert_eq!(normalizer.normalize("fmt").kind(), SourceKind::Local);
    }

    #[test]
    fn test_segments_skip_empty() {
        let r = SourceReference::from_normalized("github.com//dave/foo/");
        assert_eq!(r.segments().collect::<Vec<_>>(), vec!["github.com", "dave", "foo"]);
    }

    #[test]
    fn test_source_kind_from_str() {
        assert_eq!("gist".parse::<SourceKind>().unwrap(), SourceKind::Gist);
        assert!("svn".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_hex_username_with_hex_file_is_stable() {
        let once = norm("gist.github.com/abc123/def456");
        assert_eq!(once, "gist.github.com/abc123/def456");
        assert_eq!(norm(&once), once);
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(path in "[a-zA-Z0-9_./\\-]{0,60}") {
            let normalizer = PathNormalizer::new();
            let once = normalizer.normalize_path(&path);
            let twice = normalizer.normalize_path(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn gist_paths_are_idempotent(
            user in "[a-z]{1,8}",
            id in "[a-f0-9]{1,12}",
            sub in "(/[a-z0-9]{1,6}){0,3}",
        ) {
            let normalizer = PathNormalizer::new();
            let once = normalizer.normalize_path(&format!("gist.github.com/{}/{}{}", user, id, sub));
            prop_assert_eq!(normalizer.normalize_path(&once), once.clone());
        }
    }
}
