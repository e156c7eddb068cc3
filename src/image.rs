use regex::Regex;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

const MAX_TAG_LENGTH: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("image reference {reference:?} is not fully qualified: {reason}")]
    NotQualified { reference: String, reason: &'static str },

    #[error("branch {0:?} does not yield a usable image tag")]
    Alias(String),
}

fn repository_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$")
            .expect("repository pattern")
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern"))
}

/// A `registry/repository:tag` reference to a container image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: String,
}

impl ImageReference {
    pub fn registry_host(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The same repository under a different tag, e.g. a floating branch alias.
    pub fn with_tag(&self, tag: &str) -> Result<Self, Error> {
        if !tag_pattern().is_match(tag) {
            return Err(Error::NotQualified {
                reference: format!("{}/{}:{}", self.registry, self.repository, tag),
                reason: "invalid tag",
            });
        }
        Ok(Self {
            tag: tag.to_string(),
            ..self.clone()
        })
    }

    /// Branch alias for this image. The branch name is turned into a valid tag.
    pub fn branch_alias(&self, branch: &str) -> Result<Self, Error> {
        let tag = sanitize_tag(branch).ok_or_else(|| Error::Alias(branch.to_string()))?;
        self.with_tag(&tag)
    }
}

/// Turn an arbitrary branch name into a valid tag, e.g. `feature/login` becomes `feature-login`.
pub fn sanitize_tag(branch: &str) -> Option<String> {
    let replaced: String = branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = replaced.trim_start_matches(['.', '-']);
    let tag: String = trimmed.chars().take(MAX_TAG_LENGTH).collect();
    (!tag.is_empty()).then_some(tag)
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(reference: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| Error::NotQualified {
            reference: reference.to_string(),
            reason,
        };

        let (registry, remainder) = reference
            .split_once('/')
            .ok_or_else(|| invalid("missing registry host"))?;
        let is_host = registry.contains('.') || registry.contains(':') || registry == "localhost";
        if !is_host {
            return Err(invalid("first path component is not a registry host"));
        }
        if remainder.contains('@') {
            return Err(invalid("digests are assigned by the registry, use a tag"));
        }
        let (repository, tag) = remainder
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing tag"))?;
        if !repository_pattern().is_match(repository) {
            return Err(invalid("invalid repository path"));
        }
        if !tag_pattern().is_match(tag) {
            return Err(invalid("invalid tag"));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fully_qualified() {
        let image: ImageReference = "registry.example.com:5000/whanos/apps/demo:abc1234"
            .parse()
            .unwrap();
        assert_eq!(image.registry_host(), "registry.example.com:5000");
        assert_eq!(image.repository(), "whanos/apps/demo");
        assert_eq!(image.tag(), "abc1234");
        assert_eq!(image.to_string(), "registry.example.com:5000/whanos/apps/demo:abc1234");
    }

    #[test]
    fn localhost_is_a_registry() {
        let image: ImageReference = "localhost/demo:latest".parse().unwrap();
        assert_eq!(image.registry_host(), "localhost");
    }

    #[test]
    fn reject_partial_references() {
        for reference in [
            "demo:latest",
            "library/demo:latest",
            "registry.example.com/demo",
            "registry.example.com/Demo:latest",
            "registry.example.com/demo:-bad",
            "registry.example.com/demo@sha256:abcd",
        ] {
            assert!(
                reference.parse::<ImageReference>().is_err(),
                "{reference} should be rejected"
            );
        }
    }

    #[test]
    fn branch_alias_keeps_repository() {
        let image: ImageReference = "registry.example.com/whanos/demo:abc1234".parse().unwrap();
        let alias = image.branch_alias("feature/login page").unwrap();
        assert_eq!(alias.to_string(), "registry.example.com/whanos/demo:feature-login-page");
        assert_eq!(image.tag(), "abc1234");
    }

    #[test]
    fn sanitize_tags() {
        assert_eq!(sanitize_tag("main").as_deref(), Some("main"));
        assert_eq!(sanitize_tag("-.release/1.2").as_deref(), Some("release-1.2"));
        assert_eq!(sanitize_tag("///"), None);
        assert_eq!(sanitize_tag(&"x".repeat(300)).map(|t| t.len()), Some(MAX_TAG_LENGTH));
    }
}
