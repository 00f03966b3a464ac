//! Image reference refinements.
//!
//! The registry transport works with plain [`oci_client::Reference`] values;
//! the build engine itself only ever passes around three refinements of the
//! OCI distribution reference grammar: a *named* reference (host +
//! repository), a *tagged* reference, and a *digested* reference. Every
//! resolution result is digested - floating tags never travel through the
//! core.

use crate::error::{DazzleError, Result};
use oci_client::Reference;
use std::fmt;

/// A named image reference: registry host plus repository, no tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedRef {
    registry: String,
    repository: String,
}

impl NamedRef {
    /// Parse a named reference, dropping any tag or digest the input carries.
    pub fn parse(input: &str) -> Result<Self> {
        let reference =
            Reference::try_from(input).map_err(|e| DazzleError::InvalidReference {
                reference: input.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            registry: reference.resolve_registry().to_string(),
            repository: reference.repository().to_string(),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Attach a tag, validating it against the distribution tag grammar.
    pub fn with_tag(&self, tag: &str) -> Result<TaggedRef> {
        if !is_valid_tag(tag) {
            return Err(DazzleError::InvalidReference {
                reference: format!("{}:{}", self, tag),
                reason: "invalid tag".to_string(),
            });
        }
        Ok(TaggedRef {
            name: self.clone(),
            tag: tag.to_string(),
        })
    }

    /// Derive a sub-repository, e.g. `host/repo` -> `host/repo/chunk`.
    pub fn child(&self, name: &str) -> Result<NamedRef> {
        NamedRef::parse(&format!("{}/{}/{}", self.registry, self.repository, name))
    }
}

impl fmt::Display for NamedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

/// A named reference with a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaggedRef {
    name: NamedRef,
    tag: String,
}

impl TaggedRef {
    pub fn name(&self) -> &NamedRef {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Attach the digest a resolution returned for this tag.
    pub fn with_digest(&self, digest: impl Into<String>) -> DigestedRef {
        DigestedRef {
            name: self.name.clone(),
            tag: Some(self.tag.clone()),
            digest: digest.into(),
        }
    }

    pub fn to_oci(&self) -> Reference {
        Reference::with_tag(
            self.name.registry.clone(),
            self.name.repository.clone(),
            self.tag.clone(),
        )
    }
}

impl fmt::Display for TaggedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// A named reference pinned to a content digest, optionally still carrying
/// the tag it was resolved from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DigestedRef {
    name: NamedRef,
    tag: Option<String>,
    digest: String,
}

impl DigestedRef {
    pub fn name(&self) -> &NamedRef {
        &self.name
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Parse a reference that must carry a digest.
    pub fn parse(input: &str) -> Result<Self> {
        let reference =
            Reference::try_from(input).map_err(|e| DazzleError::InvalidReference {
                reference: input.to_string(),
                reason: e.to_string(),
            })?;
        let digest = reference
            .digest()
            .ok_or_else(|| DazzleError::InvalidReference {
                reference: input.to_string(),
                reason: "reference carries no digest".to_string(),
            })?;
        Ok(Self {
            name: NamedRef {
                registry: reference.resolve_registry().to_string(),
                repository: reference.repository().to_string(),
            },
            tag: reference.tag().map(str::to_string),
            digest: digest.to_string(),
        })
    }

    pub fn to_oci(&self) -> Reference {
        Reference::with_digest(
            self.name.registry.clone(),
            self.name.repository.clone(),
            self.digest.clone(),
        )
    }
}

impl fmt::Display for DigestedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}@{}", self.name, tag, self.digest),
            None => write!(f, "{}@{}", self.name, self.digest),
        }
    }
}

/// A reference that is at least named; produced when user input may carry
/// either a tag or a digest (e.g. chunk refs passed on the command line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyRef {
    Tagged(TaggedRef),
    Digested(DigestedRef),
}

impl AnyRef {
    /// Parse user input; bare names default to the `latest` tag.
    pub fn parse(input: &str) -> Result<Self> {
        let reference =
            Reference::try_from(input).map_err(|e| DazzleError::InvalidReference {
                reference: input.to_string(),
                reason: e.to_string(),
            })?;
        let name = NamedRef {
            registry: reference.resolve_registry().to_string(),
            repository: reference.repository().to_string(),
        };
        if let Some(digest) = reference.digest() {
            return Ok(AnyRef::Digested(DigestedRef {
                name,
                tag: reference.tag().map(str::to_string),
                digest: digest.to_string(),
            }));
        }
        let tag = reference.tag().unwrap_or("latest");
        name.with_tag(tag).map(AnyRef::Tagged)
    }

    pub fn name(&self) -> &NamedRef {
        match self {
            AnyRef::Tagged(r) => r.name(),
            AnyRef::Digested(r) => r.name(),
        }
    }

    pub fn to_oci(&self) -> Reference {
        match self {
            AnyRef::Tagged(r) => r.to_oci(),
            AnyRef::Digested(r) => r.to_oci(),
        }
    }
}

impl fmt::Display for AnyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyRef::Tagged(r) => r.fmt(f),
            AnyRef::Digested(r) => r.fmt(f),
        }
    }
}

/// Tag grammar from the distribution spec: up to 128 characters of
/// `[A-Za-z0-9_.-]`, not starting with `.` or `-`.
fn is_valid_tag(tag: &str) -> bool {
    if tag.is_empty() || tag.len() > 128 {
        return false;
    }
    let mut chars = tag.chars();
    let first = chars.next().unwrap_or(' ');
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return false;
    }
    tag.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named() {
        let named = NamedRef::parse("eu.gcr.io/gitpod/workspace-images").unwrap();
        assert_eq!(named.registry(), "eu.gcr.io");
        assert_eq!(named.repository(), "gitpod/workspace-images");
        assert_eq!(named.to_string(), "eu.gcr.io/gitpod/workspace-images");
    }

    #[test]
    fn test_parse_drops_tag_and_digest() {
        let named = NamedRef::parse("example.com/repo:sometag").unwrap();
        assert_eq!(named.to_string(), "example.com/repo");
    }

    #[test]
    fn test_tagged_roundtrip() {
        let named = NamedRef::parse("example.com/repo").unwrap();
        let tagged = named.with_tag("base--abc123").unwrap();
        assert_eq!(tagged.to_string(), "example.com/repo:base--abc123");
        assert_eq!(tagged.to_oci().whole(), "example.com/repo:base--abc123");
    }

    #[test]
    fn test_invalid_tags_rejected() {
        let named = NamedRef::parse("example.com/repo").unwrap();
        assert!(named.with_tag("").is_err());
        assert!(named.with_tag(".hidden").is_err());
        assert!(named.with_tag("has space").is_err());
        assert!(named.with_tag(&"x".repeat(129)).is_err());
        assert!(named.with_tag("ok-tag_1.2").is_ok());
    }

    #[test]
    fn test_digested_display() {
        let named = NamedRef::parse("example.com/repo").unwrap();
        let digested = named
            .with_tag("v1")
            .unwrap()
            .with_digest("sha256:0000000000000000000000000000000000000000000000000000000000000000");
        assert!(digested.to_string().starts_with("example.com/repo:v1@sha256:"));
    }

    #[test]
    fn test_digested_parse_requires_digest() {
        assert!(DigestedRef::parse("example.com/repo:v1").is_err());
        let parsed = DigestedRef::parse(
            "example.com/repo@sha256:0000000000000000000000000000000000000000000000000000000000000000",
        )
        .unwrap();
        assert!(parsed.digest().starts_with("sha256:"));
    }

    #[test]
    fn test_any_ref_defaults_to_latest() {
        let any = AnyRef::parse("example.com/repo").unwrap();
        assert_eq!(any.to_string(), "example.com/repo:latest");
    }

    #[test]
    fn test_child_repository() {
        let named = NamedRef::parse("example.com/repo").unwrap();
        let child = named.child("golang").unwrap();
        assert_eq!(child.to_string(), "example.com/repo/golang");
    }
}
