//! Container image references.
//!
//! A reference has the familiar `registry/repository[:tag][@sha256:digest]`
//! shape. After the pipeline resolves a reference, the tag is dropped and the
//! image is addressed by digest only.

use std::fmt;

use crate::error::VerificationError;

/// Registry used when the reference names none.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

const SHA256_PREFIX: &str = "sha256:";
const SHA256_HEX_LEN: usize = 64;
const MAX_TAG_LEN: usize = 128;

/// A parsed container image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference such as `quay.io/org/app:v1@sha256:…`.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::InvalidReference`] if any component is
    /// malformed.
    pub fn parse(reference: &str) -> Result<Self, VerificationError> {
        let invalid = |reason: &str| VerificationError::InvalidReference {
            reference: reference.to_owned(),
            reason: reason.to_owned(),
        };

        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (name, digest) = match trimmed.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|r| invalid(&r))?;
                (name, Some(digest.to_owned()))
            }
            None => (trimmed, None),
        };

        // A `:` after the last `/` separates the tag; one before it belongs
        // to a registry port.
        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &name[split + 1..];
                validate_tag(tag).map_err(|r| invalid(&r))?;
                (&name[..split], Some(tag.to_owned()))
            }
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_owned(), rest.to_owned())
            }
            Some(_) => (DEFAULT_REGISTRY.to_owned(), name.to_owned()),
            None => (DEFAULT_REGISTRY.to_owned(), format!("library/{name}")),
        };

        validate_repository(&repository).map_err(|r| invalid(&r))?;

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The registry host (with port, if any).
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, if the reference carries one.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The full digest (`sha256:<hex>`), if known.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The hex part of the digest, if known.
    pub fn digest_hex(&self) -> Option<&str> {
        self.digest
            .as_deref()
            .and_then(|d| d.strip_prefix(SHA256_PREFIX))
    }

    /// `registry/repository` without tag or digest.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Pin the reference to `digest` and drop the tag.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::InvalidReference`] if `digest` is not a
    /// well-formed `sha256:` digest.
    pub fn resolved(&self, digest: &str) -> Result<Self, VerificationError> {
        validate_digest(digest).map_err(|reason| VerificationError::InvalidReference {
            reference: format!("{}@{digest}", self.name()),
            reason,
        })?;
        Ok(Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_owned()),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn validate_digest(digest: &str) -> Result<(), String> {
    let Some(hex) = digest.strip_prefix(SHA256_PREFIX) else {
        return Err(format!("unsupported digest `{digest}`, expected sha256"));
    };
    if hex.len() != SHA256_HEX_LEN
        || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(format!("malformed sha256 digest `{digest}`"));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN {
        return Err(format!("tag must be 1-{MAX_TAG_LEN} characters"));
    }
    if tag.starts_with(['.', '-'])
        || !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(format!("invalid tag `{tag}`"));
    }
    Ok(())
}

fn validate_repository(repository: &str) -> Result<(), String> {
    if repository.is_empty() {
        return Err("empty repository".to_owned());
    }
    for component in repository.split('/') {
        let valid = !component.is_empty()
            && component.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
            });
        if !valid {
            return Err(format!("invalid repository component `{component}`"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:4e388ab32b10dc8dbc7e28144f552830adc74787c1e2c0824032078a79f227fb";

    #[test]
    fn parses_tag_and_digest() {
        let r = ImageReference::parse(&format!("registry.example/spam:maps@{DIGEST}")).unwrap();
        assert_eq!(r.registry(), "registry.example");
        assert_eq!(r.repository(), "spam");
        assert_eq!(r.tag(), Some("maps"));
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(
            r.digest_hex(),
            Some("4e388ab32b10dc8dbc7e28144f552830adc74787c1e2c0824032078a79f227fb")
        );
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let r = ImageReference::parse("localhost:5000/team/app").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "team/app");
        assert_eq!(r.tag(), None);
    }

    #[test]
    fn short_names_use_default_registry() {
        let r = ImageReference::parse("busybox:1.36").unwrap();
        assert_eq!(r.registry(), DEFAULT_REGISTRY);
        assert_eq!(r.repository(), "library/busybox");

        let r = ImageReference::parse("org/app").unwrap();
        assert_eq!(r.repository(), "org/app");
    }

    #[test]
    fn resolved_drops_tag() {
        let r = ImageReference::parse("registry.example/spam:maps").unwrap();
        let resolved = r.resolved(DIGEST).unwrap();
        assert_eq!(resolved.to_string(), format!("registry.example/spam@{DIGEST}"));
        assert_eq!(resolved.tag(), None);
    }

    #[test]
    fn rejects_malformed_references() {
        for bad in [
            "",
            "registry.example/Spam",
            "registry.example/spam:",
            "registry.example/spam@sha256:abc",
            "registry.example/spam@md5:4e388ab32b10dc8dbc7e28144f552830",
            "registry.example//spam",
        ] {
            assert!(
                matches!(
                    ImageReference::parse(bad),
                    Err(VerificationError::InvalidReference { .. })
                ),
                "expected `{bad}` to be rejected"
            );
        }
    }

    #[test]
    fn display_round_trips() {
        let input = format!("quay.io/org/app:v1@{DIGEST}");
        let r = ImageReference::parse(&input).unwrap();
        assert_eq!(r.to_string(), input);
    }
}
