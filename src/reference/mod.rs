mod parser;

pub(crate) use parser::DEFAULT_REGISTRY;

use std::{fmt, str::FromStr};

use crate::digest::{Digest, DigestError};

/// Errors from [`Reference::parse`].
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("Missing repository.")]
    MissingRepository,

    #[error("Invalid repository name: {0}")]
    InvalidRepository(String),

    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    #[error("Repository name can't be a 64-byte hex string: {0}")]
    AmbiguousRepository(String),

    #[error("{0}")]
    InvalidDigest(#[from] DigestError),
}

/// Reference to an image in an OCI registry.
///
/// The parser tries to be close to what `docker pull` does:
///
/// * If the reference does not include the hostname of the registry,
///   it uses Docker Hub, and the repository namespace defaults to
///   `library` if there is none. For example:
///
///   * `debian` is parsed as `docker.io/library/debian`.
///   * `nixos/nix` is parsed as `docker.io/nixos/nix`.
/// * The first component is a registry if it contains a `.` or a `:`,
///   or if it is `localhost`.
/// * It accepts a tag after the last `:` character, and a fixed digest
///   after a `@` character. If neither is given, the tag is `latest`.
///
/// However, it does not try to be bug-for-bug compatible with Docker.
///
/// # Examples
///
/// ```
/// # use oci_depot::*;
/// const REFERENCE: &str = "registry.example.com/foo/bar:1.23.4@sha256:123456789012345678901234567890123456789012345678901234567890abcd";
///
/// let reference = Reference::parse(REFERENCE).unwrap();
/// assert_eq!(reference.repository.registry(), "registry.example.com");
/// assert_eq!(reference.repository.path(), "foo/bar");
/// assert_eq!(reference.tag.as_deref(), Some("1.23.4"));
///
/// let digest = reference.digest.as_ref().unwrap();
/// assert_eq!(digest.algorithm(), DigestAlgorithm::SHA256);
/// assert_eq!(reference.to_string(), REFERENCE);
/// ```
///
/// ```
/// # use oci_depot::*;
/// let reference = Reference::parse("debian").unwrap();
///
/// assert_eq!(reference.repository.to_string(), "docker.io/library/debian");
/// assert_eq!(reference.tag.as_deref(), Some("latest"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Registry and path of the repository.
    pub repository: Repository,

    /// Image tag.
    pub tag: Option<String>,

    /// Manifest digest, if present.
    pub digest: Option<Digest>,
}

impl Reference {
    /// Parse and normalize an image reference.
    pub fn parse(reference: &str) -> Result<Reference, ParseError> {
        parser::parse(reference)
    }

    /// Build a reference to a tag.
    pub fn with_tag(repository: Repository, tag: &str) -> Result<Reference, ParseError> {
        parser::validate_tag(tag)?;
        Ok(Reference {
            repository,
            tag: Some(tag.to_owned()),
            digest: None,
        })
    }

    /// Build a canonical reference to a digest.
    pub fn with_digest(repository: Repository, digest: Digest) -> Reference {
        Reference {
            repository,
            tag: None,
            digest: Some(digest),
        }
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.repository, f)?;

        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }

        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }

        Ok(())
    }
}

/// Represents a repository in a registry, like `docker.io/library/debian`
/// or `example.com:5000/foo/bar`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Repository {
    registry: String,
    path: String,
}

impl Repository {
    /// Address of the registry server.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Path of the repository in the registry, like `library/debian`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Return the name of this repository (last component of the path).
    ///
    /// # Examples
    ///
    /// ```
    /// # use oci_depot::*;
    /// let reference = Reference::parse("foo/bar:stable").unwrap();
    /// assert_eq!(reference.repository.name(), "bar");
    /// ```
    pub fn name(&self) -> &str {
        self.path
            .rsplit_once('/')
            .map(|s| s.1)
            .unwrap_or(&self.path)
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.path)
    }
}

impl FromStr for Repository {
    type Err = ParseError;

    /// Parse a repository name, without tag or digest.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parser::parse_repository(s)
    }
}

impl TryFrom<String> for Repository {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        parser::parse_repository(&s)
    }
}

impl From<Repository> for String {
    fn from(repository: Repository) -> String {
        repository.to_string()
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;

    fn try_from(reference: &str) -> Result<Self, Self::Error> {
        parser::parse(reference)
    }
}
