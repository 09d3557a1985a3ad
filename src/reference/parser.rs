//! Parse a reference to an image in an OCI registry.
//!
//! It tries to be close to what `docker pull` does, but it does not try
//! to be bug-for-bug compatible.

use super::*;

/// Hostname to use when the reference is just the repository,
/// like `debian` or `nixos/nix`.
pub(crate) const DEFAULT_REGISTRY: &str = "docker.io";

const DEFAULT_NAMESPACE: &str = "library";

const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;

type Result<T> = std::result::Result<T, ParseError>;

pub(super) fn parse(reference: &str) -> Result<Reference> {
    // Extract the digest after the last `@`.
    let (base, digest) = match reference.rsplit_once('@') {
        None => (reference, None),
        Some((base, d)) => (base, Some(Digest::try_from(d.to_owned())?)),
    };

    // Extract the tag after the last `:`.
    //
    // If the value contains a `/`, it assumes that the value after `:`
    // is a port number, and not a tag.
    let (base, tag) = match base.rsplit_once(':') {
        Some((base, tag)) if !tag.contains('/') => (base, Some(tag)),
        _ => (base, None),
    };

    // A bare digest, like `sha256:0123...`, is parsed as a repository
    // named `sha256` with a long tag.
    if let (Some(tag), None) = (tag, &digest) {
        if Digest::try_from(format!("{base}:{tag}")).is_ok() {
            return Err(ParseError::MissingRepository);
        }
    }

    let repository = parse_repository(base)?;

    let tag = match (tag, &digest) {
        (Some(tag), _) => {
            validate_tag(tag)?;
            Some(tag.to_owned())
        }

        (None, None) => Some(DEFAULT_TAG.to_owned()),

        (None, Some(_)) => None,
    };

    Ok(Reference {
        repository,
        tag,
        digest,
    })
}

pub(super) fn parse_repository(base: &str) -> Result<Repository> {
    if base.is_empty() {
        return Err(ParseError::MissingRepository);
    }

    // Names like this are indistinguishable from image IDs.
    if base.len() == 64 && base.bytes().all(|c| c.is_ascii_hexdigit()) {
        return Err(ParseError::AmbiguousRepository(base.to_owned()));
    }

    // Imitate the logic from `docker pull` to get the repository.
    let (registry, path) = match base.split_once('/') {
        // There is no `/`. The reference is an image in the
        // `library` namespace.
        None => (DEFAULT_REGISTRY, format!("{DEFAULT_NAMESPACE}/{base}")),

        // There is a `.` or a `:` before the `/`, or it is `localhost`.
        // Parse it as a hostname.
        Some((registry, path))
            if registry.contains(['.', ':']) || registry == "localhost" =>
        {
            match path.contains('/') {
                false if registry == DEFAULT_REGISTRY => {
                    (registry, format!("{DEFAULT_NAMESPACE}/{path}"))
                }
                _ => (registry, path.to_owned()),
            }
        }

        // Assume it is a repository in the default registry.
        Some(_) => (DEFAULT_REGISTRY, base.to_owned()),
    };

    if path.is_empty() {
        return Err(ParseError::MissingRepository);
    }

    if !valid_registry(registry) || !path.split('/').all(valid_path_component) {
        return Err(ParseError::InvalidRepository(base.to_owned()));
    }

    Ok(Repository {
        registry: registry.to_owned(),
        path,
    })
}

/// A registry is a hostname or an IP address, with an optional port.
///
/// Hostnames must be lowercase, so the same registry is always written
/// the same way.
fn valid_registry(registry: &str) -> bool {
    let (host, port) = match registry.strip_prefix('[') {
        Some(ipv6) => match ipv6.split_once(']') {
            Some((address, rest)) => {
                if address.parse::<std::net::Ipv6Addr>().is_err() {
                    return false;
                }

                match rest {
                    "" => (None, None),
                    _ => match rest.strip_prefix(':') {
                        Some(port) => (None, Some(port)),
                        None => return false,
                    },
                }
            }

            None => return false,
        },

        None => match registry.split_once(':') {
            Some((host, port)) => (Some(host), Some(port)),
            None => (Some(registry), None),
        },
    };

    if let Some(port) = port {
        if !port.bytes().all(|c| c.is_ascii_digit()) || port.parse::<u16>().is_err() {
            return false;
        }
    }

    match host {
        Some(host) => host.split('.').all(valid_label),
        None => true,
    }
}

/// Labels are lowercase alphanumeric, with `-` only between them.
fn valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    let alnum = |c: &u8| c.is_ascii_lowercase() || c.is_ascii_digit();

    bytes.first().is_some_and(alnum)
        && bytes.last().is_some_and(alnum)
        && bytes.iter().all(|c| alnum(c) || *c == b'-')
}

/// A path component is made of lowercase alphanumeric groups, joined
/// by a single `.` or `_`, a double `__`, or any number of `-`.
fn valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();

    let alnum = |c: &u8| c.is_ascii_lowercase() || c.is_ascii_digit();

    if !bytes.first().is_some_and(alnum) || !bytes.last().is_some_and(alnum) {
        return false;
    }

    let mut separator = String::new();
    for c in component.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if !matches!(separator.as_str(), "" | "." | "_" | "__")
                && !separator.bytes().all(|s| s == b'-')
            {
                return false;
            }
            separator.clear();
        } else if matches!(c, '.' | '_' | '-') {
            separator.push(c);
        } else {
            return false;
        }
    }

    true
}

/// Tags are up to 128 characters from `[A-Za-z0-9_.-]`, and can't
/// start with `.` or `-`.
pub(super) fn validate_tag(tag: &str) -> Result<()> {
    let mut chars = tag.chars();

    let valid = tag.len() <= MAX_TAG_LEN
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if valid {
        Ok(())
    } else {
        Err(ParseError::InvalidTag(tag.to_owned()))
    }
}

#[test]
fn parse_valid_references() {
    use crate::digest::HexString;
    use sha2::{Digest as _, Sha256, Sha512};

    macro_rules! check {
        ($reference:expr, [ $registry:expr, $path:expr, $tag:expr, $digest:expr ]) => {
            let reference = $reference;
            assert_eq!(
                Reference::parse(<_ as AsRef<str>>::as_ref(&reference)).unwrap(),
                Reference {
                    repository: Repository {
                        registry: $registry.to_owned(),
                        path: $path.to_owned(),
                    },
                    tag: $tag.map(str::to_owned),
                    digest: $digest,
                }
            )
        };
    }

    let sha256 = HexString(Sha256::digest(b"\x00\x01"));
    let sha512 = HexString(Sha512::digest(b"\x01\x02"));

    check!("foo", [DEFAULT_REGISTRY, "library/foo", Some(DEFAULT_TAG), None]);

    check!("foo/bar", [DEFAULT_REGISTRY, "foo/bar", Some(DEFAULT_TAG), None]);

    check!(
        "localhost/foo:x_y",
        ["localhost", "foo", Some("x_y"), None]
    );

    check!(
        "example.com:5678/foo/bar:1.2.3",
        ["example.com:5678", "foo/bar", Some("1.2.3"), None]
    );

    check!(
        &format!("example.com/foo/bar@sha256:{sha256}"),
        [
            "example.com",
            "foo/bar",
            None::<&str>,
            Digest::try_from(format!("sha256:{sha256}")).ok()
        ]
    );

    check!(
        &format!("example.com:1234/foo/bar:1.2.3@sha512:{sha512}"),
        [
            "example.com:1234",
            "foo/bar",
            Some("1.2.3"),
            Digest::try_from(format!("sha512:{sha512}")).ok()
        ]
    );

    check!(
        "[::1]:5000/foo:1",
        ["[::1]:5000", "foo", Some("1"), None]
    );

    check!(
        "my-registry.local:443/foo",
        ["my-registry.local:443", "foo", Some(DEFAULT_TAG), None]
    );

    check!(
        "docker.io/foo:1",
        [DEFAULT_REGISTRY, "library/foo", Some("1"), None]
    );

    check!(
        "a.b/x-y/z__w.v---u:T.1",
        ["a.b", "x-y/z__w.v---u", Some("T.1"), None]
    );
}

#[test]
fn normalization_is_idempotent() {
    let digest = crate::digest::fixtures::ABC;

    for text in [
        "busybox".to_owned(),
        "nixos/nix:2.24".to_owned(),
        "127.0.0.1:5000/foo/bar".to_owned(),
        format!("debian@{digest}"),
        format!("docker.io/library/debian:12@{digest}"),
    ] {
        let parsed = Reference::parse(&text).unwrap();
        let reparsed = Reference::parse(&parsed.to_string()).unwrap();
        assert_eq!(parsed, reparsed, "{text}");
    }
}

#[test]
fn reject_invalid_references() {
    use crate::digest::{fixtures, DigestError};

    assert_eq!(
        Reference::parse("debian:stable@md5:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidAlgorithm)),
    );

    assert_eq!(
        Reference::parse("debian:stable@sha256:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidValue)),
    );

    // Bare digests have no repository.
    assert_eq!(
        Reference::parse(fixtures::ABC),
        Err(ParseError::MissingRepository)
    );

    assert_eq!(
        Reference::parse(&format!("@{}", fixtures::ABC)),
        Err(ParseError::MissingRepository)
    );

    assert_eq!(
        Reference::parse("example.com/:tag"),
        Err(ParseError::MissingRepository)
    );

    for invalid in [
        "Debian",
        "foo//bar",
        "foo/-bar",
        "foo_/bar",
        "a..b",
        "Exa mple.com/foo",
        "EXAMPLE.COM/foo",
        "a..b:xx/foo",
        "x:y:z/foo",
        "example.com:/foo",
        "example.com:99999/foo",
        "-example.com/foo",
        "[::1/foo",
        "[zz::1]:5000/foo",
    ] {
        assert!(
            matches!(
                Reference::parse(invalid),
                Err(ParseError::InvalidRepository(_))
            ),
            "{invalid}"
        );
    }

    let long_tag = format!("foo:{}", "x".repeat(129));
    for invalid in ["foo:-x", "foo:.x", long_tag.as_str()] {
        assert!(
            matches!(Reference::parse(invalid), Err(ParseError::InvalidTag(_))),
            "{invalid}"
        );
    }

    let hex_name = fixtures::ABC.strip_prefix("sha256:").unwrap();
    assert!(matches!(
        Reference::parse(hex_name),
        Err(ParseError::AmbiguousRepository(_))
    ));
}
