use std::{
    fmt,
    io::{self, Read},
    str::FromStr,
};

use sha2::Digest as _;

/// Algorithm to compute the hash value.
///
/// See [`Digest`] for an example.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum DigestAlgorithm {
    SHA256,
    SHA512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::SHA256 => "sha256",
            DigestAlgorithm::SHA512 => "sha512",
        }
    }

    /// Length of the hash value, as a hex string.
    fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::SHA256 => 256 / 8 * 2,
            DigestAlgorithm::SHA512 => 512 / 8 * 2,
        }
    }

    fn hasher(&self) -> Box<dyn digest::DynDigest + Send> {
        match self {
            DigestAlgorithm::SHA256 => Box::new(sha2::Sha256::new()),
            DigestAlgorithm::SHA512 => Box::new(sha2::Sha512::new()),
        }
    }
}

/// Content digest of a blob.
///
/// It contains the algorithm (like `SHA256`) and the hash value as a
/// lowercase hexadecimal string. Two digests are equal only if they
/// name the same bytes.
///
/// # Examples
///
/// ```
/// # use oci_depot::*;
/// const DIGEST: &str = "123456789012345678901234567890123456789012345678901234567890abcd";
///
/// let digest = Digest::try_from(format!("sha256:{}", DIGEST)).unwrap();
/// assert_eq!(digest.algorithm(), DigestAlgorithm::SHA256);
/// assert_eq!(digest.hash_value(), DIGEST);
/// assert_eq!(digest.to_string(), format!("sha256:{}", DIGEST));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hash: String,
    algorithm: DigestAlgorithm,
}

/// Errors from the digest parser and the verifier.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DigestError {
    #[error("Invalid digest algorithm.")]
    InvalidAlgorithm,

    #[error("Invalid digest value.")]
    InvalidValue,

    #[error("Digest mismatch. Expected {expected}, got {actual}.")]
    Mismatch { expected: Digest, actual: Digest },
}

impl DigestError {
    /// `true` if the error comes from a digest that can't be parsed.
    pub fn is_malformed(&self) -> bool {
        matches!(self, DigestError::InvalidAlgorithm | DigestError::InvalidValue)
    }
}

impl Digest {
    /// Compute the digest of `data`.
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Digest {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data);
        hasher.finish()
    }

    /// Compute the SHA256 digest of `data`.
    pub fn sha256(data: &[u8]) -> Digest {
        Digest::compute(DigestAlgorithm::SHA256, data)
    }

    /// Original string to build this instance (`algorithm:hash_value`).
    pub fn source(&self) -> &str {
        &self.hash
    }

    pub fn hash_value(&self) -> &str {
        self.hash
            .split_once(':')
            .map(|(_, h)| h)
            .unwrap_or_default()
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Check that `content` hashes to this digest.
    pub fn verify(&self, content: &[u8]) -> Result<(), DigestError> {
        let actual = Digest::compute(self.algorithm, content);
        if actual == *self {
            Ok(())
        } else {
            Err(DigestError::Mismatch {
                expected: self.clone(),
                actual,
            })
        }
    }

    /// Return a `Read` instance to compute its digest.
    ///
    /// When all data from `reader` is consumed, it verifies that the
    /// computed digest is the expected one. If not, it returns an
    /// [`InvalidData`](::std::io::ErrorKind::InvalidData) error, which
    /// wraps a [`DigestError::Mismatch`].
    pub fn wrap_reader<R: Read>(&self, reader: R) -> impl Read {
        DigestReader {
            hasher: Hasher::new(self.algorithm),
            expected: self.clone(),
            reader,
        }
    }
}

/// Verify that `content` matches the digest in `expected`.
///
/// `expected` is parsed first, so a malformed string is reported as
/// [`DigestError::InvalidAlgorithm`] or [`DigestError::InvalidValue`].
pub fn verify(content: &[u8], expected: &str) -> Result<(), DigestError> {
    Digest::from_str(expected)?.verify(content)
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(hash: String) -> Result<Self, Self::Error> {
        let (algorithm, value) = match hash.split_once(':') {
            Some(("sha256", h)) => (DigestAlgorithm::SHA256, h),
            Some(("sha512", h)) => (DigestAlgorithm::SHA512, h),
            _ => return Err(DigestError::InvalidAlgorithm),
        };

        // Validate that the hash value is a string with the expected length,
        // and it only contains lowercase hexadecimal digits.
        if value.len() == algorithm.hex_len()
            && value.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f'))
        {
            Ok(Digest { hash, algorithm })
        } else {
            Err(DigestError::InvalidValue)
        }
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::try_from(s.to_owned())
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> String {
        digest.hash
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

/// Incremental digest computation.
pub struct Hasher {
    algorithm: DigestAlgorithm,
    inner: Box<dyn digest::DynDigest + Send>,
}

impl Hasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Hasher {
            algorithm,
            inner: algorithm.hasher(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Return the digest of the data received so far, and reset the state.
    pub fn finish(&mut self) -> Digest {
        let hash = self.inner.finalize_reset();

        Digest {
            hash: format!("{}:{}", self.algorithm.as_str(), HexString(&hash)),
            algorithm: self.algorithm,
        }
    }
}

struct DigestReader<R> {
    hasher: Hasher,
    expected: Digest,
    reader: R,
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let buf_len = buf.len();
        let n = self.reader.read(buf)?;

        if n == 0 && buf_len > 0 {
            // On EOF, compare the computed digest with the expected one.
            let actual = self.hasher.finish();
            if actual != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    DigestError::Mismatch {
                        expected: self.expected.clone(),
                        actual,
                    },
                ));
            }

            return Ok(0);
        }

        self.hasher.update(&buf[..n]);

        Ok(n)
    }
}

/// Encode a byte buffer as hex string.
pub(crate) struct HexString<T>(pub T);

impl<T: AsRef<[u8]>> fmt::Display for HexString<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0
            .as_ref()
            .iter()
            .try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}


#[test]
fn encode_hex_bytes() {
    assert_eq!(HexString(b"\x01\x20\xf0").to_string(), "0120f0");
}

#[test]
fn compute_known_digests() {
    assert_eq!(Digest::sha256(b"abc").source(), fixtures::ABC);

    let sha512 = Digest::compute(DigestAlgorithm::SHA512, b"abc");
    assert_eq!(sha512.algorithm(), DigestAlgorithm::SHA512);
    assert!(sha512.hash_value().starts_with("ddaf35a193617aba"));
}

#[test]
fn reuse_hasher_after_finish() {
    for algorithm in [DigestAlgorithm::SHA256, DigestAlgorithm::SHA512] {
        let mut hasher = Hasher::new(algorithm);

        hasher.update(b"ab");
        hasher.update(b"c");
        assert_eq!(hasher.finish(), Digest::compute(algorithm, b"abc"));

        // The state is reset by `finish`.
        hasher.update(b"abcx");
        assert_eq!(hasher.finish(), Digest::compute(algorithm, b"abcx"));
    }

    assert_eq!(Hasher::new(DigestAlgorithm::SHA256).finish(), Digest::sha256(b""));
}

#[test]
fn verify_content() {
    assert_eq!(verify(b"abc", fixtures::ABC), Ok(()));

    match verify(b"abcx", fixtures::ABC) {
        Err(DigestError::Mismatch { expected, actual }) => {
            assert_eq!(expected.source(), fixtures::ABC);
            assert_eq!(actual.source(), fixtures::ABCX);
        }

        other => panic!("Unexpected result: {other:?}"),
    }

    // Changing a single byte changes the digest.
    let mut content = b"abc".to_vec();
    content[1] ^= 1;
    assert!(matches!(
        verify(&content, fixtures::ABC),
        Err(DigestError::Mismatch { .. })
    ));
}

#[test]
fn reject_malformed_digests() {
    let uppercase = fixtures::ABC.to_uppercase().replace("SHA", "sha");

    let malformed = [
        ("md5:0000", DigestError::InvalidAlgorithm),
        ("sha256", DigestError::InvalidAlgorithm),
        ("sha256:0000", DigestError::InvalidValue),
        (uppercase.as_str(), DigestError::InvalidValue),
    ];

    for (input, expected) in malformed {
        let err = verify(b"abc", input).unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(err, expected, "{input}");
    }
}

#[test]
fn reject_invalid_stream() {
    use std::io::Cursor;

    let digest = Digest::from_str(fixtures::ABC).unwrap();
    let mut output = Vec::new();

    // Accept a valid stream.
    digest
        .wrap_reader(Cursor::new("abc"))
        .read_to_end(&mut output)
        .unwrap();

    assert_eq!(output, b"abc");

    // Reject an invalid stream.
    output.clear();
    let err = digest
        .wrap_reader(Cursor::new("abcx"))
        .read_to_end(&mut output)
        .unwrap_err();

    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    let msg = err.into_inner().unwrap().to_string();
    assert!(msg.contains(fixtures::ABC));
    assert!(msg.contains(fixtures::ABCX));
}
