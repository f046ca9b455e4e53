use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Error parsing a content digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    /// Missing the `algorithm:` prefix.
    #[error("invalid digest {0:?}: missing algorithm separator")]
    MissingSeparator(String),

    /// The algorithm component is not a valid identifier.
    #[error("invalid digest {0:?}: invalid algorithm")]
    InvalidAlgorithm(String),

    /// The encoded component is not lowercase hex of the right length.
    #[error("invalid digest {0:?}: invalid encoding")]
    InvalidEncoding(String),
}

/// A self-describing content hash, `algorithm:encoded`.
///
/// Digests always contain exactly one `:` separating the algorithm from its
/// lowercase hex encoding. `sha256` digests must carry 64 hex characters.
///
/// ```
/// # use oci_driver::Digest;
/// let digest = Digest::from_bytes(b"foo");
/// assert_eq!(digest.algorithm(), "sha256");
/// assert_eq!(digest.encoded(), "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae");
/// assert!(digest.verify(b"foo"));
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    serialized: String,
    split: usize,
}

impl Digest {
    /// Hash `data` with sha256.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest as _;

        let serialized = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        Digest {
            serialized,
            split: "sha256".len(),
        }
    }

    /// Hash a string with sha256.
    pub fn from_string(data: &str) -> Self {
        Self::from_bytes(data.as_bytes())
    }

    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let split = s
            .find(':')
            .ok_or_else(|| DigestError::MissingSeparator(s.to_owned()))?;
        let (algorithm, encoded) = (&s[..split], &s[split + 1..]);

        if !valid_algorithm(algorithm) {
            return Err(DigestError::InvalidAlgorithm(s.to_owned()));
        }

        let expected_len = match algorithm {
            "sha256" => Some(64),
            "sha512" => Some(128),
            _ => None,
        };
        let hex_ok = !encoded.is_empty()
            && encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !hex_ok || expected_len.is_some_and(|len| encoded.len() != len) {
            return Err(DigestError::InvalidEncoding(s.to_owned()));
        }

        Ok(Digest {
            serialized: s.to_owned(),
            split,
        })
    }

    /// The digest as `algorithm:encoded`.
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// The hash algorithm, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.serialized[..self.split]
    }

    /// The hex-encoded hash.
    pub fn encoded(&self) -> &str {
        &self.serialized[self.split + 1..]
    }

    /// Check that `data` hashes to this digest.
    ///
    /// Only sha256 can be verified; other algorithms never verify.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.algorithm() == "sha256" && Digest::from_bytes(data) == *self
    }
}

// algorithm := component ([+._-] component)*, component := [a-z0-9]+
fn valid_algorithm(algorithm: &str) -> bool {
    !algorithm.is_empty()
        && algorithm
            .split(['+', '.', '_', '-'])
            .all(|component| {
                !component.is_empty()
                    && component
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            })
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.serialized
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.serialized)
    }
}
