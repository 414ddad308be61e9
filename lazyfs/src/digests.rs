use std::str::FromStr;

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

/// An algorithm-tagged content identifier, like `sha256:<hex>`.
///
/// The string form is kept as-is, it's the key used everywhere (cache
/// layout, status map, logs). Only the shape is validated on construction.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("missing algorithm separator in {0:?}")]
    MissingSeparator(String),

    #[error("invalid algorithm in {0:?}")]
    InvalidAlgorithm(String),

    #[error("invalid encoded part in {0:?}")]
    InvalidEncoded(String),

    #[error("invalid digest length for {algorithm}: {len}")]
    InvalidDigestLen { algorithm: &'static str, len: usize },
}

/// The hash functions we're able to verify content against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl Digest {
    /// The part before the colon.
    pub fn algorithm(&self) -> &str {
        // constructors ensure the separator is present.
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    /// The part after the colon.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or_default()
    }

    /// Returns the [Algorithm] if it's one we can verify.
    pub fn known_algorithm(&self) -> Option<Algorithm> {
        match self.algorithm() {
            "sha256" => Some(Algorithm::Sha256),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Calculates the sha256 digest of the passed data.
    pub fn sha256(data: &[u8]) -> Self {
        Self::from_raw(Algorithm::Sha256, &Sha256::digest(data))
    }

    /// Calculates the sha512 digest of the passed data.
    pub fn sha512(data: &[u8]) -> Self {
        Self::from_raw(Algorithm::Sha512, &Sha512::digest(data))
    }

    /// Constructs a digest from the raw output of a hash function.
    pub fn from_raw(algorithm: Algorithm, raw: &[u8]) -> Self {
        Self(format!("{}:{}", algorithm.name(), HEXLOWER.encode(raw)))
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| Error::MissingSeparator(s.to_string()))?;

        // components of [a-z0-9]+, joined by one of `+._-`. This also keeps
        // `.` and `..` out, the algorithm ends up as a path component.
        if !algorithm.split(['+', '.', '_', '-']).all(|c| {
            !c.is_empty() && c.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        }) {
            return Err(Error::InvalidAlgorithm(s.to_string()));
        }

        if encoded.is_empty()
            || !encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(Error::InvalidEncoded(s.to_string()));
        }

        let digest = Self(s.to_string());
        if let Some(algorithm) = digest.known_algorithm() {
            if encoded.len() != algorithm.hex_len() {
                return Err(Error::InvalidDigestLen {
                    algorithm: algorithm.name(),
                    len: encoded.len(),
                });
            }
        }

        Ok(digest)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
