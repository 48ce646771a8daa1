//! Site identifiers
//!
//! A site id is a 32-character token drawn uniformly from `[a-zA-Z0-9]`.
//! The same alphabet is used to generate ids during provisioning and to
//! validate ids arriving on the tracking endpoint.

use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of every site id
pub const SITE_ID_LENGTH: usize = 32;

/// Characters a site id may contain
pub const SITE_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SiteIdError {
    #[error("site id must be 32 characters, got {0}")]
    InvalidLength(usize),
    #[error("site id contains a character outside [a-zA-Z0-9]")]
    InvalidCharacter,
}

/// A syntactically valid site id. Existence is checked separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SiteId(String);

impl SiteId {
    /// Validate a candidate without touching any store
    pub fn parse(candidate: &str) -> Result<Self, SiteIdError> {
        let len = candidate.chars().count();
        if len != SITE_ID_LENGTH {
            return Err(SiteIdError::InvalidLength(len));
        }

        if !candidate.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(SiteIdError::InvalidCharacter);
        }

        Ok(Self(candidate.to_string()))
    }

    /// Generate a fresh random id, uniform over the alphabet
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id = (0..SITE_ID_LENGTH)
            .map(|_| SITE_ID_ALPHABET[rng.random_range(0..SITE_ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SiteId {
    type Err = SiteIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SiteId {
    type Error = SiteIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SiteId> for String {
    fn from(id: SiteId) -> Self {
        id.0
    }
}

impl AsRef<str> for SiteId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
