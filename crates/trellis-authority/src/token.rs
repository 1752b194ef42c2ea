//! Bootstrap tokens
//!
//! A token lets one service identity submit CSRs. It is 32 bytes from the
//! aws-lc-rs RNG, shown to operators as unpadded URL-safe base64. The
//! authority keeps only the SHA-256 digest.

use std::fmt;
use std::str::FromStr;

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use thiserror::Error;

const TOKEN_BYTES: usize = 32;

/// Token creation or parsing failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// The system RNG failed
    #[error("secure random source unavailable")]
    Rng,
    /// Presented text is not unpadded URL-safe base64
    #[error("token is not url-safe base64")]
    Encoding,
}

/// A bootstrap credential
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    encoded: String,
    digest: String,
}

impl BootstrapToken {
    /// Fresh random token
    pub fn generate() -> Result<Self, TokenError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        aws_lc_rs::rand::fill(&mut bytes).map_err(|_| TokenError::Rng)?;
        Ok(Self::from_bytes(&bytes, URL_SAFE_NO_PAD.encode(bytes)))
    }

    fn from_bytes(bytes: &[u8], encoded: String) -> Self {
        let digest = URL_SAFE_NO_PAD.encode(digest(&SHA256, bytes));
        Self { encoded, digest }
    }

    /// The token as handed to a worker
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Stored form: SHA-256 of the token bytes, base64 encoded
    pub fn hash(&self) -> &str {
        &self.digest
    }
}

impl FromStr for BootstrapToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|_| TokenError::Encoding)?;
        Ok(Self::from_bytes(&bytes, s.to_string()))
    }
}

impl fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BootstrapToken(sha256:{})", self.digest)
    }
}

impl fmt::Display for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}
