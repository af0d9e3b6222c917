// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Preimage and digest primitives for hash time locked escrows.
//!
//! Every swap pins exactly one hash algorithm; there is no process-wide
//! default. The algorithm is carried as a 1-byte flag on the wire
//! (0 = Keccak-256, 1 = SHA-256) and must agree across both ledgers of a
//! pair.

use crate::error::{CoordinatorError, CoordinatorResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use sha3::Keccak256;
use std::fmt;
use subtle::ConstantTimeEq;

pub const SECRET_LEN: usize = 32;
pub const DIGEST_LEN: usize = 32;

/// Hash algorithm used to commit a secret. Wire value is the enum
/// discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Keccak256 = 0,
    Sha256 = 1,
}

impl HashAlgorithm {
    pub fn from_flag(flag: u8) -> CoordinatorResult<Self> {
        match flag {
            0 => Ok(HashAlgorithm::Keccak256),
            1 => Ok(HashAlgorithm::Sha256),
            other => Err(CoordinatorError::UnsupportedAlgorithm(other)),
        }
    }

    pub fn flag(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Keccak256 => "keccak256",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A 32-byte preimage. Never printed in full: `Display` and `Debug` redact
/// to the first four bytes.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret(pub [u8; SECRET_LEN]);

impl Secret {
    /// Draw a fresh secret from the OS entropy source.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Secret(bytes)
    }

    pub fn from_hex(s: &str) -> CoordinatorResult<Self> {
        let bytes = decode_hex_fixed::<SECRET_LEN>(s)?;
        Ok(Secret(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Redacted form safe for logs: first four bytes then an ellipsis.
    pub fn redacted(&self) -> String {
        format!("{}…", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.redacted())
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

/// A 32-byte hash commitment over a [`Secret`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretDigest(pub [u8; DIGEST_LEN]);

impl SecretDigest {
    pub fn from_hex(s: &str) -> CoordinatorResult<Self> {
        let bytes = decode_hex_fixed::<DIGEST_LEN>(s)?;
        Ok(SecretDigest(bytes))
    }

    /// Canonical lowercase hex, no `0x` prefix. This is the stored form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// `0x`-prefixed form used when embedding into EVM call data.
    pub fn to_prefixed_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for SecretDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretDigest({})", self.to_hex())
    }
}

impl fmt::Display for SecretDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Compute the digest of a secret under the given algorithm.
pub fn digest(secret: &Secret, algorithm: HashAlgorithm) -> SecretDigest {
    let out: [u8; DIGEST_LEN] = match algorithm {
        HashAlgorithm::Keccak256 => Keccak256::digest(secret.0).into(),
        HashAlgorithm::Sha256 => Sha256::digest(secret.0).into(),
    };
    SecretDigest(out)
}

/// Constant-time check that `secret` is the preimage of `expected` under
/// `algorithm`.
pub fn verify(secret: &Secret, expected: &SecretDigest, algorithm: HashAlgorithm) -> bool {
    let computed = digest(secret, algorithm);
    computed.0.ct_eq(&expected.0).into()
}

/// Strict fixed-width hex decoding. Accepts an optional `0x` prefix and
/// mixed case; rejects anything that is not exactly `N` bytes of hex.
pub fn decode_hex_fixed<const N: usize>(s: &str) -> CoordinatorResult<[u8; N]> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    if stripped.len() != N * 2 {
        return Err(CoordinatorError::InvalidHex(format!(
            "expected {} hex chars, got {}",
            N * 2,
            stripped.len()
        )));
    }
    let bytes = hex::decode(stripped)
        .map_err(|e| CoordinatorError::InvalidHex(format!("{} in {:?}", e, truncate(s))))?;
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn truncate(s: &str) -> String {
    if s.len() > 16 {
        format!("{}…", &s[..16])
    } else {
        s.to_string()
    }
}
