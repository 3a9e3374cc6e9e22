use std::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Caller identity as seen by the ledger.
///
/// Identities handed out by the CLI are the hex encoding of an ed25519
/// verifying key; the ledger itself only compares them for equality.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(hex::encode(key.as_bytes()))
    }

    pub fn from_signing_key(key: &SigningKey) -> Self {
        Self::from_verifying_key(&key.verifying_key())
    }

    /// Parses a hex-encoded verifying key and returns it in canonical form.
    pub fn from_public_hex(value: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(value.trim()).map_err(|_| IdentityError::MalformedHex)?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::WrongLength(bytes.len()))?;
        let key = VerifyingKey::from_bytes(&raw).map_err(|_| IdentityError::InvalidKey)?;
        Ok(Self::from_verifying_key(&key))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Decodes a 32-byte ed25519 secret key from hex.
pub fn signing_key_from_hex(value: &str) -> Result<SigningKey, IdentityError> {
    let bytes = hex::decode(value.trim()).map_err(|_| IdentityError::MalformedHex)?;
    let raw: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::WrongLength(bytes.len()))?;
    Ok(SigningKey::from_bytes(&raw))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("key is not valid hex")]
    MalformedHex,
    #[error("key must be 32 bytes, got {0}")]
    WrongLength(usize),
    #[error("bytes are not a valid ed25519 public key")]
    InvalidKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::OsRng;

    #[test]
    fn secret_key_and_public_hex_agree() {
        let sk = SigningKey::generate(&mut OsRng);
        let from_secret = Identity::from_signing_key(&sk);

        let parsed_sk = signing_key_from_hex(&hex::encode(sk.to_bytes())).unwrap();
        assert_eq!(Identity::from_signing_key(&parsed_sk), from_secret);

        let upper = from_secret.as_str().to_uppercase();
        assert_eq!(Identity::from_public_hex(&upper).unwrap(), from_secret);
    }

    #[test]
    fn rejects_bad_key_material() {
        assert_eq!(
            signing_key_from_hex("zz").unwrap_err(),
            IdentityError::MalformedHex
        );
        assert_eq!(
            Identity::from_public_hex("abcd").unwrap_err(),
            IdentityError::WrongLength(2)
        );
    }
}
