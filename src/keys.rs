//! Key material and the signing capability used by [`crate::sign`].

use secp256k1::{All, Keypair, Message, Secp256k1};
use thiserror::Error;

/// Failures decoding the configured secret key. Always fatal, and raised
/// before any relay connection is opened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("no secret key configured")]
    Missing,
    #[error("secret key is not valid hex: {0}")]
    Hex(String),
    #[error("secret key is not valid bech32: {0}")]
    Bech32(String),
    #[error("expected an nsec key, got prefix '{0}'")]
    Prefix(String),
    #[error("secret key must be 32 bytes, got {0}")]
    Length(usize),
    #[error("secret key is not a valid secp256k1 scalar")]
    Scalar,
}

/// Signing capability chosen once at startup.
pub trait Signer: Send + Sync {
    /// 32-byte x-only public key.
    fn public_key(&self) -> [u8; 32];

    /// 64-byte BIP-340 Schnorr signature over a 32-byte digest.
    fn sign(&self, digest: &[u8; 32]) -> [u8; 64];

    fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }
}

/// [`Signer`] backed by an in-memory secp256k1 secret scalar.
pub struct SecretKeySigner {
    secp: Secp256k1<All>,
    keypair: Keypair,
}

impl SecretKeySigner {
    pub fn from_bytes(secret: &[u8; 32]) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, secret).map_err(|_| KeyError::Scalar)?;
        Ok(Self { secp, keypair })
    }

    /// Accepts 64 hex characters or an `nsec1…` string.
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        Self::from_bytes(&parse_secret_key(input)?)
    }
}

impl Signer for SecretKeySigner {
    fn public_key(&self) -> [u8; 32] {
        self.keypair.x_only_public_key().0.serialize()
    }

    fn sign(&self, digest: &[u8; 32]) -> [u8; 64] {
        let msg = Message::from_digest(*digest);
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        let bytes: &[u8; 64] = sig.as_ref();
        *bytes
    }
}

/// Decode a secret key given as hex or as a bech32 `nsec`.
pub fn parse_secret_key(input: &str) -> Result<[u8; 32], KeyError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(KeyError::Missing);
    }
    let bytes = if s.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(s).map_err(|e| KeyError::Hex(e.to_string()))?
    } else {
        let (hrp, data) = bech32::decode(s).map_err(|e| KeyError::Bech32(e.to_string()))?;
        let prefix = hrp.to_lowercase();
        if prefix != "nsec" {
            return Err(KeyError::Prefix(prefix));
        }
        data
    };
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| KeyError::Length(bytes.len()))
}
