//! Cryptographic primitives for the guild log protocol
//!
//! Identity is a secp256k1 keypair; the user id is the 33-byte compressed
//! public key as lowercase hex. Signatures are ECDSA over 32-byte digests
//! produced by the canonical encoder. The payload AEAD (AES-256-GCM with a
//! 96-bit IV) is a utility for clients that encrypt MESSAGE content
//! end-to-end; the core treats such content as an opaque string.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// secp256k1 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        Self { signing_key }
    }

    /// Create from a 32-byte secret scalar (deterministic recovery)
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        let signing_key =
            SigningKey::from_slice(seed).map_err(|_| Error::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    /// Secret scalar bytes, for persistence
    pub fn to_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    /// User id: lowercase hex of the compressed public key
    pub fn user_id(&self) -> String {
        let point = self.signing_key.verifying_key().to_encoded_point(true);
        hex::encode(point.as_bytes())
    }

    /// Sign a 32-byte digest, returning the 64-byte compact signature as hex
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<String> {
        let signature: Signature = self
            .signing_key
            .sign_prehash(digest)
            .map_err(|_| Error::InvalidSignature)?;
        Ok(hex::encode(signature.to_bytes()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("user_id", &self.user_id()).finish()
    }
}

/// Parse a user id into a verifying key
pub fn parse_user_id(user_id: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(user_id)?;
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|_| Error::InvalidPublicKey(user_id.to_string()))
}

/// Verify a compact hex signature over a 32-byte digest
pub fn verify_digest(user_id: &str, digest: &[u8; 32], signature_hex: &str) -> Result<()> {
    let key = parse_user_id(user_id)?;
    let bytes = hex::decode(signature_hex)?;
    let signature =
        Signature::from_slice(&bytes).map_err(|_| Error::InvalidSignature)?;
    key.verify_prehash(digest, &signature)
        .map_err(|_| Error::InvalidSignature)
}

/// ECDH shared secret between our keypair and another user's public key
pub fn ecdh(keypair: &KeyPair, their_user_id: &str) -> Result<[u8; 32]> {
    let theirs = parse_user_id(their_user_id)?;
    let shared = k256::ecdh::diffie_hellman(
        keypair.signing_key.as_nonzero_scalar(),
        theirs.as_affine(),
    );
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

/// Symmetric key for the payload AEAD: SHA-256 of the ECDH shared secret
pub fn payload_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    crate::canonical::sha256(shared_secret)
}

/// An encrypted opaque payload: base64 ciphertext plus hex 96-bit IV
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub ciphertext: String,
    pub iv: String,
}

/// Encrypt a payload with AES-256-GCM under a fresh random IV
pub fn encrypt_payload(key: &[u8; 32], plaintext: &[u8]) -> Result<SealedPayload> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Aead(e.to_string()))?;
    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| Error::Aead(e.to_string()))?;
    Ok(SealedPayload {
        ciphertext: BASE64.encode(ciphertext),
        iv: hex::encode(iv),
    })
}

/// Decrypt a payload produced by [`encrypt_payload`]
pub fn decrypt_payload(key: &[u8; 32], sealed: &SealedPayload) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Aead(e.to_string()))?;
    let iv = hex::decode(&sealed.iv)?;
    if iv.len() != 12 {
        return Err(Error::Aead("iv must be 96 bits".into()));
    }
    let ciphertext = BASE64
        .decode(&sealed.ciphertext)
        .map_err(|e| Error::Aead(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|e| Error::Aead(e.to_string()))
}
