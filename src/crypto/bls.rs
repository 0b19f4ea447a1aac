//! BLS12-381 signature implementation.
//!
//! Uses the `blst` crate for cryptographic operations. Node identities are
//! BLS key pairs: the compressed public key is hashed into the peer id, and
//! the secret key signs handshakes and promotion notices.

use thiserror::Error;

/// BLS secret key (32 bytes scalar).
#[derive(Clone)]
pub struct SecretKey(blst::min_pk::SecretKey);

/// BLS public key (48 bytes compressed G1).
#[derive(Clone, Debug)]
pub struct PublicKey(blst::min_pk::PublicKey);

/// BLS signature (96 bytes compressed G2).
#[derive(Clone, Debug)]
pub struct Signature(blst::min_pk::Signature);

/// Domain separation tag for signing.
const DST: &[u8] = b"TRUMAN-MESH-V1";

#[derive(Debug, Error)]
pub enum BlsError {
    #[error("Key generation failed")]
    KeyGeneration,

    #[error("Invalid secret key bytes")]
    InvalidSecretKey,

    #[error("Invalid public key bytes")]
    InvalidPublicKey,

    #[error("Invalid signature bytes")]
    InvalidSignature,

    #[error("Signature verification failed")]
    VerificationFailed,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Result<Self, BlsError> {
        use rand::RngCore;
        let mut ikm = [0u8; 32];
        rand::thread_rng()
            .try_fill_bytes(&mut ikm)
            .map_err(|_| BlsError::KeyGeneration)?;
        blst::min_pk::SecretKey::key_gen(&ikm, &[])
            .map(Self)
            .map_err(|_| BlsError::KeyGeneration)
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        blst::min_pk::SecretKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| BlsError::InvalidSecretKey)
    }

    /// Export to raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Derive the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message, DST, &[]))
    }
}

impl PublicKey {
    /// Create from compressed bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        blst::min_pk::PublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| BlsError::InvalidPublicKey)
    }

    /// Export to compressed bytes.
    pub fn to_bytes(&self) -> [u8; 48] {
        self.0.to_bytes()
    }

    /// Verify a signature against this public key.
    pub fn verify(&self, signature: &Signature, message: &[u8]) -> Result<(), BlsError> {
        let result = signature.0.verify(true, message, DST, &[], &self.0, true);
        if result == blst::BLST_ERROR::BLST_SUCCESS {
            Ok(())
        } else {
            Err(BlsError::VerificationFailed)
        }
    }
}

impl Signature {
    /// Create from compressed bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        blst::min_pk::Signature::from_bytes(bytes)
            .map(Self)
            .map_err(|_| BlsError::InvalidSignature)
    }

    /// Export to compressed bytes.
    pub fn to_bytes(&self) -> [u8; 96] {
        self.0.to_bytes()
    }
}

/// Verify `signature` over `message` given raw wire bytes for key and signature.
pub fn verify_raw(public_key: &[u8], signature: &[u8], message: &[u8]) -> Result<(), BlsError> {
    let public_key = PublicKey::from_bytes(public_key)?;
    let signature = Signature::from_bytes(signature)?;
    public_key.verify(&signature, message)
}
