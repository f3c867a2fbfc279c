//! Signing identities and member id derivation
//!
//! A member identity is an Ed25519 keypair. Public and private keys travel
//! as opaque blobs; the member identifier is the SHA-1 digest of the public
//! blob, which doubles as the community identifier when the key is a
//! community's master key.

use crate::error::{Error, Result};
use crate::types::MemberId;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha1::{Digest, Sha1};

/// Length of a detached signature in bytes, fixed by the key scheme.
pub const SIGNATURE_LENGTH: usize = 64;
/// Length of a public key blob in bytes.
pub const PUBLIC_BLOB_LENGTH: usize = 32;
/// Length of a private key blob in bytes.
pub const PRIVATE_BLOB_LENGTH: usize = 32;

/// Derive a member identifier from a public key blob.
///
/// `mid = SHA1(public_blob)`, 20 bytes.
pub fn member_id(public_blob: &[u8]) -> MemberId {
    let digest = Sha1::digest(public_blob);
    MemberId(digest.into())
}

/// Parse a public key blob, rejecting malformed input.
pub fn parse_public_blob(blob: &[u8]) -> Result<VerifyingKey> {
    let bytes: [u8; PUBLIC_BLOB_LENGTH] = blob
        .try_into()
        .map_err(|_| Error::InvalidKey(format!("public blob length {}", blob.len())))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| Error::InvalidKey("not a valid curve point".into()))
}

/// Verify a detached signature; false on mismatch or wrong-length signature.
pub fn verify(key: &VerifyingKey, bytes: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = <[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
        return false;
    };
    key.verify(bytes, &Signature::from_bytes(&signature)).is_ok()
}

/// A signing identity: private key plus derived public key and member id.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from seed bytes (deterministic, for tests and key recovery).
    pub fn from_seed(seed: &[u8; PRIVATE_BLOB_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstruct from a persisted private key blob.
    pub fn from_private_blob(blob: &[u8]) -> Result<Self> {
        let seed: [u8; PRIVATE_BLOB_LENGTH] = blob
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("private blob length {}", blob.len())))?;
        Ok(Self::from_seed(&seed))
    }

    /// The public key blob carried on the wire.
    pub fn public_blob(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }

    /// The private key blob persisted in the key store.
    pub fn private_blob(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The member id of this identity.
    pub fn member_id(&self) -> MemberId {
        member_id(&self.public_blob())
    }

    /// Sign bytes, producing a detached fixed-length signature.
    pub fn sign(&self, bytes: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(bytes).to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_is_sha1_of_blob() {
        let keypair = Keypair::from_seed(&[1; 32]);
        let blob = keypair.public_blob();
        assert_eq!(member_id(&blob), keypair.member_id());
        assert_eq!(member_id(&blob).0.len(), 20);
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"hello overlay");
        assert_eq!(signature.len(), SIGNATURE_LENGTH);
        assert!(verify(&keypair.verifying_key(), b"hello overlay", &signature));
    }

    #[test]
    fn test_single_bit_flip_fails_verification() {
        let keypair = Keypair::generate();
        let mut message = b"hello overlay".to_vec();
        let signature = keypair.sign(&message);
        message[0] ^= 0x01;
        assert!(!verify(&keypair.verifying_key(), &message, &signature));
    }

    #[test]
    fn test_verify_tolerates_wrong_length_signature() {
        let keypair = Keypair::generate();
        assert!(!verify(&keypair.verifying_key(), b"x", &[0u8; 10]));
    }

    #[test]
    fn test_malformed_blob_is_invalid_key() {
        assert!(matches!(
            parse_public_blob(&[0u8; 7]),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn test_private_blob_round_trip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_private_blob(&keypair.private_blob()).unwrap();
        assert_eq!(restored.public_blob(), keypair.public_blob());
    }
}
