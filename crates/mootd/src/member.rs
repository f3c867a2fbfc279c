//! Interned member directory and signing identities
//!
//! A `Member` is the canonical in-process representation of one public key:
//! two lookups with the same key always yield the same `Arc`. Members seen
//! with their private key are local identities and can sign and claim
//! sequence numbers.

use crate::storage::{Storage, StorageError};
use ed25519_dalek::VerifyingKey;
use moot_core::crypto::{self, Keypair, SIGNATURE_LENGTH};
use moot_core::types::{CommunityId, MemberId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Member errors
#[derive(Debug, Error)]
pub enum MemberError {
    #[error("invalid key: {0}")]
    Key(#[from] moot_core::Error),
    #[error("member {0} has no private key")]
    NoPrivateKey(MemberId),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// One canonical member: public key, derived mid, optional signing key.
pub struct Member {
    mid: MemberId,
    public_blob: Vec<u8>,
    verifying_key: VerifyingKey,
    keypair: Option<Keypair>,
}

impl Member {
    fn new(public_blob: &[u8], keypair: Option<Keypair>) -> Result<Self, MemberError> {
        let verifying_key = crypto::parse_public_blob(public_blob)?;
        Ok(Self {
            mid: crypto::member_id(public_blob),
            public_blob: public_blob.to_vec(),
            verifying_key,
            keypair,
        })
    }

    pub fn mid(&self) -> MemberId {
        self.mid
    }

    pub fn public_blob(&self) -> &[u8] {
        &self.public_blob
    }

    /// Whether this member is a local identity.
    pub fn can_sign(&self) -> bool {
        self.keypair.is_some()
    }

    /// The private key blob of a local identity, for the key store.
    pub fn private_blob(&self) -> Option<Vec<u8>> {
        self.keypair.as_ref().map(Keypair::private_blob)
    }

    /// Verify a detached signature; false on mismatch, never an error.
    pub fn verify(&self, bytes: &[u8], signature: &[u8]) -> bool {
        crypto::verify(&self.verifying_key, bytes, signature)
    }

    /// Sign bytes with this member's private key.
    pub fn sign(&self, bytes: &[u8]) -> Result<[u8; SIGNATURE_LENGTH], MemberError> {
        match &self.keypair {
            Some(keypair) => Ok(keypair.sign(bytes)),
            None => Err(MemberError::NoPrivateKey(self.mid)),
        }
    }

    /// Claim the next full-sync sequence number for this signer and
    /// privilege in a community. Monotonic and dense per
    /// (community, signer, privilege), persisted.
    pub fn claim_sequence_number(
        &self,
        storage: &Storage,
        community: CommunityId,
        privilege: &str,
    ) -> Result<u64, MemberError> {
        if !self.can_sign() {
            return Err(MemberError::NoPrivateKey(self.mid));
        }
        Ok(storage.next_sequence_number(community, self.mid, privilege)?)
    }
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("mid", &self.mid)
            .field("local", &self.can_sign())
            .finish()
    }
}

/// Cached directory of members, singleton-per-key within a process.
pub struct MemberRegistry {
    by_blob: RwLock<HashMap<Vec<u8>, Arc<Member>>>,
    by_mid: RwLock<HashMap<MemberId, Arc<Member>>>,
}

impl Default for MemberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self {
            by_blob: RwLock::new(HashMap::new()),
            by_mid: RwLock::new(HashMap::new()),
        }
    }

    /// Return the canonical member for a public blob, creating one on first
    /// sight. Malformed blobs fail with `InvalidKey`.
    pub fn get_or_intern(&self, public_blob: &[u8]) -> Result<Arc<Member>, MemberError> {
        if let Some(member) = self.by_blob.read().get(public_blob) {
            return Ok(member.clone());
        }
        let member = Arc::new(Member::new(public_blob, None)?);
        self.insert(member.clone());
        Ok(member)
    }

    /// Intern a local identity from its keypair. An existing public-only
    /// entry is upgraded; an existing local entry is kept as-is.
    pub fn intern_local(&self, keypair: Keypair) -> Result<Arc<Member>, MemberError> {
        let public_blob = keypair.public_blob();
        if let Some(member) = self.by_blob.read().get(&public_blob) {
            if member.can_sign() {
                return Ok(member.clone());
            }
        }
        let member = Arc::new(Member::new(&public_blob, Some(keypair))?);
        self.insert(member.clone());
        Ok(member)
    }

    /// Look up a member by its 20-byte id.
    pub fn get_by_mid(&self, mid: MemberId) -> Option<Arc<Member>> {
        self.by_mid.read().get(&mid).cloned()
    }

    /// Whether a blob has been interned.
    pub fn contains(&self, public_blob: &[u8]) -> bool {
        self.by_blob.read().contains_key(public_blob)
    }

    /// Re-intern everything the store knows: member blobs, upgraded to
    /// local identities where a private key is on file.
    pub fn load(&self, storage: &Storage) -> Result<(), MemberError> {
        for blob in storage.member_blobs()? {
            match storage.private_key(&blob)? {
                Some(private) => {
                    self.intern_local(Keypair::from_private_blob(&private)?)?;
                }
                None => {
                    self.get_or_intern(&blob)?;
                }
            }
        }
        Ok(())
    }

    fn insert(&self, member: Arc<Member>) {
        self.by_mid.write().insert(member.mid(), member.clone());
        self.by_blob
            .write()
            .insert(member.public_blob().to_vec(), member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_interning_is_singleton_per_key() {
        let registry = MemberRegistry::new();
        let keypair = Keypair::from_seed(&[1; 32]);
        let blob = keypair.public_blob();

        let a = registry.get_or_intern(&blob).unwrap();
        let b = registry.get_or_intern(&blob).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.get_by_mid(a.mid()).map(|m| m.mid()), Some(a.mid()));
    }

    #[test]
    fn test_malformed_blob_rejected() {
        let registry = MemberRegistry::new();
        assert!(matches!(
            registry.get_or_intern(&[1, 2, 3]),
            Err(MemberError::Key(_))
        ));
    }

    #[test]
    fn test_local_identity_upgrade() {
        let registry = MemberRegistry::new();
        let keypair = Keypair::from_seed(&[2; 32]);
        let blob = keypair.public_blob();

        let remote = registry.get_or_intern(&blob).unwrap();
        assert!(!remote.can_sign());

        let local = registry.intern_local(keypair).unwrap();
        assert!(local.can_sign());
        assert_eq!(local.mid(), remote.mid());

        // Later lookups see the upgraded identity.
        let again = registry.get_or_intern(&blob).unwrap();
        assert!(again.can_sign());
    }

    #[test]
    fn test_sign_requires_private_key() {
        let registry = MemberRegistry::new();
        let keypair = Keypair::from_seed(&[3; 32]);
        let remote = registry.get_or_intern(&keypair.public_blob()).unwrap();
        assert!(matches!(
            remote.sign(b"x"),
            Err(MemberError::NoPrivateKey(_))
        ));

        let local = registry.intern_local(keypair).unwrap();
        let signature = local.sign(b"x").unwrap();
        assert!(local.verify(b"x", &signature));
    }

    #[test]
    fn test_claim_sequence_number_is_monotonic() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let registry = MemberRegistry::new();
        let local = registry
            .intern_local(Keypair::from_seed(&[4; 32]))
            .unwrap();
        let cid = CommunityId([9; 20]);

        assert_eq!(local.claim_sequence_number(&storage, cid, "print").unwrap(), 1);
        assert_eq!(local.claim_sequence_number(&storage, cid, "print").unwrap(), 2);

        let other_cid = CommunityId([8; 20]);
        assert_eq!(
            local.claim_sequence_number(&storage, other_cid, "print").unwrap(),
            1
        );
    }

    #[test]
    fn test_registry_load_round_trip() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let keypair = Keypair::from_seed(&[5; 32]);
        let blob = keypair.public_blob();
        let mid = keypair.member_id();
        storage.put_member(mid, &blob).unwrap();
        storage.put_key(&blob, &keypair.private_blob()).unwrap();

        let registry = MemberRegistry::new();
        registry.load(&storage).unwrap();
        let member = registry.get_by_mid(mid).unwrap();
        assert!(member.can_sign());
    }
}
