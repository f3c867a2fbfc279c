//! Typed message records
//!
//! A `Message` is immutable once created: signer, distribution and
//! destination records, the permission being exercised, and the full wire
//! packet (prefix, encoded body, detached signature) it travels as.

use crate::member::Member;
use moot_core::bloom::BloomFilter;
use moot_core::types::{
    CommunityId, Footprint, MemberId, PermissionKind, Privilege,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// How this particular message is stored and re-disseminated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DistributionRecord {
    FullSync { global_time: u64, sequence_number: u64 },
    LastSync { global_time: u64 },
    Direct { global_time: u64 },
}

impl DistributionRecord {
    pub fn global_time(&self) -> u64 {
        match self {
            DistributionRecord::FullSync { global_time, .. } => *global_time,
            DistributionRecord::LastSync { global_time } => *global_time,
            DistributionRecord::Direct { global_time } => *global_time,
        }
    }

    pub fn sequence_number(&self) -> Option<u64> {
        match self {
            DistributionRecord::FullSync {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        }
    }
}

/// Who this particular message is addressed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DestinationRecord {
    /// Broadcast into the overlay, forwarded to at most `node_count` peers.
    Community { node_count: usize },
    /// Unicast to one endpoint.
    Address(SocketAddr),
    /// Unicast to specific members.
    Members(Vec<MemberId>),
}

/// The body carried by a Permit message.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Opaque application bytes, interpreted by the community kind.
    Bytes(Vec<u8>),
    /// Bloom-window advertisement: the window's first global time and its
    /// filter over stored packet bytes.
    Sync {
        window_start: u64,
        filter: BloomFilter,
    },
    /// Request for full-sync sequence numbers `low..=high` of a signer.
    MissingSequence {
        member: MemberId,
        privilege: String,
        low: u64,
        high: u64,
    },
    /// Request for the authorize/revoke chain concerning a member at or
    /// before a global time.
    MissingProof { member: MemberId, global_time: u64 },
    /// A member's full public key blob.
    Identity { public_blob: Vec<u8> },
    /// Request for the public key blob behind a member id.
    MissingIdentity { member: MemberId },
}

/// The permission a message exercises.
#[derive(Clone, Debug)]
pub enum Permission {
    /// Use the privilege.
    Permit {
        privilege: Arc<Privilege>,
        payload: Payload,
    },
    /// Grant `to` a permission kind on the privilege.
    Authorize {
        privilege: Arc<Privilege>,
        to: Arc<Member>,
        kind: PermissionKind,
    },
    /// Withdraw such a grant.
    Revoke {
        privilege: Arc<Privilege>,
        to: Arc<Member>,
        kind: PermissionKind,
    },
}

impl Permission {
    pub fn privilege(&self) -> &Arc<Privilege> {
        match self {
            Permission::Permit { privilege, .. } => privilege,
            Permission::Authorize { privilege, .. } => privilege,
            Permission::Revoke { privilege, .. } => privilege,
        }
    }

    /// The permission kind the signer needs on the privilege for this
    /// message to be admissible.
    pub fn exercised_kind(&self) -> PermissionKind {
        match self {
            Permission::Permit { .. } => PermissionKind::Permit,
            Permission::Authorize { .. } => PermissionKind::Authorize,
            Permission::Revoke { .. } => PermissionKind::Revoke,
        }
    }
}

/// An authenticated, decoded (or locally assembled) overlay message.
pub struct Message {
    community: CommunityId,
    signer: Arc<Member>,
    distribution: DistributionRecord,
    destination: DestinationRecord,
    permission: Permission,
    /// Full wire bytes: prefix ‖ encoded body ‖ detached signature.
    packet: Vec<u8>,
}

impl Message {
    pub fn new(
        community: CommunityId,
        signer: Arc<Member>,
        distribution: DistributionRecord,
        destination: DestinationRecord,
        permission: Permission,
        packet: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            community,
            signer,
            distribution,
            destination,
            permission,
            packet,
        })
    }

    pub fn community(&self) -> CommunityId {
        self.community
    }

    pub fn signer(&self) -> &Arc<Member> {
        &self.signer
    }

    pub fn distribution(&self) -> &DistributionRecord {
        &self.distribution
    }

    pub fn destination(&self) -> &DestinationRecord {
        &self.destination
    }

    pub fn permission(&self) -> &Permission {
        &self.permission
    }

    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    pub fn global_time(&self) -> u64 {
        self.distribution.global_time()
    }

    /// The fingerprint pending triggers are matched against.
    pub fn footprint(&self) -> Footprint {
        Footprint {
            privilege: self.permission.privilege().name.clone(),
            signer: self.signer.mid(),
            global_time: self.global_time(),
            sequence_number: self.distribution.sequence_number(),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("community", &self.community)
            .field("footprint", &self.footprint().to_string())
            .field("kind", &self.permission.exercised_kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberRegistry;
    use moot_core::crypto::Keypair;
    use moot_core::types::{
        DestinationPolicy, DistributionPolicy, Resolution, SyncDirection,
    };

    fn privilege() -> Arc<Privilege> {
        Arc::new(Privilege::new(
            "print",
            Resolution::Restricted,
            DistributionPolicy::FullSync {
                priority: 128,
                direction: SyncDirection::Ascending,
                capacity: 100,
                error_rate: 0.01,
            },
            DestinationPolicy::Community { node_count: 10 },
        ))
    }

    #[test]
    fn test_footprint_carries_sequence_for_full_sync() {
        let registry = MemberRegistry::new();
        let signer = registry
            .intern_local(Keypair::from_seed(&[1; 32]))
            .unwrap();
        let message = Message::new(
            CommunityId([5; 20]),
            signer.clone(),
            DistributionRecord::FullSync {
                global_time: 7,
                sequence_number: 3,
            },
            DestinationRecord::Community { node_count: 10 },
            Permission::Permit {
                privilege: privilege(),
                payload: Payload::Bytes(b"hi".to_vec()),
            },
            vec![],
        );
        let footprint = message.footprint();
        assert_eq!(footprint.privilege, "print");
        assert_eq!(footprint.signer, signer.mid());
        assert_eq!(footprint.global_time, 7);
        assert_eq!(footprint.sequence_number, Some(3));
    }

    #[test]
    fn test_exercised_kind() {
        let registry = MemberRegistry::new();
        let to = registry
            .intern_local(Keypair::from_seed(&[2; 32]))
            .unwrap();
        let permission = Permission::Authorize {
            privilege: privilege(),
            to,
            kind: PermissionKind::Permit,
        };
        assert_eq!(permission.exercised_kind(), PermissionKind::Authorize);
    }
}
