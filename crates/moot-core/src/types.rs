//! Core protocol types for the moot overlay
//!
//! Identifiers are fixed-size newtypes; privilege policies are tagged
//! variants so that every encode/decode and storage decision is an
//! exhaustive match.

use std::fmt;

/// 20-byte fixed-size array used for community and member identifiers.
pub type Bytes20 = [u8; 20];

/// Length of a community identifier in bytes.
pub const COMMUNITY_ID_LENGTH: usize = 20;
/// Length of a member identifier in bytes.
pub const MEMBER_ID_LENGTH: usize = 20;
/// Length of an on-the-wire version tag in bytes.
pub const VERSION_ID_LENGTH: usize = 5;
/// Length of the dispatch prefix (cid ‖ vid) in bytes.
pub const PREFIX_LENGTH: usize = COMMUNITY_ID_LENGTH + VERSION_ID_LENGTH;

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Community identifier: SHA-1 of the community's master public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommunityId(pub Bytes20);

/// Member identifier: SHA-1 of a member's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub Bytes20);

/// On-the-wire version tag, 5 ASCII bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionId(pub [u8; VERSION_ID_LENGTH]);

impl CommunityId {
    /// The all-zero community id; its routing rows act as the bootstrap
    /// template copied into every newly created community.
    pub const BOOTSTRAP: CommunityId = CommunityId([0u8; COMMUNITY_ID_LENGTH]);

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(CommunityId)
    }
}

impl MemberId {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(MemberId)
    }
}

impl fmt::Debug for CommunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommunityId({})", hex::encode(self.0))
    }
}

impl fmt::Display for CommunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({})", hex::encode(self.0))
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionId({})", String::from_utf8_lossy(&self.0))
    }
}

// =============================================================================
// PRIVILEGES AND POLICIES
// =============================================================================

/// Whether a privilege may be exercised without authorization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Anyone may exercise the privilege.
    Public,
    /// Exercising the privilege requires an unrevoked Authorize grant.
    Restricted,
}

/// The three permission flavors acting on a privilege.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PermissionKind {
    Permit,
    Authorize,
    Revoke,
}

impl PermissionKind {
    /// Wire name of the permission kind.
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionKind::Permit => "permit",
            PermissionKind::Authorize => "authorize",
            PermissionKind::Revoke => "revoke",
        }
    }

    /// Parse a wire name; None for anything else.
    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "permit" => Some(PermissionKind::Permit),
            "authorize" => Some(PermissionKind::Authorize),
            "revoke" => Some(PermissionKind::Revoke),
            _ => None,
        }
    }
}

/// Order in which stored messages are offered during a sync reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDirection {
    /// Oldest global time first.
    Ascending,
    /// Newest global time first.
    Descending,
}

/// How messages carrying a privilege are stored and re-disseminated.
#[derive(Clone, Debug, PartialEq)]
pub enum DistributionPolicy {
    /// Sequence-numbered, gap-filled, stored forever for sync.
    FullSync {
        priority: u8,
        direction: SyncDirection,
        /// Bloom window capacity hint for messages of this privilege.
        capacity: usize,
        error_rate: f64,
    },
    /// Only the last `history_size` messages per signer are kept.
    LastSync {
        priority: u8,
        direction: SyncDirection,
        history_size: u64,
    },
    /// One-shot: never stored, never Bloom-indexed, never re-sent.
    Direct,
}

impl DistributionPolicy {
    /// Priority used to order sync replies; Direct messages never sync.
    pub fn priority(&self) -> u8 {
        match self {
            DistributionPolicy::FullSync { priority, .. } => *priority,
            DistributionPolicy::LastSync { priority, .. } => *priority,
            DistributionPolicy::Direct => 0,
        }
    }

    pub fn direction(&self) -> SyncDirection {
        match self {
            DistributionPolicy::FullSync { direction, .. } => *direction,
            DistributionPolicy::LastSync { direction, .. } => *direction,
            DistributionPolicy::Direct => SyncDirection::Ascending,
        }
    }

    /// Whether messages under this policy are persisted for anti-entropy.
    pub fn is_syncable(&self) -> bool {
        !matches!(self, DistributionPolicy::Direct)
    }
}

/// Who a message carrying a privilege is addressed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DestinationPolicy {
    /// Broadcast into the overlay, forwarded to at most `node_count` peers.
    Community { node_count: usize },
    /// Unicast to one endpoint.
    Address,
    /// Unicast to specific members.
    Member,
}

/// A named capability declared by a community kind.
#[derive(Clone, Debug, PartialEq)]
pub struct Privilege {
    pub name: String,
    pub resolution: Resolution,
    pub distribution: DistributionPolicy,
    pub destination: DestinationPolicy,
}

impl Privilege {
    pub fn new(
        name: impl Into<String>,
        resolution: Resolution,
        distribution: DistributionPolicy,
        destination: DestinationPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            resolution,
            distribution,
            destination,
        }
    }
}

/// Well-known privilege names every community carries.
pub mod meta {
    /// Bloom-window advertisement driving anti-entropy.
    pub const SYNC: &str = "dispersy-sync";
    /// Request for a range of missing full-sync sequence numbers.
    pub const MISSING_SEQUENCE: &str = "dispersy-missing-sequence";
    /// Request for the authorize chain justifying a delayed message.
    pub const MISSING_PROOF: &str = "dispersy-missing-proof";
    /// Carries a member's full public key blob.
    pub const IDENTITY: &str = "dispersy-identity";
    /// Request for the public key blob behind a member id.
    pub const MISSING_IDENTITY: &str = "dispersy-missing-identity";
}

// =============================================================================
// FOOTPRINTS
// =============================================================================

/// Textual fingerprint of a processed message, matched by pending triggers.
///
/// Rendered as `<privilege>:<signer-mid-hex>:<global-time>[:<sequence>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Footprint {
    pub privilege: String,
    pub signer: MemberId,
    pub global_time: u64,
    pub sequence_number: Option<u64>,
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.privilege, self.signer, self.global_time)?;
        if let Some(sequence_number) = self.sequence_number {
            write!(f, ":{}", sequence_number)?;
        }
        Ok(())
    }
}

/// Structured matcher over footprints; `None` fields are wildcards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FootprintPattern {
    pub privilege: Option<String>,
    pub signer: Option<MemberId>,
    pub global_time: Option<u64>,
    pub sequence_number: Option<u64>,
}

impl FootprintPattern {
    /// Pattern matching any message of the named privilege.
    pub fn privilege(name: impl Into<String>) -> Self {
        Self {
            privilege: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn signed_by(mut self, signer: MemberId) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn at_global_time(mut self, global_time: u64) -> Self {
        self.global_time = Some(global_time);
        self
    }

    pub fn with_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    /// True when every non-wildcard field equals the footprint's.
    pub fn matches(&self, footprint: &Footprint) -> bool {
        if let Some(privilege) = &self.privilege {
            if *privilege != footprint.privilege {
                return false;
            }
        }
        if let Some(signer) = &self.signer {
            if *signer != footprint.signer {
                return false;
            }
        }
        if let Some(global_time) = self.global_time {
            if global_time != footprint.global_time {
                return false;
            }
        }
        if let Some(sequence_number) = self.sequence_number {
            if footprint.sequence_number != Some(sequence_number) {
                return false;
            }
        }
        true
    }
}
