//! Wire codec, on-the-wire version 00001
//!
//! ```text
//! 0..20   : community id (cid)
//! 20..25  : version tag (vid, 5 ASCII bytes)
//! 25..L-S : encoded container map
//! L-S..L  : detached signature (S bytes, fixed by the key scheme)
//! ```
//!
//! The signature covers `cid ‖ vid ‖ encoded container`. The container map
//! carries `signed_by`, `distribution` and `permission`; the destination is
//! reconstructed from the privilege on decode. A member reference is either
//! a full public blob or a bare 20-byte mid; an unknown mid delays the
//! packet until the identity arrives.

use crate::member::{Member, MemberError, MemberRegistry};
use crate::message::{
    DestinationRecord, DistributionRecord, Message, Payload, Permission,
};
use moot_core::bloom::BloomFilter;
use moot_core::crypto::SIGNATURE_LENGTH;
use moot_core::encoding::{self, Value};
use moot_core::types::{
    meta, CommunityId, DestinationPolicy, DistributionPolicy, FootprintPattern,
    MemberId, PermissionKind, Privilege, VersionId, MEMBER_ID_LENGTH, PREFIX_LENGTH,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;

/// The current on-the-wire version.
pub const VERSION_00001: VersionId = VersionId(*b"00001");

/// Encoding errors; decoding faults are [`PacketFault`].
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Member error: {0}")]
    Member(#[from] MemberError),
}

/// Why an incoming packet could not be turned into a message.
#[derive(Debug)]
pub enum PacketFault {
    /// Malformed, unverifiable, or semantically impossible; discard.
    Drop(String),
    /// Undecodable until a member's public key arrives; hold and request.
    Delay(DelayedPacket),
}

/// A packet held back by an unknown member reference.
#[derive(Debug)]
pub struct DelayedPacket {
    /// The member whose public blob is missing.
    pub missing: MemberId,
    /// Footprint of the identity message that will unblock the packet.
    pub pattern: FootprintPattern,
}

impl DelayedPacket {
    fn for_member(missing: MemberId) -> Self {
        Self {
            missing,
            // Any peer may relay the identity blob, so the signer is left
            // unconstrained; a replay that still cannot resolve the mid is
            // delayed again.
            pattern: FootprintPattern::privilege(meta::IDENTITY),
        }
    }
}

/// Codec for one community and wire version.
pub struct Conversion {
    community: CommunityId,
    version: VersionId,
    prefix: [u8; PREFIX_LENGTH],
}

impl Conversion {
    pub fn new(community: CommunityId, version: VersionId) -> Self {
        let mut prefix = [0u8; PREFIX_LENGTH];
        prefix[..20].copy_from_slice(&community.0);
        prefix[20..].copy_from_slice(&version.0);
        Self {
            community,
            version,
            prefix,
        }
    }

    pub fn v00001(community: CommunityId) -> Self {
        Self::new(community, VERSION_00001)
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    /// The 25-byte dispatch prefix this codec produces and accepts.
    pub fn prefix(&self) -> &[u8; PREFIX_LENGTH] {
        &self.prefix
    }

    // -------------------------------------------------------------------
    // encode
    // -------------------------------------------------------------------

    /// Encode and sign a message body. The signer must hold a private key.
    pub fn encode_message(
        &self,
        signer: &Member,
        distribution: &DistributionRecord,
        permission: &Permission,
    ) -> Result<Vec<u8>, ConversionError> {
        let container = Value::map(vec![
            ("signed_by", Value::bytes(signer.public_blob())),
            ("distribution", encode_distribution(distribution)),
            ("permission", encode_permission(permission)),
        ]);

        let mut data = self.prefix.to_vec();
        data.extend_from_slice(&encoding::encode(&container));
        let signature = signer.sign(&data)?;
        data.extend_from_slice(&signature);
        Ok(data)
    }

    // -------------------------------------------------------------------
    // decode
    // -------------------------------------------------------------------

    /// Decode a packet into a message. Verifies the signature, resolves
    /// member references against the registry, and reconstructs the
    /// distribution and destination records from the privilege.
    pub fn decode_message(
        &self,
        data: &[u8],
        privileges: &HashMap<String, Arc<Privilege>>,
        registry: &MemberRegistry,
    ) -> Result<Arc<Message>, PacketFault> {
        if data.len() < PREFIX_LENGTH + SIGNATURE_LENGTH + 1 {
            return Err(PacketFault::Drop(format!("{} byte packet", data.len())));
        }
        if data[..PREFIX_LENGTH] != self.prefix {
            return Err(PacketFault::Drop("foreign packet prefix".into()));
        }

        let body_end = data.len() - SIGNATURE_LENGTH;
        let signed = &data[..body_end];
        let signature = &data[body_end..];
        let container = encoding::decode(&data[PREFIX_LENGTH..body_end])
            .map_err(|e| PacketFault::Drop(format!("malformed container: {e}")))?;
        if !matches!(container, Value::Map(_)) {
            return Err(PacketFault::Drop("container is not a map".into()));
        }

        // signer
        let signed_by = container
            .get("signed_by")
            .and_then(Value::as_bytes)
            .ok_or_else(|| PacketFault::Drop("missing signed_by".into()))?;
        let signer = resolve_member(signed_by, registry)?;
        if !signer.verify(signed, signature) {
            return Err(PacketFault::Drop("invalid signature".into()));
        }

        // permission
        let permission_map = container
            .get("permission")
            .filter(|v| matches!(v, Value::Map(_)))
            .ok_or_else(|| PacketFault::Drop("missing permission map".into()))?;
        let privilege_name = permission_map
            .get("privilege_name")
            .and_then(Value::as_text)
            .ok_or_else(|| PacketFault::Drop("missing privilege name".into()))?;
        let privilege = privileges
            .get(privilege_name)
            .ok_or_else(|| PacketFault::Drop(format!("unknown privilege {privilege_name}")))?
            .clone();
        let permission_type = permission_map
            .get("type")
            .and_then(Value::as_text)
            .ok_or_else(|| PacketFault::Drop("missing permission type".into()))?;
        let permission = match permission_type {
            "permit" => {
                let payload_bytes = permission_map
                    .get("payload")
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| PacketFault::Drop("missing payload".into()))?;
                Permission::Permit {
                    payload: decode_payload(&privilege.name, payload_bytes)?,
                    privilege,
                }
            }
            "authorize" | "revoke" => {
                let to = permission_map
                    .get("to")
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| PacketFault::Drop("missing to-member".into()))?;
                let to = resolve_member(to, registry)?;
                let kind = permission_map
                    .get("permission_name")
                    .and_then(Value::as_text)
                    .and_then(PermissionKind::from_str)
                    .ok_or_else(|| PacketFault::Drop("unknown permission name".into()))?;
                if permission_type == "authorize" {
                    Permission::Authorize {
                        privilege,
                        to,
                        kind,
                    }
                } else {
                    Permission::Revoke {
                        privilege,
                        to,
                        kind,
                    }
                }
            }
            other => {
                return Err(PacketFault::Drop(format!("unknown permission type {other}")));
            }
        };

        // distribution: authorize/revoke messages always travel full-sync
        // (the ledger needs dense per-signer ordering); permits are shaped
        // by the privilege's policy.
        let distribution_map = container
            .get("distribution")
            .filter(|v| matches!(v, Value::Map(_)))
            .ok_or_else(|| PacketFault::Drop("missing distribution map".into()))?;
        let global_time = decode_positive(distribution_map, "global_time")?;
        let full_sync = !matches!(permission, Permission::Permit { .. });
        let distribution = if full_sync {
            DistributionRecord::FullSync {
                global_time,
                sequence_number: decode_positive(distribution_map, "sequence_number")?,
            }
        } else {
            match &permission.privilege().distribution {
                DistributionPolicy::FullSync { .. } => DistributionRecord::FullSync {
                    global_time,
                    sequence_number: decode_positive(distribution_map, "sequence_number")?,
                },
                DistributionPolicy::LastSync { .. } => {
                    DistributionRecord::LastSync { global_time }
                }
                DistributionPolicy::Direct => DistributionRecord::Direct { global_time },
            }
        };

        // destination, reconstructed from the privilege
        let destination = match &permission.privilege().destination {
            DestinationPolicy::Community { node_count } => DestinationRecord::Community {
                node_count: *node_count,
            },
            DestinationPolicy::Address => {
                DestinationRecord::Address(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            }
            DestinationPolicy::Member => DestinationRecord::Members(Vec::new()),
        };

        Ok(Message::new(
            self.community,
            signer,
            distribution,
            destination,
            permission,
            data.to_vec(),
        ))
    }
}

/// Resolve a wire member reference: a bare 20-byte mid looks up the
/// registry (delaying the packet when absent), anything else must be a
/// valid public blob and is interned.
fn resolve_member(
    reference: &[u8],
    registry: &MemberRegistry,
) -> Result<Arc<Member>, PacketFault> {
    if reference.len() == MEMBER_ID_LENGTH {
        let mid = MemberId::from_slice(reference)
            .ok_or_else(|| PacketFault::Drop("bad member id".into()))?;
        return registry
            .get_by_mid(mid)
            .ok_or_else(|| PacketFault::Delay(DelayedPacket::for_member(mid)));
    }
    registry
        .get_or_intern(reference)
        .map_err(|e| PacketFault::Drop(format!("bad member key: {e}")))
}

fn encode_distribution(distribution: &DistributionRecord) -> Value {
    match distribution {
        DistributionRecord::FullSync {
            global_time,
            sequence_number,
        } => Value::map(vec![
            ("global_time", Value::UInt(*global_time)),
            ("sequence_number", Value::UInt(*sequence_number)),
        ]),
        DistributionRecord::LastSync { global_time }
        | DistributionRecord::Direct { global_time } => {
            Value::map(vec![("global_time", Value::UInt(*global_time))])
        }
    }
}

fn encode_permission(permission: &Permission) -> Value {
    match permission {
        Permission::Permit { privilege, payload } => Value::map(vec![
            ("type", Value::text("permit")),
            ("privilege_name", Value::text(&privilege.name)),
            ("payload", Value::bytes(encode_payload(payload))),
        ]),
        Permission::Authorize {
            privilege,
            to,
            kind,
        } => Value::map(vec![
            ("type", Value::text("authorize")),
            ("privilege_name", Value::text(&privilege.name)),
            ("to", Value::bytes(to.mid().0.to_vec())),
            ("permission_name", Value::text(kind.as_str())),
        ]),
        Permission::Revoke {
            privilege,
            to,
            kind,
        } => Value::map(vec![
            ("type", Value::text("revoke")),
            ("privilege_name", Value::text(&privilege.name)),
            ("to", Value::bytes(to.mid().0.to_vec())),
            ("permission_name", Value::text(kind.as_str())),
        ]),
    }
}

fn encode_payload(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::Bytes(bytes) => bytes.clone(),
        Payload::Sync {
            window_start,
            filter,
        } => encoding::encode(&Value::map(vec![
            ("global_time", Value::UInt(*window_start)),
            ("bloom_filter", Value::bytes(filter.to_bytes())),
        ])),
        Payload::MissingSequence {
            member,
            privilege,
            low,
            high,
        } => encoding::encode(&Value::map(vec![
            ("member", Value::bytes(member.0.to_vec())),
            ("privilege_name", Value::text(privilege)),
            ("missing_low", Value::UInt(*low)),
            ("missing_high", Value::UInt(*high)),
        ])),
        Payload::MissingProof {
            member,
            global_time,
        } => encoding::encode(&Value::map(vec![
            ("member", Value::bytes(member.0.to_vec())),
            ("global_time", Value::UInt(*global_time)),
        ])),
        Payload::Identity { public_blob } => encoding::encode(&Value::map(vec![(
            "public_blob",
            Value::bytes(public_blob.clone()),
        )])),
        Payload::MissingIdentity { member } => encoding::encode(&Value::map(vec![(
            "member",
            Value::bytes(member.0.to_vec()),
        )])),
    }
}

/// Meta privileges carry structured payloads; everything else stays opaque
/// for the community kind to interpret.
fn decode_payload(privilege_name: &str, bytes: &[u8]) -> Result<Payload, PacketFault> {
    let structured = |bytes: &[u8]| {
        encoding::decode(bytes)
            .map_err(|e| PacketFault::Drop(format!("malformed payload: {e}")))
    };
    match privilege_name {
        meta::SYNC => {
            let map = structured(bytes)?;
            let window_start = decode_positive(&map, "global_time")?;
            let filter_bytes = map
                .get("bloom_filter")
                .and_then(Value::as_bytes)
                .ok_or_else(|| PacketFault::Drop("missing bloom filter".into()))?;
            let filter = BloomFilter::from_bytes(filter_bytes)
                .map_err(|e| PacketFault::Drop(format!("bad bloom filter: {e}")))?;
            Ok(Payload::Sync {
                window_start,
                filter,
            })
        }
        meta::MISSING_SEQUENCE => {
            let map = structured(bytes)?;
            let member = decode_mid(&map, "member")?;
            let privilege = map
                .get("privilege_name")
                .and_then(Value::as_text)
                .ok_or_else(|| PacketFault::Drop("missing privilege name".into()))?
                .to_owned();
            let low = decode_positive(&map, "missing_low")?;
            let high = decode_positive(&map, "missing_high")?;
            if low > high {
                return Err(PacketFault::Drop(format!("empty range {low}..{high}")));
            }
            Ok(Payload::MissingSequence {
                member,
                privilege,
                low,
                high,
            })
        }
        meta::MISSING_PROOF => {
            let map = structured(bytes)?;
            Ok(Payload::MissingProof {
                member: decode_mid(&map, "member")?,
                global_time: decode_positive(&map, "global_time")?,
            })
        }
        meta::IDENTITY => {
            let map = structured(bytes)?;
            let public_blob = map
                .get("public_blob")
                .and_then(Value::as_bytes)
                .ok_or_else(|| PacketFault::Drop("missing public blob".into()))?;
            Ok(Payload::Identity {
                public_blob: public_blob.to_vec(),
            })
        }
        meta::MISSING_IDENTITY => {
            let map = structured(bytes)?;
            Ok(Payload::MissingIdentity {
                member: decode_mid(&map, "member")?,
            })
        }
        _ => Ok(Payload::Bytes(bytes.to_vec())),
    }
}

fn decode_positive(map: &Value, key: &str) -> Result<u64, PacketFault> {
    let value = map
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| PacketFault::Drop(format!("missing {key}")))?;
    if value == 0 {
        return Err(PacketFault::Drop(format!("non-positive {key}")));
    }
    Ok(value)
}

fn decode_mid(map: &Value, key: &str) -> Result<MemberId, PacketFault> {
    map.get(key)
        .and_then(Value::as_bytes)
        .and_then(MemberId::from_slice)
        .ok_or_else(|| PacketFault::Drop(format!("bad {key}")))
}
