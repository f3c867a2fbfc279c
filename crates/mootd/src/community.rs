//! Community lifecycle and message routing
//!
//! A community manages participation in one overlay: its master identity,
//! the privilege table, the permission timeline, the Bloom windows indexing
//! stored messages, and the wire conversions. Incoming messages pass the
//! timeline gate before they reach handlers; outgoing authorize/revoke/
//! permit calls assemble, sign and locally apply new messages.

use crate::config::OverlayParams;
use crate::conversion::Conversion;
use crate::dispatcher::Outbox;
use crate::member::{Member, MemberError, MemberRegistry};
use crate::message::{
    DestinationRecord, DistributionRecord, Message, Payload, Permission,
};
use crate::storage::{CommunityRow, Storage, StorageError, SyncRow};
use crate::timeline::{Timeline, Verdict};
use moot_core::bloom::BloomFilter;
use moot_core::crypto::Keypair;
use moot_core::types::{
    meta, CommunityId, DestinationPolicy, DistributionPolicy, FootprintPattern,
    MemberId, PermissionKind, Privilege, Resolution, SyncDirection,
};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default forward fan-out for community-wide destinations.
const COMMUNITY_FANOUT: usize = 10;

/// Community errors
#[derive(Debug, Error)]
pub enum CommunityError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Member error: {0}")]
    Member(#[from] MemberError),
    #[error("Conversion error: {0}")]
    Conversion(#[from] crate::conversion::ConversionError),
    #[error("duplicate privilege name {0}")]
    DuplicatePrivilege(String),
    #[error("the dispersy-sync privilege has to be supplied")]
    MissingSyncPrivilege,
    #[error("community not found: {0}")]
    NotFound(CommunityId),
    #[error("unknown privilege {0}")]
    UnknownPrivilege(String),
    #[error("destination requires an explicit target")]
    MissingDestination,
    #[error("message not admissible at global time {0}")]
    NotAdmissible(u64),
    #[error("local dispatch rejected: {0}")]
    Rejected(String),
}

/// Why an incoming, already-decoded message did not complete the pipeline.
#[derive(Debug, Error)]
pub enum ProcessFault {
    /// Semantically impossible; discard and count.
    #[error("drop: {0}")]
    Drop(String),
    /// Admission undecidable pending an authorize chain; hold the message
    /// and transmit the request.
    #[error("delayed pending proof of authorization")]
    DelayByProof {
        pattern: FootprintPattern,
        request: Arc<Message>,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Destination argument for an outgoing permit, shaped by the privilege's
/// destination policy.
#[derive(Debug, Clone)]
pub enum DestinationSpec {
    /// Community-wide policies need no argument.
    Default,
    Address(SocketAddr),
    Members(Vec<MemberId>),
}

/// Application-defined behavior of one community kind: its privileges and
/// the handler receiving admitted permits.
pub trait CommunityKind: Send {
    /// Tag persisted with the community row, used to re-instantiate on load.
    fn kind_name(&self) -> &'static str;
    /// Application privileges; the well-known meta privileges are supplied
    /// by the community itself.
    fn privileges(&self) -> Vec<Privilege>;
    /// An admitted application permit, locally generated (address `None`)
    /// or received from a peer.
    fn on_permit(&mut self, address: Option<SocketAddr>, message: &Arc<Message>);
}

/// The well-known privileges every community carries.
fn meta_privileges() -> Vec<Privilege> {
    vec![
        Privilege::new(
            meta::SYNC,
            Resolution::Public,
            DistributionPolicy::Direct,
            DestinationPolicy::Community {
                node_count: COMMUNITY_FANOUT,
            },
        ),
        Privilege::new(
            meta::MISSING_SEQUENCE,
            Resolution::Public,
            DistributionPolicy::Direct,
            DestinationPolicy::Address,
        ),
        Privilege::new(
            meta::MISSING_PROOF,
            Resolution::Public,
            DistributionPolicy::Direct,
            DestinationPolicy::Address,
        ),
        Privilege::new(
            meta::IDENTITY,
            Resolution::Public,
            DistributionPolicy::Direct,
            DestinationPolicy::Address,
        ),
        Privilege::new(
            meta::MISSING_IDENTITY,
            Resolution::Public,
            DistributionPolicy::Direct,
            DestinationPolicy::Address,
        ),
    ]
}

/// One joined community.
pub struct Community {
    cid: CommunityId,
    database_id: u64,
    master: Arc<Member>,
    local_identity: Arc<Member>,
    privileges: HashMap<String, Arc<Privilege>>,
    /// Wire codecs; index 0 is the default used for encoding.
    conversions: Vec<Conversion>,
    stepping: u64,
    bloom_capacity: u32,
    bloom_error_rate: f64,
    /// Window i indexes stored packets with global_time in
    /// [i*stepping+1, (i+1)*stepping]. Grows on demand, never shrinks.
    windows: Vec<BloomFilter>,
    timeline: Timeline,
    sync_response_budget: usize,
    kind: Box<dyn CommunityKind>,
}

impl Community {
    // -------------------------------------------------------------------
    // lifecycle
    // -------------------------------------------------------------------

    /// Create a new community owned by `local_identity`. Generates the
    /// master key, persists the community rows, and authorizes the founder
    /// for every permission on every restricted privilege with
    /// master-signed messages (returned for store-and-forward).
    pub fn create(
        storage: &Storage,
        registry: &MemberRegistry,
        local_identity: Arc<Member>,
        kind: Box<dyn CommunityKind>,
        params: &OverlayParams,
        outbox: &mut Outbox,
    ) -> Result<(Self, Vec<Arc<Message>>), CommunityError> {
        let master_keypair = Keypair::generate();
        let master_blob = master_keypair.public_blob();
        let cid = CommunityId(moot_core::crypto::member_id(&master_blob).0);

        let row = storage.insert_community(
            cid,
            local_identity.public_blob(),
            &master_blob,
            Some(&master_keypair.private_blob()),
            kind.kind_name(),
        )?;
        registry.intern_local(master_keypair)?;
        Self::persist_identity(storage, &local_identity)?;

        let mut community = Self::assemble(storage, registry, &row, kind, params)?;

        let pairs: Vec<(String, PermissionKind)> = community
            .privileges
            .values()
            .filter(|privilege| privilege.resolution == Resolution::Restricted)
            .flat_map(|privilege| {
                [
                    PermissionKind::Permit,
                    PermissionKind::Authorize,
                    PermissionKind::Revoke,
                ]
                .into_iter()
                .map(|kind| (privilege.name.clone(), kind))
            })
            .collect();
        let founder = community.local_identity.clone();
        let messages = if pairs.is_empty() {
            Vec::new()
        } else {
            community.authorize(storage, registry, &founder, &pairs, true, true, false, outbox)?
        };

        info!(%cid, kind = community.kind.kind_name(), "created community");
        Ok((community, messages))
    }

    /// Join a discovered community from its master public blob.
    pub fn join(
        storage: &Storage,
        registry: &MemberRegistry,
        master_blob: &[u8],
        local_identity: Arc<Member>,
        kind: Box<dyn CommunityKind>,
        params: &OverlayParams,
    ) -> Result<Self, CommunityError> {
        let cid = CommunityId(moot_core::crypto::member_id(master_blob).0);
        let row = storage.insert_community(
            cid,
            local_identity.public_blob(),
            master_blob,
            None,
            kind.kind_name(),
        )?;
        Self::persist_identity(storage, &local_identity)?;
        let community = Self::assemble(storage, registry, &row, kind, params)?;
        info!(%cid, kind = community.kind.kind_name(), "joined community");
        Ok(community)
    }

    /// Re-instantiate a persisted community.
    pub fn from_row(
        storage: &Storage,
        registry: &MemberRegistry,
        row: &CommunityRow,
        kind: Box<dyn CommunityKind>,
        params: &OverlayParams,
    ) -> Result<Self, CommunityError> {
        Self::assemble(storage, registry, row, kind, params)
    }

    fn assemble(
        storage: &Storage,
        registry: &MemberRegistry,
        row: &CommunityRow,
        kind: Box<dyn CommunityKind>,
        params: &OverlayParams,
    ) -> Result<Self, CommunityError> {
        let cid = CommunityId(row.cid);
        let master = Self::intern_identity(storage, registry, &row.master_blob)?;
        let local_identity = Self::intern_identity(storage, registry, &row.user_blob)?;

        let mut privileges: HashMap<String, Arc<Privilege>> = HashMap::new();
        for privilege in meta_privileges().into_iter().chain(kind.privileges()) {
            let name = privilege.name.clone();
            if privileges.insert(name.clone(), Arc::new(privilege)).is_some() {
                return Err(CommunityError::DuplicatePrivilege(name));
            }
        }
        if !privileges.contains_key(meta::SYNC) {
            return Err(CommunityError::MissingSyncPrivilege);
        }

        let mut community = Self {
            cid,
            database_id: row.id,
            timeline: Timeline::new(master.mid()),
            master,
            local_identity,
            privileges,
            conversions: vec![Conversion::v00001(cid)],
            stepping: params.bloom_stepping,
            bloom_capacity: params.bloom_capacity,
            bloom_error_rate: params.bloom_error_rate,
            windows: vec![BloomFilter::new(
                params.bloom_capacity,
                params.bloom_error_rate,
            )],
            sync_response_budget: params.sync_response_budget,
            kind,
        };
        community.restore(storage, registry)?;
        Ok(community)
    }

    /// Persist a local identity's member row and private key, so a reload
    /// restores its signing capability the way the master's is restored.
    fn persist_identity(storage: &Storage, member: &Arc<Member>) -> Result<(), CommunityError> {
        storage.put_member(member.mid(), member.public_blob())?;
        if let Some(private_blob) = member.private_blob() {
            storage.put_key(member.public_blob(), &private_blob)?;
        }
        Ok(())
    }

    fn intern_identity(
        storage: &Storage,
        registry: &MemberRegistry,
        public_blob: &[u8],
    ) -> Result<Arc<Member>, CommunityError> {
        match storage.private_key(public_blob)? {
            Some(private) => Ok(registry.intern_local(
                Keypair::from_private_blob(&private).map_err(MemberError::Key)?,
            )?),
            None => Ok(registry.get_or_intern(public_blob)?),
        }
    }

    /// Rebuild windows and the permission ledger from stored packets.
    fn restore(
        &mut self,
        storage: &Storage,
        registry: &MemberRegistry,
    ) -> Result<(), CommunityError> {
        let rows = storage.window_rows(self.cid, 1, u64::MAX)?;
        for row in rows {
            if let Err(moot_core::Error::Saturated { .. }) =
                self.window_mut(row.global_time).add(&row.packet)
            {
                debug!(global_time = row.global_time, "window saturated during restore");
            }
            match self.conversions[0].decode_message(&row.packet, &self.privileges, registry) {
                Ok(message) => {
                    self.timeline.update(&message);
                    self.timeline.advance(message.global_time());
                }
                Err(fault) => {
                    warn!(?fault, "stored packet no longer decodes");
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // accessors
    // -------------------------------------------------------------------

    pub fn cid(&self) -> CommunityId {
        self.cid
    }

    pub fn database_id(&self) -> u64 {
        self.database_id
    }

    pub fn master(&self) -> &Arc<Member> {
        &self.master
    }

    pub fn local_identity(&self) -> &Arc<Member> {
        &self.local_identity
    }

    pub fn privileges(&self) -> &HashMap<String, Arc<Privilege>> {
        &self.privileges
    }

    pub fn privilege(&self, name: &str) -> Option<&Arc<Privilege>> {
        self.privileges.get(name)
    }

    /// The codec used for encoding outgoing messages.
    pub fn conversion(&self) -> &Conversion {
        &self.conversions[0]
    }

    /// Find the codec accepting a 25-byte packet prefix.
    pub fn conversion_for(&self, prefix: &[u8]) -> Option<&Conversion> {
        self.conversions
            .iter()
            .find(|conversion| conversion.prefix()[..] == *prefix)
    }

    /// Register an additional wire version; `default` makes it the encoder.
    pub fn add_conversion(&mut self, conversion: Conversion, default: bool) {
        if default {
            self.conversions.insert(0, conversion);
        } else {
            self.conversions.push(conversion);
        }
    }

    pub fn global_time(&self) -> u64 {
        self.timeline.global_time()
    }

    pub fn claim_global_time(&mut self) -> u64 {
        self.timeline.claim_global_time()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    // -------------------------------------------------------------------
    // bloom windows
    // -------------------------------------------------------------------

    fn window_index(&self, global_time: u64) -> usize {
        ((global_time.max(1) - 1) / self.stepping) as usize
    }

    fn window_start(&self, index: usize) -> u64 {
        index as u64 * self.stepping + 1
    }

    fn window_mut(&mut self, global_time: u64) -> &mut BloomFilter {
        let index = self.window_index(global_time);
        while self.windows.len() <= index {
            self.windows
                .push(BloomFilter::new(self.bloom_capacity, self.bloom_error_rate));
        }
        &mut self.windows[index]
    }

    /// The window indexing `global_time`, if it exists yet.
    pub fn window(&self, global_time: u64) -> Option<&BloomFilter> {
        self.windows.get(self.window_index(global_time))
    }

    /// The highest-indexed window as `(start global time, filter)`.
    pub fn current_window(&self) -> (u64, &BloomFilter) {
        let index = self.windows.len() - 1;
        (self.window_start(index), &self.windows[index])
    }

    fn rebuild_window(&mut self, storage: &Storage, index: usize) -> Result<(), StorageError> {
        let start = self.window_start(index);
        let mut filter = BloomFilter::new(self.bloom_capacity, self.bloom_error_rate);
        for row in storage.window_rows(self.cid, start, start + self.stepping - 1)? {
            if filter.add(&row.packet).is_err() {
                debug!(index, "window saturated during rebuild");
            }
        }
        while self.windows.len() <= index {
            self.windows
                .push(BloomFilter::new(self.bloom_capacity, self.bloom_error_rate));
        }
        self.windows[index] = filter;
        Ok(())
    }

    // -------------------------------------------------------------------
    // outgoing messages
    // -------------------------------------------------------------------

    /// Grant `member` the listed (privilege, permission kind) pairs. One
    /// global time is claimed for the batch; each message claims its own
    /// sequence number. Returns the signed messages.
    #[allow(clippy::too_many_arguments)]
    pub fn authorize(
        &mut self,
        storage: &Storage,
        registry: &MemberRegistry,
        member: &Arc<Member>,
        pairs: &[(String, PermissionKind)],
        sign_with_master: bool,
        update_locally: bool,
        store_and_forward: bool,
        outbox: &mut Outbox,
    ) -> Result<Vec<Arc<Message>>, CommunityError> {
        self.grant(
            storage,
            registry,
            member,
            pairs,
            false,
            sign_with_master,
            update_locally,
            store_and_forward,
            outbox,
        )
    }

    /// Withdraw previously granted (privilege, permission kind) pairs.
    #[allow(clippy::too_many_arguments)]
    pub fn revoke(
        &mut self,
        storage: &Storage,
        registry: &MemberRegistry,
        member: &Arc<Member>,
        pairs: &[(String, PermissionKind)],
        sign_with_master: bool,
        update_locally: bool,
        store_and_forward: bool,
        outbox: &mut Outbox,
    ) -> Result<Vec<Arc<Message>>, CommunityError> {
        self.grant(
            storage,
            registry,
            member,
            pairs,
            true,
            sign_with_master,
            update_locally,
            store_and_forward,
            outbox,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn grant(
        &mut self,
        storage: &Storage,
        registry: &MemberRegistry,
        member: &Arc<Member>,
        pairs: &[(String, PermissionKind)],
        revoke: bool,
        sign_with_master: bool,
        update_locally: bool,
        store_and_forward: bool,
        outbox: &mut Outbox,
    ) -> Result<Vec<Arc<Message>>, CommunityError> {
        let signer = if sign_with_master {
            self.master.clone()
        } else {
            self.local_identity.clone()
        };
        let global_time = self.timeline.claim_global_time();

        let mut messages = Vec::with_capacity(pairs.len());
        for (name, kind) in pairs {
            let privilege = self
                .privileges
                .get(name)
                .ok_or_else(|| CommunityError::UnknownPrivilege(name.clone()))?
                .clone();
            let sequence_number = signer.claim_sequence_number(storage, self.cid, name)?;
            let permission = if revoke {
                Permission::Revoke {
                    privilege,
                    to: member.clone(),
                    kind: *kind,
                }
            } else {
                Permission::Authorize {
                    privilege,
                    to: member.clone(),
                    kind: *kind,
                }
            };
            let distribution = DistributionRecord::FullSync {
                global_time,
                sequence_number,
            };
            let packet = self
                .conversion()
                .encode_message(&signer, &distribution, &permission)?;
            messages.push(Message::new(
                self.cid,
                signer.clone(),
                distribution,
                DestinationRecord::Community {
                    node_count: COMMUNITY_FANOUT,
                },
                permission,
                packet,
            ));
        }

        if update_locally {
            for message in &messages {
                self.process_local(storage, registry, message, outbox)?;
            }
        }
        if store_and_forward {
            for message in &messages {
                outbox.queue_forward(message.clone());
            }
        }
        Ok(messages)
    }

    /// Exercise a privilege: assemble, sign and return a permit message.
    #[allow(clippy::too_many_arguments)]
    pub fn permit(
        &mut self,
        storage: &Storage,
        registry: &MemberRegistry,
        privilege_name: &str,
        payload: Payload,
        destination: DestinationSpec,
        sign_with_master: bool,
        update_locally: bool,
        store_and_forward: bool,
        outbox: &mut Outbox,
    ) -> Result<Arc<Message>, CommunityError> {
        let signer = if sign_with_master {
            self.master.clone()
        } else {
            self.local_identity.clone()
        };
        let privilege = self
            .privileges
            .get(privilege_name)
            .ok_or_else(|| CommunityError::UnknownPrivilege(privilege_name.to_owned()))?
            .clone();

        let distribution = match &privilege.distribution {
            DistributionPolicy::FullSync { .. } => DistributionRecord::FullSync {
                global_time: self.timeline.claim_global_time(),
                sequence_number: signer.claim_sequence_number(
                    storage,
                    self.cid,
                    privilege_name,
                )?,
            },
            DistributionPolicy::LastSync { .. } => DistributionRecord::LastSync {
                global_time: self.timeline.claim_global_time(),
            },
            DistributionPolicy::Direct => DistributionRecord::Direct {
                global_time: self.timeline.global_time(),
            },
        };

        let destination = match (&privilege.destination, destination) {
            (DestinationPolicy::Community { node_count }, DestinationSpec::Default) => {
                DestinationRecord::Community {
                    node_count: *node_count,
                }
            }
            (DestinationPolicy::Address, DestinationSpec::Address(address)) => {
                DestinationRecord::Address(address)
            }
            (DestinationPolicy::Member, DestinationSpec::Members(members)) => {
                DestinationRecord::Members(members)
            }
            _ => return Err(CommunityError::MissingDestination),
        };

        let permission = Permission::Permit { privilege, payload };
        let packet = self
            .conversion()
            .encode_message(&signer, &distribution, &permission)?;
        let message = Message::new(
            self.cid,
            signer,
            distribution,
            destination,
            permission,
            packet,
        );

        if update_locally {
            self.process_local(storage, registry, &message, outbox)?;
        }
        if store_and_forward {
            outbox.queue_forward(message.clone());
        }
        Ok(message)
    }

    /// Build the periodic sync advertisement: the current window's start
    /// and filter, broadcast community-wide.
    pub fn sync_advertisement(
        &mut self,
        storage: &Storage,
        registry: &MemberRegistry,
        outbox: &mut Outbox,
    ) -> Result<Arc<Message>, CommunityError> {
        let (window_start, filter) = self.current_window();
        let payload = Payload::Sync {
            window_start,
            filter: filter.clone(),
        };
        self.permit(
            storage,
            registry,
            meta::SYNC,
            payload,
            DestinationSpec::Default,
            false,
            false,
            true,
            outbox,
        )
    }

    // -------------------------------------------------------------------
    // message pipeline
    // -------------------------------------------------------------------

    /// Apply a locally generated message: timeline gate, then dispatch.
    /// Persisting is the store-and-forward stage's job.
    fn process_local(
        &mut self,
        storage: &Storage,
        registry: &MemberRegistry,
        message: &Arc<Message>,
        outbox: &mut Outbox,
    ) -> Result<(), CommunityError> {
        let verdict = self.timeline.check(
            message.signer(),
            message.permission(),
            message.global_time(),
        );
        if !verdict.is_allowed() {
            return Err(CommunityError::NotAdmissible(message.global_time()));
        }
        self.timeline.advance(message.global_time());
        match message.permission() {
            Permission::Authorize { .. } | Permission::Revoke { .. } => {
                self.timeline.update(message);
                Ok(())
            }
            Permission::Permit { .. } => self
                .dispatch_permit(storage, registry, None, message, outbox)
                .map_err(|fault| CommunityError::Rejected(fault.to_string())),
        }
    }

    /// Route one verified incoming message: timeline gate, dispatch by
    /// permission kind, then persist per its distribution.
    pub fn on_incoming_message(
        &mut self,
        storage: &Storage,
        registry: &MemberRegistry,
        address: SocketAddr,
        message: &Arc<Message>,
        outbox: &mut Outbox,
    ) -> Result<(), ProcessFault> {
        let verdict = self.timeline.check(
            message.signer(),
            message.permission(),
            message.global_time(),
        );
        match verdict {
            Verdict::Denied { .. } => {
                return Err(ProcessFault::Drop(format!(
                    "{} not admissible at {}",
                    message.signer().mid(),
                    message.global_time()
                )));
            }
            Verdict::Undecidable => {
                let request = self
                    .permit(
                        storage,
                        registry,
                        meta::MISSING_PROOF,
                        Payload::MissingProof {
                            member: message.signer().mid(),
                            global_time: message.global_time(),
                        },
                        DestinationSpec::Address(address),
                        false,
                        false,
                        false,
                        outbox,
                    )
                    .map_err(|e| ProcessFault::Drop(format!("cannot request proof: {e}")))?;
                // The awaited authorize names the same privilege; replaying
                // re-checks admission.
                let pattern =
                    FootprintPattern::privilege(message.permission().privilege().name.clone());
                return Err(ProcessFault::DelayByProof { pattern, request });
            }
            Verdict::Allowed { .. } => {}
        }

        self.timeline.advance(message.global_time());
        match message.permission() {
            Permission::Authorize { .. } | Permission::Revoke { .. } => {
                self.timeline.update(message);
            }
            Permission::Permit { .. } => {
                self.dispatch_permit(storage, registry, Some(address), message, outbox)?;
            }
        }
        self.store_message(storage, message)?;
        Ok(())
    }

    /// Persist a message according to its distribution record and index it
    /// in the matching Bloom window.
    pub fn store_message(
        &mut self,
        storage: &Storage,
        message: &Arc<Message>,
    ) -> Result<(), StorageError> {
        let privilege = message.permission().privilege().clone();
        let signer = message.signer().mid();
        match message.distribution() {
            DistributionRecord::FullSync {
                global_time,
                sequence_number,
            } => {
                storage.store_sync(
                    self.cid,
                    &SyncRow {
                        member: signer.0,
                        privilege: privilege.name.clone(),
                        global_time: *global_time,
                        sequence_number: *sequence_number,
                        packet: message.packet().to_vec(),
                    },
                )?;
                if self.window_mut(*global_time).add(message.packet()).is_err() {
                    warn!(global_time, "bloom window saturated");
                }
            }
            DistributionRecord::LastSync { global_time } => {
                let history_size = match &privilege.distribution {
                    DistributionPolicy::LastSync { history_size, .. } => *history_size,
                    _ => u64::MAX,
                };
                let rows = storage.last_sync_rows(self.cid, signer, &privilege.name)?;
                if rows.len() as u64 >= history_size {
                    if let Some(oldest) = rows.first() {
                        if *global_time < oldest.global_time {
                            debug!(
                                global_time,
                                privilege = %privilege.name,
                                "below retained history, not stored"
                            );
                            return Ok(());
                        }
                    }
                }
                storage.store_sync(
                    self.cid,
                    &SyncRow {
                        member: signer.0,
                        privilege: privilege.name.clone(),
                        global_time: *global_time,
                        sequence_number: 0,
                        packet: message.packet().to_vec(),
                    },
                )?;
                if self.window_mut(*global_time).add(message.packet()).is_err() {
                    warn!(global_time, "bloom window saturated");
                }
                // Evict oldest-first beyond the cap, then rebuild the
                // windows the evictions touched.
                let mut rows = storage.last_sync_rows(self.cid, signer, &privilege.name)?;
                let mut stale_windows = BTreeSet::new();
                while rows.len() as u64 > history_size {
                    let oldest = rows.remove(0);
                    storage.remove_sync(self.cid, &oldest)?;
                    stale_windows.insert(self.window_index(oldest.global_time));
                }
                for index in stale_windows {
                    self.rebuild_window(storage, index)?;
                }
            }
            DistributionRecord::Direct { .. } => {}
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // permit dispatch
    // -------------------------------------------------------------------

    fn dispatch_permit(
        &mut self,
        storage: &Storage,
        registry: &MemberRegistry,
        address: Option<SocketAddr>,
        message: &Arc<Message>,
        outbox: &mut Outbox,
    ) -> Result<(), ProcessFault> {
        let Permission::Permit { privilege, payload } = message.permission() else {
            return Err(ProcessFault::Drop("not a permit".into()));
        };
        match (privilege.name.as_str(), payload) {
            (
                meta::SYNC,
                Payload::Sync {
                    window_start,
                    filter,
                },
            ) => {
                if let Some(address) = address {
                    self.on_sync(storage, address, *window_start, filter, outbox)?;
                }
                Ok(())
            }
            (
                meta::MISSING_SEQUENCE,
                Payload::MissingSequence {
                    member,
                    privilege,
                    low,
                    high,
                },
            ) => {
                if let Some(address) = address {
                    self.on_missing_sequence(
                        storage, address, *member, privilege, *low, *high, outbox,
                    )?;
                }
                Ok(())
            }
            (
                meta::MISSING_PROOF,
                Payload::MissingProof {
                    member,
                    global_time,
                },
            ) => {
                if let Some(address) = address {
                    self.on_missing_proof(address, *member, *global_time, outbox);
                }
                Ok(())
            }
            (meta::IDENTITY, Payload::Identity { public_blob }) => {
                let member = registry
                    .get_or_intern(public_blob)
                    .map_err(|e| ProcessFault::Drop(format!("bad identity: {e}")))?;
                storage.put_member(member.mid(), public_blob)?;
                debug!(mid = %member.mid(), "interned member identity");
                Ok(())
            }
            (meta::MISSING_IDENTITY, Payload::MissingIdentity { member }) => {
                if let Some(address) = address {
                    self.on_missing_identity(storage, registry, address, *member, outbox)?;
                }
                Ok(())
            }
            (
                meta::SYNC
                | meta::MISSING_SEQUENCE
                | meta::MISSING_PROOF
                | meta::IDENTITY
                | meta::MISSING_IDENTITY,
                _,
            ) => Err(ProcessFault::Drop("malformed meta payload".into())),
            _ => {
                self.kind.on_permit(address, message);
                Ok(())
            }
        }
    }

    /// Answer a peer's window advertisement: send stored packets of the
    /// window the peer's filter does not claim, highest privilege priority
    /// first, global time per the privilege's sync direction, bounded by
    /// the per-peer budget.
    fn on_sync(
        &mut self,
        storage: &Storage,
        address: SocketAddr,
        window_start: u64,
        filter: &BloomFilter,
        outbox: &mut Outbox,
    ) -> Result<(), ProcessFault> {
        let window_end = window_start.saturating_add(self.stepping - 1);
        let rows = storage.window_rows(self.cid, window_start, window_end)?;

        let mut groups: HashMap<&str, Vec<&SyncRow>> = HashMap::new();
        for row in &rows {
            groups.entry(row.privilege.as_str()).or_default().push(row);
        }

        let mut ordered: Vec<(&Arc<Privilege>, Vec<&SyncRow>)> = Vec::new();
        for (name, group) in groups {
            // Unknown privileges cannot be stored; the lookup only fails
            // for rows written by a newer community kind.
            if let Some(privilege) = self.privileges.get(name) {
                ordered.push((privilege, group));
            }
        }
        ordered.sort_by(|(a, _), (b, _)| {
            b.distribution
                .priority()
                .cmp(&a.distribution.priority())
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut sent = 0usize;
        for (privilege, mut group) in ordered {
            match privilege.distribution.direction() {
                SyncDirection::Ascending => group.sort_by_key(|row| row.global_time),
                SyncDirection::Descending => {
                    group.sort_by_key(|row| std::cmp::Reverse(row.global_time))
                }
            }
            for row in group {
                if sent >= self.sync_response_budget {
                    debug!(address = %address, sent, "sync budget exhausted");
                    return Ok(());
                }
                if filter.contains(&row.packet) {
                    continue;
                }
                outbox.queue_packet(address, row.packet.clone());
                sent += 1;
            }
        }
        Ok(())
    }

    /// Answer a missing-sequence request with the stored packets of the
    /// range, in sequence order.
    #[allow(clippy::too_many_arguments)]
    fn on_missing_sequence(
        &mut self,
        storage: &Storage,
        address: SocketAddr,
        member: MemberId,
        privilege: &str,
        low: u64,
        high: u64,
        outbox: &mut Outbox,
    ) -> Result<(), ProcessFault> {
        let rows = storage.sequence_range(self.cid, member, privilege, low, high)?;
        for row in rows.iter().take(self.sync_response_budget) {
            outbox.queue_packet(address, row.packet.clone());
        }
        Ok(())
    }

    /// Answer a missing-proof request with the authorize/revoke packets
    /// concerning the member at or before the given global time.
    fn on_missing_proof(
        &mut self,
        address: SocketAddr,
        member: MemberId,
        global_time: u64,
        outbox: &mut Outbox,
    ) {
        for message in self.timeline.proof_for_member(member, global_time) {
            outbox.queue_packet(address, message.packet().to_vec());
        }
    }

    /// Answer a missing-identity request when the member is known: reply
    /// with an identity permit carrying the full public blob.
    fn on_missing_identity(
        &mut self,
        storage: &Storage,
        registry: &MemberRegistry,
        address: SocketAddr,
        member: MemberId,
        outbox: &mut Outbox,
    ) -> Result<(), ProcessFault> {
        let Some(known) = registry.get_by_mid(member) else {
            debug!(mid = %member, "missing-identity for unknown member");
            return Ok(());
        };
        let reply = self
            .permit(
                storage,
                registry,
                meta::IDENTITY,
                Payload::Identity {
                    public_blob: known.public_blob().to_vec(),
                },
                DestinationSpec::Address(address),
                false,
                false,
                false,
                outbox,
            )
            .map_err(|e| ProcessFault::Drop(format!("cannot build identity reply: {e}")))?;
        outbox.queue_packet(address, reply.packet().to_vec());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Community kind used by tests: a restricted full-sync "print"
    /// privilege and a public last-sync "status" privilege with history 1.
    pub(crate) struct TestKind {
        pub received: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl TestKind {
        pub(crate) fn new() -> (Self, Arc<Mutex<Vec<(String, Vec<u8>)>>>) {
            let received = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    received: received.clone(),
                },
                received,
            )
        }
    }

    impl CommunityKind for TestKind {
        fn kind_name(&self) -> &'static str {
            "test"
        }

        fn privileges(&self) -> Vec<Privilege> {
            vec![
                Privilege::new(
                    "print",
                    Resolution::Restricted,
                    DistributionPolicy::FullSync {
                        priority: 128,
                        direction: SyncDirection::Ascending,
                        capacity: 100,
                        error_rate: 0.01,
                    },
                    DestinationPolicy::Community { node_count: 10 },
                ),
                Privilege::new(
                    "status",
                    Resolution::Public,
                    DistributionPolicy::LastSync {
                        priority: 64,
                        direction: SyncDirection::Ascending,
                        history_size: 1,
                    },
                    DestinationPolicy::Community { node_count: 10 },
                ),
            ]
        }

        fn on_permit(&mut self, _address: Option<SocketAddr>, message: &Arc<Message>) {
            if let Permission::Permit {
                payload: Payload::Bytes(bytes),
                privilege,
            } = message.permission()
            {
                self.received
                    .lock()
                    .push((privilege.name.clone(), bytes.clone()));
            }
        }
    }
}
