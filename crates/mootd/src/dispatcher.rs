//! Process-wide dispatcher
//!
//! The dispatcher owns the joined communities, the trigger table and the
//! outgoing packet queue. Incoming packets are routed by their 25-byte
//! prefix, decoded, pushed through the community pipeline (admission,
//! delay, dedup, store), offered to pending triggers, and opportunistically
//! forwarded. It never raises toward a peer: a packet either produces reply
//! traffic or is silently dropped and counted.

use crate::community::{
    Community, CommunityError, CommunityKind, DestinationSpec, ProcessFault,
};
use crate::config::OverlayParams;
use crate::conversion::PacketFault;
use crate::member::{Member, MemberRegistry};
use crate::message::{DestinationRecord, DistributionRecord, Message, Payload};
use crate::storage::Storage;
use crate::trigger::{TriggerAction, TriggerTable};
use moot_core::crypto::SIGNATURE_LENGTH;
use moot_core::types::{
    meta, CommunityId, FootprintPattern, MemberId, PermissionKind, PREFIX_LENGTH,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Traffic produced while handling one message: raw reply packets and
/// messages bound for store-and-forward.
#[derive(Default)]
pub struct Outbox {
    pub packets: Vec<(SocketAddr, Vec<u8>)>,
    pub forwards: Vec<Arc<Message>>,
}

impl Outbox {
    pub fn queue_packet(&mut self, address: SocketAddr, packet: Vec<u8>) {
        self.packets.push((address, packet));
    }

    pub fn queue_forward(&mut self, message: Arc<Message>) {
        self.forwards.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty() && self.forwards.is_empty()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// The process-wide hub: communities, triggers, and the packet queues.
pub struct Dispatcher {
    storage: Arc<Storage>,
    registry: Arc<MemberRegistry>,
    params: OverlayParams,
    communities: HashMap<CommunityId, Community>,
    triggers: TriggerTable,
    /// Packets awaiting transmission by the socket layer.
    outgoing: VecDeque<(SocketAddr, Vec<u8>)>,
    /// Last endpoint each member was seen at; serves member destinations.
    last_seen: HashMap<MemberId, SocketAddr>,
    dropped_packets: u64,
}

impl Dispatcher {
    pub fn new(storage: Arc<Storage>, registry: Arc<MemberRegistry>, params: OverlayParams) -> Self {
        Self {
            storage,
            registry,
            params,
            communities: HashMap::new(),
            triggers: TriggerTable::new(),
            outgoing: VecDeque::new(),
            last_seen: HashMap::new(),
            dropped_packets: 0,
        }
    }

    // -------------------------------------------------------------------
    // community lifecycle
    // -------------------------------------------------------------------

    /// Create a new community owned by `local_identity`; the founder's
    /// master-signed grants are persisted and forwarded.
    pub fn create_community(
        &mut self,
        local_identity: Arc<Member>,
        kind: Box<dyn CommunityKind>,
    ) -> Result<CommunityId, CommunityError> {
        let mut outbox = Outbox::default();
        let (community, grants) = Community::create(
            &self.storage,
            &self.registry,
            local_identity,
            kind,
            &self.params,
            &mut outbox,
        )?;
        let cid = community.cid();
        self.communities.insert(cid, community);
        self.flush_outbox(outbox)?;
        self.store_and_forward(grants)?;
        Ok(cid)
    }

    /// Join a discovered community from its master public blob.
    pub fn join_community(
        &mut self,
        master_blob: &[u8],
        local_identity: Arc<Member>,
        kind: Box<dyn CommunityKind>,
    ) -> Result<CommunityId, CommunityError> {
        let community = Community::join(
            &self.storage,
            &self.registry,
            master_blob,
            local_identity,
            kind,
            &self.params,
        )?;
        let cid = community.cid();
        self.communities.insert(cid, community);
        Ok(cid)
    }

    /// Re-instantiate every persisted community whose kind the factory
    /// recognizes. Returns the loaded community ids.
    pub fn load_communities(
        &mut self,
        factory: impl Fn(&str) -> Option<Box<dyn CommunityKind>>,
    ) -> Result<Vec<CommunityId>, CommunityError> {
        self.registry.load(&self.storage)?;
        let mut loaded = Vec::new();
        for row in self.storage.communities()? {
            let cid = CommunityId(row.cid);
            if self.communities.contains_key(&cid) {
                continue;
            }
            let Some(kind) = factory(&row.kind) else {
                warn!(%cid, kind = %row.kind, "no factory for community kind");
                continue;
            };
            let community =
                Community::from_row(&self.storage, &self.registry, &row, kind, &self.params)?;
            info!(%cid, "loaded community");
            self.communities.insert(cid, community);
            loaded.push(cid);
        }
        Ok(loaded)
    }

    pub fn community(&self, cid: CommunityId) -> Option<&Community> {
        self.communities.get(&cid)
    }

    pub fn community_mut(&mut self, cid: CommunityId) -> Option<&mut Community> {
        self.communities.get_mut(&cid)
    }

    /// The process-wide member registry.
    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    /// The process-wide persistent store.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    /// Seed a known endpoint for a community (bootstrap, tests).
    pub fn add_candidate(
        &mut self,
        cid: CommunityId,
        address: SocketAddr,
    ) -> Result<(), CommunityError> {
        self.storage.touch_incoming(cid, address, unix_now())?;
        Ok(())
    }

    /// Register an application trigger; the deadline is the configured
    /// trigger timeout from now.
    pub fn add_trigger(
        &mut self,
        pattern: FootprintPattern,
        action: TriggerAction,
        max_responses: u32,
    ) {
        self.triggers.add(
            pattern,
            action,
            max_responses,
            Instant::now() + self.params.trigger_timeout,
        );
    }

    // -------------------------------------------------------------------
    // outgoing API
    // -------------------------------------------------------------------

    /// Grant permissions in a community; see [`Community::authorize`].
    #[allow(clippy::too_many_arguments)]
    pub fn authorize(
        &mut self,
        cid: CommunityId,
        member: &Arc<Member>,
        pairs: &[(String, PermissionKind)],
        sign_with_master: bool,
        update_locally: bool,
        store_and_forward: bool,
    ) -> Result<Vec<Arc<Message>>, CommunityError> {
        let mut outbox = Outbox::default();
        let community = self
            .communities
            .get_mut(&cid)
            .ok_or(CommunityError::NotFound(cid))?;
        let messages = community.authorize(
            &self.storage,
            &self.registry,
            member,
            pairs,
            sign_with_master,
            update_locally,
            store_and_forward,
            &mut outbox,
        )?;
        self.flush_outbox(outbox)?;
        Ok(messages)
    }

    /// Withdraw permissions in a community; see [`Community::revoke`].
    #[allow(clippy::too_many_arguments)]
    pub fn revoke(
        &mut self,
        cid: CommunityId,
        member: &Arc<Member>,
        pairs: &[(String, PermissionKind)],
        sign_with_master: bool,
        update_locally: bool,
        store_and_forward: bool,
    ) -> Result<Vec<Arc<Message>>, CommunityError> {
        let mut outbox = Outbox::default();
        let community = self
            .communities
            .get_mut(&cid)
            .ok_or(CommunityError::NotFound(cid))?;
        let messages = community.revoke(
            &self.storage,
            &self.registry,
            member,
            pairs,
            sign_with_master,
            update_locally,
            store_and_forward,
            &mut outbox,
        )?;
        self.flush_outbox(outbox)?;
        Ok(messages)
    }

    /// Exercise a privilege in a community; see [`Community::permit`].
    #[allow(clippy::too_many_arguments)]
    pub fn permit(
        &mut self,
        cid: CommunityId,
        privilege_name: &str,
        payload: Payload,
        destination: DestinationSpec,
        sign_with_master: bool,
        update_locally: bool,
        store_and_forward: bool,
    ) -> Result<Arc<Message>, CommunityError> {
        let mut outbox = Outbox::default();
        let community = self
            .communities
            .get_mut(&cid)
            .ok_or(CommunityError::NotFound(cid))?;
        let message = community.permit(
            &self.storage,
            &self.registry,
            privilege_name,
            payload,
            destination,
            sign_with_master,
            update_locally,
            store_and_forward,
            &mut outbox,
        )?;
        self.flush_outbox(outbox)?;
        Ok(message)
    }

    /// Persist and transmit messages per their distribution and
    /// destination records.
    pub fn store_and_forward(
        &mut self,
        messages: Vec<Arc<Message>>,
    ) -> Result<(), CommunityError> {
        for message in messages {
            let cid = message.community();
            let community = self
                .communities
                .get_mut(&cid)
                .ok_or(CommunityError::NotFound(cid))?;
            community.store_message(&self.storage, &message)?;

            let targets: Vec<SocketAddr> = match message.destination() {
                DestinationRecord::Community { node_count } => {
                    self.storage.candidates(cid, *node_count, None)?
                }
                DestinationRecord::Address(address) => vec![*address],
                DestinationRecord::Members(members) => members
                    .iter()
                    .filter_map(|mid| self.last_seen.get(mid).copied())
                    .collect(),
            };
            for address in targets {
                self.send(address, message.packet().to_vec())?;
            }
        }
        Ok(())
    }

    /// Drain the packets awaiting transmission.
    pub fn take_outgoing(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.outgoing.drain(..).collect()
    }

    // -------------------------------------------------------------------
    // incoming pipeline
    // -------------------------------------------------------------------

    /// Feed one packet from the socket layer. Replays re-enqueued by
    /// triggers are processed in the same turn.
    pub fn on_incoming_packet(
        &mut self,
        address: SocketAddr,
        data: Vec<u8>,
    ) -> Result<(), CommunityError> {
        let mut queue: VecDeque<(SocketAddr, Vec<u8>)> = VecDeque::new();
        queue.push_back((address, data));
        while let Some((address, data)) = queue.pop_front() {
            self.process_packet(address, data, &mut queue)?;
        }
        Ok(())
    }

    /// Expire overdue triggers.
    pub fn tick(&mut self) {
        self.triggers.tick(Instant::now());
    }

    /// Broadcast each community's current Bloom window as a sync permit.
    pub fn periodic_sync(&mut self) -> Result<(), CommunityError> {
        let cids: Vec<CommunityId> = self.communities.keys().copied().collect();
        for cid in cids {
            let mut outbox = Outbox::default();
            let community = self
                .communities
                .get_mut(&cid)
                .ok_or(CommunityError::NotFound(cid))?;
            match community.sync_advertisement(&self.storage, &self.registry, &mut outbox) {
                Ok(message) => {
                    debug!(%cid, global_time = message.global_time(), "sync advertisement");
                }
                Err(error) => {
                    warn!(%cid, %error, "cannot build sync advertisement");
                    continue;
                }
            }
            self.flush_outbox(outbox)?;
        }
        Ok(())
    }

    fn process_packet(
        &mut self,
        address: SocketAddr,
        data: Vec<u8>,
        queue: &mut VecDeque<(SocketAddr, Vec<u8>)>,
    ) -> Result<(), CommunityError> {
        if data.len() < PREFIX_LENGTH + SIGNATURE_LENGTH {
            self.drop_packet("runt packet");
            return Ok(());
        }
        let Some(cid) = CommunityId::from_slice(&data[..20]) else {
            self.drop_packet("bad community id");
            return Ok(());
        };
        let Some(community) = self.communities.get(&cid) else {
            self.drop_packet("unknown community");
            return Ok(());
        };
        let Some(conversion) = community.conversion_for(&data[..PREFIX_LENGTH]) else {
            self.drop_packet("unknown wire version");
            return Ok(());
        };

        match conversion.decode_message(&data, community.privileges(), &self.registry) {
            Ok(message) => self.process_message(address, message, queue),
            Err(PacketFault::Drop(reason)) => {
                self.drop_packet(&reason);
                Ok(())
            }
            Err(PacketFault::Delay(delayed)) => {
                debug!(missing = %delayed.missing, "packet delayed for identity");
                self.triggers.add(
                    delayed.pattern,
                    TriggerAction::ReplayPackets(vec![(address, data)]),
                    1,
                    Instant::now() + self.params.trigger_timeout,
                );
                let mut outbox = Outbox::default();
                let community = self
                    .communities
                    .get_mut(&cid)
                    .ok_or(CommunityError::NotFound(cid))?;
                match community.permit(
                    &self.storage,
                    &self.registry,
                    meta::MISSING_IDENTITY,
                    Payload::MissingIdentity {
                        member: delayed.missing,
                    },
                    DestinationSpec::Address(address),
                    false,
                    false,
                    false,
                    &mut outbox,
                ) {
                    Ok(request) => outbox.queue_packet(address, request.packet().to_vec()),
                    Err(error) => warn!(%error, "cannot build identity request"),
                }
                self.flush_outbox(outbox)
            }
        }
    }

    fn process_message(
        &mut self,
        address: SocketAddr,
        message: Arc<Message>,
        queue: &mut VecDeque<(SocketAddr, Vec<u8>)>,
    ) -> Result<(), CommunityError> {
        let cid = message.community();
        self.storage.touch_incoming(cid, address, unix_now())?;
        self.last_seen.insert(message.signer().mid(), address);

        // Dedup and sequence-gap handling for syncable messages.
        let signer = message.signer().mid();
        let privilege_name = message.permission().privilege().name.clone();
        match message.distribution() {
            DistributionRecord::FullSync {
                sequence_number, ..
            } => {
                if self
                    .storage
                    .has_sequence(cid, signer, &privilege_name, *sequence_number)?
                {
                    debug!(%signer, sequence_number, "duplicate full-sync message");
                    return Ok(());
                }
                let expected = self.storage.max_sequence(cid, signer, &privilege_name)? + 1;
                if *sequence_number > expected {
                    return self.delay_for_sequence(
                        address,
                        message,
                        expected,
                    );
                }
            }
            DistributionRecord::LastSync { global_time } => {
                if self
                    .storage
                    .has_last_sync(cid, signer, &privilege_name, *global_time)?
                {
                    debug!(%signer, global_time, "duplicate last-sync message");
                    return Ok(());
                }
            }
            DistributionRecord::Direct { .. } => {}
        }

        // Community pipeline: admission, dispatch, store.
        let mut outbox = Outbox::default();
        let community = self
            .communities
            .get_mut(&cid)
            .ok_or(CommunityError::NotFound(cid))?;
        match community.on_incoming_message(
            &self.storage,
            &self.registry,
            address,
            &message,
            &mut outbox,
        ) {
            Ok(()) => {}
            Err(ProcessFault::Drop(reason)) => {
                self.drop_packet(&reason);
                return Ok(());
            }
            Err(ProcessFault::DelayByProof { pattern, request }) => {
                debug!(footprint = %message.footprint(), "message delayed for proof");
                self.triggers.add(
                    pattern,
                    TriggerAction::ReplayMessage(address, message),
                    1,
                    Instant::now() + self.params.trigger_timeout,
                );
                return self.send(address, request.packet().to_vec());
            }
            Err(ProcessFault::Storage(error)) => return Err(error.into()),
        }
        self.flush_outbox(outbox)?;

        // Offer the admitted message to waiting triggers and run what it
        // unblocks.
        let replays = self.triggers.on_message(address, &message);
        for (replay_address, packet) in replays.packets {
            queue.push_back((replay_address, packet));
        }
        for (replay_address, delayed) in replays.messages {
            self.process_message(replay_address, delayed, queue)?;
        }

        // Opportunistic forward of stored community-destined messages,
        // skipping the peer we got it from.
        if message.distribution().sequence_number().is_some()
            || matches!(message.distribution(), DistributionRecord::LastSync { .. })
        {
            if let DestinationRecord::Community { node_count } = message.destination() {
                let targets = self.storage.candidates(cid, *node_count, Some(address))?;
                for target in targets {
                    self.send(target, message.packet().to_vec())?;
                }
            }
        }
        Ok(())
    }

    /// Hold an out-of-order full-sync message until the gap closes and
    /// request the missing range from the sender.
    fn delay_for_sequence(
        &mut self,
        address: SocketAddr,
        message: Arc<Message>,
        expected: u64,
    ) -> Result<(), CommunityError> {
        let cid = message.community();
        let signer = message.signer().mid();
        let privilege_name = message.permission().privilege().name.clone();
        let Some(received) = message.distribution().sequence_number() else {
            return Ok(());
        };
        debug!(%signer, expected, received, "sequence gap, delaying message");

        let pattern = FootprintPattern::privilege(privilege_name.clone())
            .signed_by(signer)
            .with_sequence(received - 1);
        self.triggers.add(
            pattern,
            TriggerAction::ReplayMessage(address, message),
            1,
            Instant::now() + self.params.trigger_timeout,
        );

        let mut outbox = Outbox::default();
        let community = self
            .communities
            .get_mut(&cid)
            .ok_or(CommunityError::NotFound(cid))?;
        match community.permit(
            &self.storage,
            &self.registry,
            meta::MISSING_SEQUENCE,
            Payload::MissingSequence {
                member: signer,
                privilege: privilege_name,
                low: expected,
                high: received,
            },
            DestinationSpec::Address(address),
            false,
            false,
            false,
            &mut outbox,
        ) {
            Ok(request) => outbox.queue_packet(address, request.packet().to_vec()),
            Err(error) => warn!(%error, "cannot build missing-sequence request"),
        }
        self.flush_outbox(outbox)
    }

    fn flush_outbox(&mut self, outbox: Outbox) -> Result<(), CommunityError> {
        for (address, packet) in outbox.packets {
            self.send(address, packet)?;
        }
        if !outbox.forwards.is_empty() {
            self.store_and_forward(outbox.forwards)?;
        }
        Ok(())
    }

    fn send(&mut self, address: SocketAddr, packet: Vec<u8>) -> Result<(), CommunityError> {
        if let Some(cid) = CommunityId::from_slice(packet.get(..20).unwrap_or_default()) {
            self.storage.touch_outgoing(cid, address, unix_now())?;
        }
        self.outgoing.push_back((address, packet));
        Ok(())
    }

    fn drop_packet(&mut self, reason: &str) {
        self.dropped_packets += 1;
        debug!(reason, total = self.dropped_packets, "packet dropped");
    }
}
