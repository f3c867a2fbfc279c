//! Permission ledger and global-time clock
//!
//! The timeline answers one question: was this signer allowed to exercise
//! this permission at that logical time, given the authorize/revoke history
//! observed so far. It also owns the community's monotonically advancing
//! global-time counter.

use crate::member::Member;
use crate::message::{Message, Permission};
use moot_core::types::{MemberId, PermissionKind, Resolution};
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of an admissibility check.
#[derive(Debug)]
pub enum Verdict {
    /// Admissible; `proof` is the chain justifying the decision (empty for
    /// public privileges and the master's implicit grant).
    Allowed { proof: Vec<Arc<Message>> },
    /// Inadmissible and decidable: the latest applicable fact is a revoke.
    Denied { proof: Vec<Arc<Message>> },
    /// No applicable fact observed yet; a prerequisite authorize may still
    /// be in flight.
    Undecidable,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verb {
    Grant,
    Revoke,
}

struct LedgerEntry {
    global_time: u64,
    verb: Verb,
    /// The authorize/revoke message that caused this entry.
    message: Arc<Message>,
}

impl LedgerEntry {
    /// Entries are ordered by (global_time, granter mid, packet bytes);
    /// the byte tail breaks ties between facts at the same logical time.
    fn sort_key(&self) -> (u64, MemberId, &[u8]) {
        (
            self.global_time,
            self.message.signer().mid(),
            self.message.packet(),
        )
    }
}

type LedgerKey = (MemberId, String, PermissionKind);

/// The authority ledger and clock of one community.
pub struct Timeline {
    master: MemberId,
    /// Next value handed out by `claim_global_time`.
    global_time: u64,
    ledger: HashMap<LedgerKey, Vec<LedgerEntry>>,
}

impl Timeline {
    pub fn new(master: MemberId) -> Self {
        Self {
            master,
            global_time: 1,
            ledger: HashMap::new(),
        }
    }

    /// The current logical time, without claiming it.
    pub fn global_time(&self) -> u64 {
        self.global_time
    }

    /// Return the current counter, then increment it. Strictly increasing
    /// within a process lifetime, never reused.
    pub fn claim_global_time(&mut self) -> u64 {
        let claimed = self.global_time;
        self.global_time += 1;
        claimed
    }

    /// Advance the clock past an observed remote global time, so local
    /// claims order after everything already seen.
    pub fn advance(&mut self, observed: u64) {
        self.global_time = self.global_time.max(observed + 1);
    }

    /// Decide admissibility of `permission` exercised by `signer` at
    /// `global_time`, given the history known now.
    pub fn check(&self, signer: &Member, permission: &Permission, global_time: u64) -> Verdict {
        // The master is implicitly authorized for everything at time 0.
        if signer.mid() == self.master {
            return Verdict::Allowed { proof: Vec::new() };
        }
        let privilege = permission.privilege();
        if privilege.resolution == Resolution::Public {
            return Verdict::Allowed { proof: Vec::new() };
        }

        let key = (
            signer.mid(),
            privilege.name.clone(),
            permission.exercised_kind(),
        );
        let deciding = self
            .ledger
            .get(&key)
            .and_then(|entries| entries.iter().rev().find(|e| e.global_time <= global_time));
        match deciding {
            Some(entry) if entry.verb == Verb::Grant => Verdict::Allowed {
                proof: vec![entry.message.clone()],
            },
            Some(entry) => Verdict::Denied {
                proof: vec![entry.message.clone()],
            },
            None => Verdict::Undecidable,
        }
    }

    /// Fold a validated authorize/revoke message into the ledger. The fact
    /// takes effect at and after its own global time. Idempotent for a
    /// packet already applied.
    pub fn update(&mut self, message: &Arc<Message>) {
        let (privilege, to, kind, verb) = match message.permission() {
            Permission::Authorize {
                privilege,
                to,
                kind,
            } => (privilege, to, *kind, Verb::Grant),
            Permission::Revoke {
                privilege,
                to,
                kind,
            } => (privilege, to, *kind, Verb::Revoke),
            Permission::Permit { .. } => return,
        };

        let key = (to.mid(), privilege.name.clone(), kind);
        let entries = self.ledger.entry(key).or_default();
        if entries
            .iter()
            .any(|e| e.message.packet() == message.packet())
        {
            return;
        }
        let entry = LedgerEntry {
            global_time: message.global_time(),
            verb,
            message: message.clone(),
        };
        let position = entries
            .binary_search_by(|existing| existing.sort_key().cmp(&entry.sort_key()))
            .unwrap_or_else(|position| position);
        entries.insert(position, entry);
        self.advance(message.global_time());
    }

    /// All authorize/revoke messages concerning `member` at or before
    /// `global_time`; the reply to a missing-proof request.
    pub fn proof_for_member(&self, member: MemberId, global_time: u64) -> Vec<Arc<Message>> {
        let mut proof: Vec<Arc<Message>> = Vec::new();
        for ((subject, _, _), entries) in &self.ledger {
            if *subject != member {
                continue;
            }
            for entry in entries {
                if entry.global_time <= global_time
                    && !proof
                        .iter()
                        .any(|m| m.packet() == entry.message.packet())
                {
                    proof.push(entry.message.clone());
                }
            }
        }
        proof.sort_by_key(|m| m.global_time());
        proof
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberRegistry;
    use crate::message::{DestinationRecord, DistributionRecord, Payload};
    use moot_core::crypto::Keypair;
    use moot_core::types::{
        DestinationPolicy, DistributionPolicy, Privilege, SyncDirection,
    };

    fn restricted_privilege() -> Arc<Privilege> {
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

    fn authorize_message(
        granter: &Arc<Member>,
        to: &Arc<Member>,
        kind: PermissionKind,
        global_time: u64,
        packet: Vec<u8>,
    ) -> Arc<Message> {
        Message::new(
            moot_core::types::CommunityId([1; 20]),
            granter.clone(),
            DistributionRecord::FullSync {
                global_time,
                sequence_number: 1,
            },
            DestinationRecord::Community { node_count: 10 },
            Permission::Authorize {
                privilege: restricted_privilege(),
                to: to.clone(),
                kind,
            },
            packet,
        )
    }

    fn revoke_message(
        granter: &Arc<Member>,
        to: &Arc<Member>,
        kind: PermissionKind,
        global_time: u64,
        packet: Vec<u8>,
    ) -> Arc<Message> {
        Message::new(
            moot_core::types::CommunityId([1; 20]),
            granter.clone(),
            DistributionRecord::FullSync {
                global_time,
                sequence_number: 2,
            },
            DestinationRecord::Community { node_count: 10 },
            Permission::Revoke {
                privilege: restricted_privilege(),
                to: to.clone(),
                kind,
            },
            packet,
        )
    }

    fn permit_permission() -> Permission {
        Permission::Permit {
            privilege: restricted_privilege(),
            payload: Payload::Bytes(b"hi".to_vec()),
        }
    }

    fn members() -> (Arc<Member>, Arc<Member>, Arc<Member>) {
        let registry = MemberRegistry::new();
        let master = registry.intern_local(Keypair::from_seed(&[1; 32])).unwrap();
        let granter = registry.intern_local(Keypair::from_seed(&[2; 32])).unwrap();
        let subject = registry.intern_local(Keypair::from_seed(&[3; 32])).unwrap();
        (master, granter, subject)
    }

    #[test]
    fn test_claim_global_time_is_strictly_increasing() {
        let (master, _, _) = members();
        let mut timeline = Timeline::new(master.mid());
        let mut previous = 0;
        for _ in 0..100 {
            let claimed = timeline.claim_global_time();
            assert!(claimed > previous);
            previous = claimed;
        }
    }

    #[test]
    fn test_advance_orders_local_claims_after_observed() {
        let (master, _, _) = members();
        let mut timeline = Timeline::new(master.mid());
        timeline.advance(41);
        assert_eq!(timeline.claim_global_time(), 42);
        // Advancing backwards never rewinds the clock.
        timeline.advance(3);
        assert_eq!(timeline.claim_global_time(), 43);
    }

    #[test]
    fn test_master_is_always_authorized() {
        let (master, _, _) = members();
        let timeline = Timeline::new(master.mid());
        for global_time in [1, 5, 1000] {
            assert!(timeline
                .check(&master, &permit_permission(), global_time)
                .is_allowed());
        }
    }

    #[test]
    fn test_unknown_signer_is_undecidable() {
        let (master, _, subject) = members();
        let timeline = Timeline::new(master.mid());
        assert!(matches!(
            timeline.check(&subject, &permit_permission(), 5),
            Verdict::Undecidable
        ));
    }

    #[test]
    fn test_grant_takes_effect_at_and_after_its_time() {
        let (master, granter, subject) = members();
        let mut timeline = Timeline::new(master.mid());
        timeline.update(&authorize_message(
            &granter,
            &subject,
            PermissionKind::Permit,
            3,
            vec![1],
        ));

        assert!(matches!(
            timeline.check(&subject, &permit_permission(), 2),
            Verdict::Undecidable
        ));
        assert!(timeline.check(&subject, &permit_permission(), 3).is_allowed());
        assert!(timeline.check(&subject, &permit_permission(), 9).is_allowed());
    }

    #[test]
    fn test_revoke_cuts_future_times_only() {
        let (master, granter, subject) = members();
        let mut timeline = Timeline::new(master.mid());
        timeline.update(&authorize_message(
            &granter,
            &subject,
            PermissionKind::Permit,
            1,
            vec![1],
        ));
        timeline.update(&revoke_message(
            &granter,
            &subject,
            PermissionKind::Permit,
            3,
            vec![2],
        ));

        assert!(timeline.check(&subject, &permit_permission(), 2).is_allowed());
        let verdict = timeline.check(&subject, &permit_permission(), 4);
        assert!(matches!(verdict, Verdict::Denied { .. }));
    }

    #[test]
    fn test_proof_names_the_deciding_message() {
        let (master, granter, subject) = members();
        let mut timeline = Timeline::new(master.mid());
        let grant = authorize_message(&granter, &subject, PermissionKind::Permit, 1, vec![1]);
        timeline.update(&grant);

        match timeline.check(&subject, &permit_permission(), 2) {
            Verdict::Allowed { proof } => {
                assert_eq!(proof.len(), 1);
                assert_eq!(proof[0].packet(), grant.packet());
            }
            verdict => panic!("unexpected verdict {:?}", verdict),
        }
    }

    #[test]
    fn test_update_is_idempotent_per_packet() {
        let (master, granter, subject) = members();
        let mut timeline = Timeline::new(master.mid());
        let grant = authorize_message(&granter, &subject, PermissionKind::Permit, 1, vec![1]);
        timeline.update(&grant);
        timeline.update(&grant);
        assert_eq!(timeline.proof_for_member(subject.mid(), 10).len(), 1);
    }

    #[test]
    fn test_equal_time_ties_break_on_packet_bytes() {
        let (master, granter, subject) = members();
        let mut timeline = Timeline::new(master.mid());
        // Grant and revoke at the same global time; the entry sorting last
        // under (time, granter, bytes) decides.
        timeline.update(&authorize_message(
            &granter,
            &subject,
            PermissionKind::Permit,
            2,
            vec![0x01],
        ));
        timeline.update(&revoke_message(
            &granter,
            &subject,
            PermissionKind::Permit,
            2,
            vec![0xff],
        ));
        assert!(matches!(
            timeline.check(&subject, &permit_permission(), 2),
            Verdict::Denied { .. }
        ));
    }

    #[test]
    fn test_proof_for_member_collects_chain() {
        let (master, granter, subject) = members();
        let mut timeline = Timeline::new(master.mid());
        timeline.update(&authorize_message(
            &granter,
            &subject,
            PermissionKind::Permit,
            1,
            vec![1],
        ));
        timeline.update(&revoke_message(
            &granter,
            &subject,
            PermissionKind::Permit,
            3,
            vec![2],
        ));

        assert_eq!(timeline.proof_for_member(subject.mid(), 2).len(), 1);
        assert_eq!(timeline.proof_for_member(subject.mid(), 5).len(), 2);
        assert!(timeline.proof_for_member(granter.mid(), 5).is_empty());
    }
}
