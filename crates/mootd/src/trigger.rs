//! Match-based callbacks for delayed packets and messages
//!
//! Every admitted message is offered to the table; triggers whose pattern
//! matches the message footprint fire in registration order. A trigger
//! either calls back into the application, or re-enqueues packets/messages
//! that were delayed pending this very message. Each trigger carries a
//! deadline; the periodic tick expires overdue ones exactly once.

use crate::message::Message;
use moot_core::types::FootprintPattern;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// What a fired callback wants done with its trigger.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Remove,
}

/// Callback invoked with the matching message, or `None` on timeout.
pub type Callback = Box<dyn FnMut(Option<(SocketAddr, &Arc<Message>)>) -> Disposition + Send>;

/// What happens when a trigger's pattern matches.
pub enum TriggerAction {
    /// Call into the application; fires up to `max_responses` times and
    /// once more with the timed-out sentinel.
    Callback(Callback),
    /// Replay raw packets through the dispatcher; one-shot, lost on timeout.
    ReplayPackets(Vec<(SocketAddr, Vec<u8>)>),
    /// Replay a decoded message through the pipeline; one-shot, lost on
    /// timeout.
    ReplayMessage(SocketAddr, Arc<Message>),
}

struct Trigger {
    pattern: FootprintPattern,
    action: TriggerAction,
    responses_remaining: u32,
    deadline: Instant,
}

/// Work re-enqueued by fired triggers, drained by the dispatcher.
#[derive(Default)]
pub struct Replays {
    pub packets: Vec<(SocketAddr, Vec<u8>)>,
    pub messages: Vec<(SocketAddr, Arc<Message>)>,
}

impl Replays {
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty() && self.messages.is_empty()
    }
}

/// The pending-trigger table.
#[derive(Default)]
pub struct TriggerTable {
    triggers: Vec<Trigger>,
}

enum Outcome {
    KeepTrigger,
    RemoveTrigger,
}

impl TriggerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Register a trigger. `max_responses` bounds callback firings; replay
    /// triggers are one-shot regardless.
    pub fn add(
        &mut self,
        pattern: FootprintPattern,
        action: TriggerAction,
        max_responses: u32,
        deadline: Instant,
    ) {
        self.triggers.push(Trigger {
            pattern,
            action,
            responses_remaining: max_responses.max(1),
            deadline,
        });
    }

    /// Offer a processed message to every pending trigger, in registration
    /// order. Returns the packets/messages that became replayable.
    pub fn on_message(&mut self, address: SocketAddr, message: &Arc<Message>) -> Replays {
        let footprint = message.footprint();
        let mut replays = Replays::default();
        let mut index = 0;
        while index < self.triggers.len() {
            if !self.triggers[index].pattern.matches(&footprint) {
                index += 1;
                continue;
            }
            let trigger = &mut self.triggers[index];
            trigger.responses_remaining = trigger.responses_remaining.saturating_sub(1);
            let outcome = match &mut trigger.action {
                TriggerAction::Callback(callback) => {
                    let disposition = callback(Some((address, message)));
                    if disposition == Disposition::Remove || trigger.responses_remaining == 0 {
                        Outcome::RemoveTrigger
                    } else {
                        Outcome::KeepTrigger
                    }
                }
                TriggerAction::ReplayPackets(_) | TriggerAction::ReplayMessage(..) => {
                    Outcome::RemoveTrigger
                }
            };
            match outcome {
                Outcome::KeepTrigger => index += 1,
                Outcome::RemoveTrigger => {
                    let trigger = self.triggers.remove(index);
                    match trigger.action {
                        TriggerAction::ReplayPackets(packets) => {
                            debug!(count = packets.len(), %footprint, "replaying delayed packets");
                            replays.packets.extend(packets);
                        }
                        TriggerAction::ReplayMessage(address, message) => {
                            debug!(%footprint, "replaying delayed message");
                            replays.messages.push((address, message));
                        }
                        TriggerAction::Callback(_) => {}
                    }
                }
            }
        }
        replays
    }

    /// Expire overdue triggers. Callback triggers fire once with the
    /// timed-out sentinel; delayed packets and messages are dropped.
    pub fn tick(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.triggers.len() {
            if self.triggers[index].deadline > now {
                index += 1;
                continue;
            }
            let mut trigger = self.triggers.remove(index);
            match &mut trigger.action {
                TriggerAction::Callback(callback) => {
                    if trigger.responses_remaining > 0 {
                        callback(None);
                    }
                }
                TriggerAction::ReplayPackets(packets) => {
                    debug!(count = packets.len(), "delayed packets timed out");
                }
                TriggerAction::ReplayMessage(_, message) => {
                    debug!(footprint = %message.footprint(), "delayed message timed out");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberRegistry;
    use crate::message::{
        DestinationRecord, DistributionRecord, Payload, Permission,
    };
    use moot_core::crypto::Keypair;
    use moot_core::types::{
        CommunityId, DestinationPolicy, DistributionPolicy, Privilege, Resolution,
        SyncDirection,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn test_message(privilege_name: &str, global_time: u64) -> Arc<Message> {
        let registry = MemberRegistry::new();
        let signer = registry.intern_local(Keypair::from_seed(&[1; 32])).unwrap();
        Message::new(
            CommunityId([1; 20]),
            signer,
            DistributionRecord::LastSync { global_time },
            DestinationRecord::Community { node_count: 10 },
            Permission::Permit {
                privilege: Arc::new(Privilege::new(
                    privilege_name,
                    Resolution::Public,
                    DistributionPolicy::LastSync {
                        priority: 128,
                        direction: SyncDirection::Ascending,
                        history_size: 1,
                    },
                    DestinationPolicy::Community { node_count: 10 },
                )),
                payload: Payload::Bytes(vec![]),
            },
            vec![global_time as u8],
        )
    }

    fn address() -> SocketAddr {
        "127.0.0.1:9200".parse().unwrap()
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_callback_fires_on_match_only() {
        static FIRED: AtomicU32 = AtomicU32::new(0);
        let mut table = TriggerTable::new();
        table.add(
            FootprintPattern::privilege("print"),
            TriggerAction::Callback(Box::new(|event| {
                assert!(event.is_some());
                FIRED.fetch_add(1, Ordering::SeqCst);
                Disposition::Keep
            })),
            2,
            far_deadline(),
        );

        table.on_message(address(), &test_message("status", 1));
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        assert_eq!(table.len(), 1);

        table.on_message(address(), &test_message("print", 1));
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);

        // Second match exhausts max_responses and removes the trigger.
        table.on_message(address(), &test_message("print", 2));
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_callback_can_remove_itself() {
        let mut table = TriggerTable::new();
        table.add(
            FootprintPattern::privilege("print"),
            TriggerAction::Callback(Box::new(|_| Disposition::Remove)),
            10,
            far_deadline(),
        );
        table.on_message(address(), &test_message("print", 1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_replay_triggers_are_one_shot() {
        let mut table = TriggerTable::new();
        table.add(
            FootprintPattern::privilege("print"),
            TriggerAction::ReplayPackets(vec![(address(), vec![1, 2, 3])]),
            1,
            far_deadline(),
        );
        table.add(
            FootprintPattern::privilege("print"),
            TriggerAction::ReplayMessage(address(), test_message("status", 9)),
            1,
            far_deadline(),
        );

        let replays = table.on_message(address(), &test_message("print", 1));
        assert_eq!(replays.packets.len(), 1);
        assert_eq!(replays.messages.len(), 1);
        assert!(table.is_empty());

        let replays = table.on_message(address(), &test_message("print", 2));
        assert!(replays.is_empty());
    }

    #[test]
    fn test_timeout_fires_callback_sentinel_once() {
        static TIMED_OUT: AtomicU32 = AtomicU32::new(0);
        let mut table = TriggerTable::new();
        table.add(
            FootprintPattern::privilege("print"),
            TriggerAction::Callback(Box::new(|event| {
                if event.is_none() {
                    TIMED_OUT.fetch_add(1, Ordering::SeqCst);
                }
                Disposition::Keep
            })),
            1,
            Instant::now(),
        );
        table.add(
            FootprintPattern::privilege("print"),
            TriggerAction::ReplayPackets(vec![(address(), vec![1])]),
            1,
            Instant::now(),
        );

        let later = Instant::now() + Duration::from_millis(1);
        table.tick(later);
        assert_eq!(TIMED_OUT.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());

        // Expired triggers fire exactly once.
        table.tick(later);
        assert_eq!(TIMED_OUT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_triggers_fire_in_registration_order() {
        let mut table = TriggerTable::new();
        table.add(
            FootprintPattern::privilege("print"),
            TriggerAction::ReplayPackets(vec![(address(), vec![1])]),
            1,
            far_deadline(),
        );
        table.add(
            FootprintPattern::privilege("print"),
            TriggerAction::ReplayPackets(vec![(address(), vec![2])]),
            1,
            far_deadline(),
        );

        let replays = table.on_message(address(), &test_message("print", 1));
        let payloads: Vec<u8> = replays.packets.iter().map(|(_, p)| p[0]).collect();
        assert_eq!(payloads, vec![1, 2]);
    }
}
