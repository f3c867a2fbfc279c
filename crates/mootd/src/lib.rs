//! mootd - moot community membership and dissemination daemon
//!
//! This daemon maintains replicated, partially-ordered logs of authenticated
//! messages for one or more communities:
//! - Interned member registry and signing identities
//! - Permission/authority timeline per community
//! - Typed message pipeline with delay-and-replay triggers
//! - Bloom-window anti-entropy synchronization
//! - sled-backed persistent store

pub mod community;
pub mod config;
pub mod conversion;
pub mod dispatcher;
pub mod member;
pub mod message;
pub mod server;
pub mod storage;
pub mod timeline;
pub mod trigger;

pub use community::{Community, CommunityKind};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use member::{Member, MemberRegistry};
pub use server::Server;
pub use storage::Storage;
pub use timeline::Timeline;
pub use trigger::TriggerTable;
