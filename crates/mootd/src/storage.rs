//! Persistent storage using sled
//!
//! One tree per table: joined communities, interned members, private keys,
//! learned routing endpoints, stored sync messages, and claimed sequence
//! counters. Community creation writes its rows in one multi-tree
//! transaction; everything else is single-key.

use moot_core::types::{CommunityId, MemberId};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Db;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Community not found: {0}")]
    CommunityNotFound(CommunityId),
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(error: TransactionError<StorageError>) -> Self {
        match error {
            TransactionError::Abort(error) => error,
            TransactionError::Storage(error) => StorageError::Sled(error),
        }
    }
}

/// One joined community.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityRow {
    pub id: u64,
    pub cid: [u8; 20],
    /// Public blob of the local identity participating in this community.
    pub user_blob: Vec<u8>,
    /// Public blob of the community's master key.
    pub master_blob: Vec<u8>,
    /// Community kind tag used to re-instantiate on load.
    pub kind: String,
}

/// One learned peer endpoint of a community.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRow {
    pub host: String,
    pub port: u16,
    pub incoming_time: u64,
    pub outgoing_time: u64,
}

impl RoutingRow {
    pub fn address(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().ok()
    }
}

/// One stored syncable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRow {
    pub member: [u8; 20],
    pub privilege: String,
    pub global_time: u64,
    /// Zero for last-sync messages, which carry no sequence number.
    pub sequence_number: u64,
    pub packet: Vec<u8>,
}

/// Storage backend for mootd
pub struct Storage {
    db: Db,
    /// Community tree: cid -> CommunityRow
    communities: sled::Tree,
    /// Member tree: mid -> public blob
    members: sled::Tree,
    /// Key tree: public blob -> private blob
    keys: sled::Tree,
    /// Routing tree: cid ‖ "host:port" -> RoutingRow
    routing: sled::Tree,
    /// Sync tree: cid ‖ mid ‖ privilege ‖ seq ‖ global_time -> SyncRow
    sync: sled::Tree,
    /// Sequence tree: cid ‖ mid -> last claimed sequence number
    sequences: sled::Tree,
}

fn routing_key(community: CommunityId, address: &SocketAddr) -> Vec<u8> {
    let mut key = community.0.to_vec();
    key.extend_from_slice(address.to_string().as_bytes());
    key
}

fn sync_prefix(community: CommunityId, member: MemberId, privilege: &str) -> Vec<u8> {
    let mut key = community.0.to_vec();
    key.extend_from_slice(&member.0);
    key.push(privilege.len() as u8);
    key.extend_from_slice(privilege.as_bytes());
    key
}

fn sync_key(
    community: CommunityId,
    member: MemberId,
    privilege: &str,
    sequence_number: u64,
    global_time: u64,
) -> Vec<u8> {
    let mut key = sync_prefix(community, member, privilege);
    key.extend_from_slice(&sequence_number.to_be_bytes());
    key.extend_from_slice(&global_time.to_be_bytes());
    key
}

fn sequence_counter_key(community: CommunityId, member: MemberId, privilege: &str) -> Vec<u8> {
    let mut key = community.0.to_vec();
    key.extend_from_slice(&member.0);
    key.extend_from_slice(privilege.as_bytes());
    key
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let communities = db.open_tree("communities")?;
        let members = db.open_tree("members")?;
        let keys = db.open_tree("keys")?;
        let routing = db.open_tree("routing")?;
        let sync = db.open_tree("sync")?;
        let sequences = db.open_tree("sequences")?;

        Ok(Self {
            db,
            communities,
            members,
            keys,
            routing,
            sync,
            sequences,
        })
    }

    // -------------------------------------------------------------------
    // communities
    // -------------------------------------------------------------------

    /// Insert the rows of a newly created or joined community in one
    /// transaction: the community row, the master's member row, the
    /// optional master private key, and a copy of the bootstrap routing
    /// template.
    pub fn insert_community(
        &self,
        cid: CommunityId,
        user_blob: &[u8],
        master_blob: &[u8],
        master_private: Option<&[u8]>,
        kind: &str,
    ) -> Result<CommunityRow, StorageError> {
        let row = CommunityRow {
            id: self.db.generate_id()?,
            cid: cid.0,
            user_blob: user_blob.to_vec(),
            master_blob: master_blob.to_vec(),
            kind: kind.to_owned(),
        };
        let row_bytes = postcard::to_allocvec(&row)?;
        let master_mid = moot_core::crypto::member_id(master_blob);

        // Bootstrap routing template, copied under the new community id.
        let template = self.routing_rows(CommunityId::BOOTSTRAP)?;
        let routing_rows: Vec<(Vec<u8>, Vec<u8>)> = template
            .iter()
            .filter_map(|row| {
                let address = row.address()?;
                Some((routing_key(cid, &address), postcard::to_allocvec(row).ok()?))
            })
            .collect();

        (&self.communities, &self.members, &self.keys, &self.routing).transaction(
            |(communities, members, keys, routing)| {
                communities.insert(&cid.0, row_bytes.as_slice())?;
                members.insert(&master_mid.0, master_blob)?;
                if let Some(private) = master_private {
                    keys.insert(master_blob, private)?;
                }
                for (key, value) in &routing_rows {
                    routing.insert(key.as_slice(), value.as_slice())?;
                }
                Ok::<_, ConflictableTransactionError<StorageError>>(())
            },
        )?;

        Ok(row)
    }

    /// Get a community row by id
    pub fn community(&self, cid: CommunityId) -> Result<Option<CommunityRow>, StorageError> {
        match self.communities.get(cid.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All joined communities
    pub fn communities(&self) -> Result<Vec<CommunityRow>, StorageError> {
        let mut rows = Vec::new();
        for result in self.communities.iter() {
            let (_, bytes) = result?;
            rows.push(postcard::from_bytes(&bytes)?);
        }
        Ok(rows)
    }

    // -------------------------------------------------------------------
    // members and keys
    // -------------------------------------------------------------------

    /// Intern a member's public blob
    pub fn put_member(&self, mid: MemberId, public_blob: &[u8]) -> Result<(), StorageError> {
        self.members.insert(mid.0, public_blob)?;
        Ok(())
    }

    /// Get a member's public blob by mid
    pub fn member_blob(&self, mid: MemberId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.members.get(mid.0)?.map(|v| v.to_vec()))
    }

    /// All interned members
    pub fn member_blobs(&self) -> Result<Vec<Vec<u8>>, StorageError> {
        let mut blobs = Vec::new();
        for result in self.members.iter() {
            let (_, bytes) = result?;
            blobs.push(bytes.to_vec());
        }
        Ok(blobs)
    }

    /// Store a private key for a local identity
    pub fn put_key(&self, public_blob: &[u8], private_blob: &[u8]) -> Result<(), StorageError> {
        self.keys.insert(public_blob, private_blob)?;
        Ok(())
    }

    /// Get the private key behind a public blob
    pub fn private_key(&self, public_blob: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.keys.get(public_blob)?.map(|v| v.to_vec()))
    }

    // -------------------------------------------------------------------
    // routing
    // -------------------------------------------------------------------

    /// Record activity from an endpoint; inserts the row on first sight.
    pub fn touch_incoming(
        &self,
        community: CommunityId,
        address: SocketAddr,
        now: u64,
    ) -> Result<(), StorageError> {
        self.touch(community, address, now, true)
    }

    /// Record a transmission toward an endpoint; inserts the row on first sight.
    pub fn touch_outgoing(
        &self,
        community: CommunityId,
        address: SocketAddr,
        now: u64,
    ) -> Result<(), StorageError> {
        self.touch(community, address, now, false)
    }

    fn touch(
        &self,
        community: CommunityId,
        address: SocketAddr,
        now: u64,
        incoming: bool,
    ) -> Result<(), StorageError> {
        let key = routing_key(community, &address);
        let mut row = match self.routing.get(&key)? {
            Some(bytes) => postcard::from_bytes(&bytes)?,
            None => RoutingRow {
                host: address.ip().to_string(),
                port: address.port(),
                incoming_time: 0,
                outgoing_time: 0,
            },
        };
        if incoming {
            row.incoming_time = now;
        } else {
            row.outgoing_time = now;
        }
        self.routing.insert(key, postcard::to_allocvec(&row)?)?;
        Ok(())
    }

    /// All routing rows of a community
    pub fn routing_rows(&self, community: CommunityId) -> Result<Vec<RoutingRow>, StorageError> {
        let mut rows = Vec::new();
        for result in self.routing.scan_prefix(community.0) {
            let (_, bytes) = result?;
            rows.push(postcard::from_bytes(&bytes)?);
        }
        Ok(rows)
    }

    /// Most recently incoming-active endpoints of a community, excluding
    /// `exclude`, capped at `limit`.
    pub fn candidates(
        &self,
        community: CommunityId,
        limit: usize,
        exclude: Option<SocketAddr>,
    ) -> Result<Vec<SocketAddr>, StorageError> {
        let mut rows = self.routing_rows(community)?;
        rows.sort_by(|a, b| b.incoming_time.cmp(&a.incoming_time));
        Ok(rows
            .iter()
            .filter_map(RoutingRow::address)
            .filter(|address| Some(*address) != exclude)
            .take(limit)
            .collect())
    }

    // -------------------------------------------------------------------
    // sequence counters
    // -------------------------------------------------------------------

    /// Claim the next sequence number for (community, signer, privilege).
    /// Counters start at 1 and are dense; the claimed value is persisted
    /// before it is returned.
    pub fn next_sequence_number(
        &self,
        community: CommunityId,
        member: MemberId,
        privilege: &str,
    ) -> Result<u64, StorageError> {
        let key = sequence_counter_key(community, member, privilege);
        let next = match self.sequences.get(&key)? {
            Some(bytes) => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                u64::from_be_bytes(raw) + 1
            }
            None => 1,
        };
        self.sequences.insert(key, &next.to_be_bytes())?;
        Ok(next)
    }

    // -------------------------------------------------------------------
    // stored sync messages
    // -------------------------------------------------------------------

    /// Persist a syncable message's packet
    pub fn store_sync(&self, community: CommunityId, row: &SyncRow) -> Result<(), StorageError> {
        let key = sync_key(
            community,
            MemberId(row.member),
            &row.privilege,
            row.sequence_number,
            row.global_time,
        );
        self.sync.insert(key, postcard::to_allocvec(row)?)?;
        Ok(())
    }

    /// Remove a stored message (last-sync eviction)
    pub fn remove_sync(&self, community: CommunityId, row: &SyncRow) -> Result<(), StorageError> {
        let key = sync_key(
            community,
            MemberId(row.member),
            &row.privilege,
            row.sequence_number,
            row.global_time,
        );
        self.sync.remove(key)?;
        Ok(())
    }

    /// Highest stored sequence number for (community, signer, privilege);
    /// zero when nothing is stored.
    pub fn max_sequence(
        &self,
        community: CommunityId,
        member: MemberId,
        privilege: &str,
    ) -> Result<u64, StorageError> {
        let prefix = sync_prefix(community, member, privilege);
        match self.sync.scan_prefix(prefix).last() {
            Some(result) => {
                let (_, bytes) = result?;
                let row: SyncRow = postcard::from_bytes(&bytes)?;
                Ok(row.sequence_number)
            }
            None => Ok(0),
        }
    }

    /// Whether a sequence number is already stored
    pub fn has_sequence(
        &self,
        community: CommunityId,
        member: MemberId,
        privilege: &str,
        sequence_number: u64,
    ) -> Result<bool, StorageError> {
        let mut prefix = sync_prefix(community, member, privilege);
        prefix.extend_from_slice(&sequence_number.to_be_bytes());
        Ok(self.sync.scan_prefix(prefix).next().is_some())
    }

    /// Whether a last-sync message at this global time is already stored
    pub fn has_last_sync(
        &self,
        community: CommunityId,
        member: MemberId,
        privilege: &str,
        global_time: u64,
    ) -> Result<bool, StorageError> {
        let mut prefix = sync_prefix(community, member, privilege);
        prefix.extend_from_slice(&0u64.to_be_bytes());
        prefix.extend_from_slice(&global_time.to_be_bytes());
        Ok(self.sync.scan_prefix(prefix).next().is_some())
    }

    /// Stored packets for a sequence-number range, in sequence order.
    pub fn sequence_range(
        &self,
        community: CommunityId,
        member: MemberId,
        privilege: &str,
        low: u64,
        high: u64,
    ) -> Result<Vec<SyncRow>, StorageError> {
        let prefix = sync_prefix(community, member, privilege);
        let mut start = prefix.clone();
        start.extend_from_slice(&low.to_be_bytes());
        let mut end = prefix;
        end.extend_from_slice(&high.saturating_add(1).to_be_bytes());

        let mut rows = Vec::new();
        for result in self.sync.range(start..end) {
            let (_, bytes) = result?;
            rows.push(postcard::from_bytes(&bytes)?);
        }
        Ok(rows)
    }

    /// Stored last-sync messages for (community, signer, privilege), in
    /// global-time order.
    pub fn last_sync_rows(
        &self,
        community: CommunityId,
        member: MemberId,
        privilege: &str,
    ) -> Result<Vec<SyncRow>, StorageError> {
        let mut prefix = sync_prefix(community, member, privilege);
        prefix.extend_from_slice(&0u64.to_be_bytes());
        let mut rows = Vec::new();
        for result in self.sync.scan_prefix(prefix) {
            let (_, bytes) = result?;
            rows.push(postcard::from_bytes(&bytes)?);
        }
        Ok(rows)
    }

    /// All stored messages of a community whose global time falls in
    /// `[low, high]`, in global-time order.
    pub fn window_rows(
        &self,
        community: CommunityId,
        low: u64,
        high: u64,
    ) -> Result<Vec<SyncRow>, StorageError> {
        let mut rows: Vec<SyncRow> = Vec::new();
        for result in self.sync.scan_prefix(community.0) {
            let (_, bytes) = result?;
            let row: SyncRow = postcard::from_bytes(&bytes)?;
            if (low..=high).contains(&row.global_time) {
                rows.push(row);
            }
        }
        rows.sort_by_key(|row| row.global_time);
        Ok(rows)
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        (storage, dir)
    }

    fn sync_row(member: [u8; 20], privilege: &str, global_time: u64, seq: u64) -> SyncRow {
        SyncRow {
            member,
            privilege: privilege.into(),
            global_time,
            sequence_number: seq,
            packet: vec![global_time as u8; 4],
        }
    }

    #[test]
    fn test_insert_community_copies_bootstrap_routing() {
        let (storage, _dir) = open_storage();
        let seed: SocketAddr = "10.0.0.1:9200".parse().unwrap();
        storage
            .touch_incoming(CommunityId::BOOTSTRAP, seed, 7)
            .unwrap();

        let cid = CommunityId([1; 20]);
        let row = storage
            .insert_community(cid, b"user", b"master", Some(b"secret"), "test")
            .unwrap();
        assert_eq!(row.cid, cid.0);

        let loaded = storage.community(cid).unwrap().unwrap();
        assert_eq!(loaded.kind, "test");
        assert_eq!(loaded.master_blob, b"master");

        let candidates = storage.candidates(cid, 10, None).unwrap();
        assert_eq!(candidates, vec![seed]);

        let master_mid = moot_core::crypto::member_id(b"master");
        assert_eq!(storage.member_blob(master_mid).unwrap().unwrap(), b"master");
        assert_eq!(storage.private_key(b"master").unwrap().unwrap(), b"secret");
    }

    #[test]
    fn test_sequence_counter_is_dense_and_persistent() {
        let (storage, _dir) = open_storage();
        let cid = CommunityId([1; 20]);
        let mid = MemberId([2; 20]);
        assert_eq!(storage.next_sequence_number(cid, mid, "print").unwrap(), 1);
        assert_eq!(storage.next_sequence_number(cid, mid, "print").unwrap(), 2);
        assert_eq!(storage.next_sequence_number(cid, mid, "print").unwrap(), 3);
        // Counters are independent per privilege.
        assert_eq!(storage.next_sequence_number(cid, mid, "status").unwrap(), 1);
    }

    #[test]
    fn test_sequence_queries() {
        let (storage, _dir) = open_storage();
        let cid = CommunityId([1; 20]);
        let member = [2u8; 20];

        for seq in [1u64, 2, 4] {
            storage
                .store_sync(cid, &sync_row(member, "print", 10 + seq, seq))
                .unwrap();
        }

        let mid = MemberId(member);
        assert_eq!(storage.max_sequence(cid, mid, "print").unwrap(), 4);
        assert!(storage.has_sequence(cid, mid, "print", 2).unwrap());
        assert!(!storage.has_sequence(cid, mid, "print", 3).unwrap());

        let range = storage.sequence_range(cid, mid, "print", 2, 4).unwrap();
        let sequences: Vec<u64> = range.iter().map(|r| r.sequence_number).collect();
        assert_eq!(sequences, vec![2, 4]);
    }

    #[test]
    fn test_window_rows_filters_by_global_time() {
        let (storage, _dir) = open_storage();
        let cid = CommunityId([1; 20]);
        storage
            .store_sync(cid, &sync_row([2; 20], "print", 5, 1))
            .unwrap();
        storage
            .store_sync(cid, &sync_row([2; 20], "print", 150, 2))
            .unwrap();
        storage
            .store_sync(cid, &sync_row([3; 20], "status", 90, 0))
            .unwrap();

        let rows = storage.window_rows(cid, 1, 100).unwrap();
        let times: Vec<u64> = rows.iter().map(|r| r.global_time).collect();
        assert_eq!(times, vec![5, 90]);
    }

    #[test]
    fn test_last_sync_rows_ordered_by_global_time() {
        let (storage, _dir) = open_storage();
        let cid = CommunityId([1; 20]);
        for global_time in [9u64, 3, 6] {
            storage
                .store_sync(cid, &sync_row([2; 20], "status", global_time, 0))
                .unwrap();
        }
        let rows = storage.last_sync_rows(cid, MemberId([2; 20]), "status").unwrap();
        let times: Vec<u64> = rows.iter().map(|r| r.global_time).collect();
        assert_eq!(times, vec![3, 6, 9]);

        storage
            .remove_sync(cid, &sync_row([2; 20], "status", 3, 0))
            .unwrap();
        let rows = storage.last_sync_rows(cid, MemberId([2; 20]), "status").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(storage.has_last_sync(cid, MemberId([2; 20]), "status", 6).unwrap());
        assert!(!storage.has_last_sync(cid, MemberId([2; 20]), "status", 3).unwrap());
    }
}
