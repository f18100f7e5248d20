//! Persistent message store backed by ReDB.
//!
//! Two tables: `messages` maps a message hash to its record, and
//! `pubkey_index` maps `(recipient, seq)` to the hash, where `seq` is a
//! store-wide monotonic insertion counter. Retrieval walks the index range
//! above the caller's last-seen sequence, which gives clients a stable
//! per-pubkey insertion order.
//!
//! All operations are blocking; async callers dispatch them through
//! `tokio::task::spawn_blocking`. ReDB handles internal locking, so the
//! store itself is freely shared behind an `Arc`.

use common::Message;
use rand::Rng;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");
const PUBKEY_INDEX: TableDefinition<(&str, u64), &str> = TableDefinition::new("pubkey_index");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const SEQ_KEY: &str = "seq";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::Error),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

macro_rules! redb_from {
    ($($err:ty),*) => {
        $(impl From<$err> for StoreError {
            fn from(e: $err) -> Self {
                Self::Database(e.into())
            }
        })*
    };
}

redb_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    message: Message,
    seq: u64,
}

pub struct MessageStore {
    db: Database,
}

impl MessageStore {
    /// Open or create the database at `path` and ensure the tables exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(MESSAGES)?;
            let _ = write_txn.open_table(PUBKEY_INDEX)?;
            let _ = write_txn.open_table(META)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Insert a message. Idempotent on hash: a duplicate insert leaves the
    /// store unchanged and returns `Ok(false)`.
    pub fn insert(&self, message: &Message) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut messages = write_txn.open_table(MESSAGES)?;
            if messages.get(message.hash.as_str())?.is_some() {
                return Ok(false);
            }

            let mut meta = write_txn.open_table(META)?;
            let seq = meta.get(SEQ_KEY)?.map(|v| v.value()).unwrap_or(0) + 1;
            meta.insert(SEQ_KEY, seq)?;

            let record = StoredRecord {
                message: message.clone(),
                seq,
            };
            messages.insert(message.hash.as_str(), serde_json::to_vec(&record)?.as_slice())?;

            let mut index = write_txn.open_table(PUBKEY_INDEX)?;
            index.insert((message.pubkey.as_str(), seq), message.hash.as_str())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// All live messages for `pubkey` inserted strictly after `last_hash`,
    /// in insertion order. An empty or unknown `last_hash` returns the full
    /// live set.
    pub fn retrieve(
        &self,
        pubkey: &str,
        last_hash: &str,
        now_ms: u64,
    ) -> Result<Vec<Message>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let messages = read_txn.open_table(MESSAGES)?;

        let cutoff = if last_hash.is_empty() {
            0
        } else {
            match messages.get(last_hash)? {
                Some(raw) => {
                    let record: StoredRecord = serde_json::from_slice(raw.value())?;
                    if record.message.pubkey == pubkey {
                        record.seq
                    } else {
                        0
                    }
                }
                None => 0,
            }
        };

        let index = read_txn.open_table(PUBKEY_INDEX)?;
        let mut out = Vec::new();
        for entry in index.range((pubkey, cutoff + 1)..=(pubkey, u64::MAX))? {
            let (_, hash) = entry?;
            if let Some(raw) = messages.get(hash.value())? {
                let record: StoredRecord = serde_json::from_slice(raw.value())?;
                if !record.message.is_expired(now_ms) {
                    out.push(record.message);
                }
            }
        }
        Ok(out)
    }

    pub fn get_by_hash(&self, hash: &str) -> Result<Option<Message>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let messages = read_txn.open_table(MESSAGES)?;
        match messages.get(hash)? {
            Some(raw) => {
                let record: StoredRecord = serde_json::from_slice(raw.value())?;
                Ok(Some(record.message))
            }
            None => Ok(None),
        }
    }

    /// Uniform random live message (reservoir sample over one pass), used
    /// by the storage-test initiator.
    pub fn random_live_message(&self, now_ms: u64) -> Result<Option<Message>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let messages = read_txn.open_table(MESSAGES)?;

        let mut rng = rand::thread_rng();
        let mut chosen: Option<Message> = None;
        let mut seen: u64 = 0;
        for entry in messages.iter()? {
            let (_, raw) = entry?;
            let record: StoredRecord = serde_json::from_slice(raw.value())?;
            if record.message.is_expired(now_ms) {
                continue;
            }
            seen += 1;
            if rng.gen_range(0..seen) == 0 {
                chosen = Some(record.message);
            }
        }
        Ok(chosen)
    }

    /// Every live message, used for bootstrap pushes.
    pub fn all_live(&self, now_ms: u64) -> Result<Vec<Message>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let messages = read_txn.open_table(MESSAGES)?;
        let mut out = Vec::new();
        for entry in messages.iter()? {
            let (_, raw) = entry?;
            let record: StoredRecord = serde_json::from_slice(raw.value())?;
            if !record.message.is_expired(now_ms) {
                out.push(record.message);
            }
        }
        Ok(out)
    }

    /// Delete expired messages. Returns how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError> {
        let mut expired: Vec<(String, String, u64)> = Vec::new();
        {
            let read_txn = self.db.begin_read()?;
            let messages = read_txn.open_table(MESSAGES)?;
            for entry in messages.iter()? {
                let (hash, raw) = entry?;
                let record: StoredRecord = serde_json::from_slice(raw.value())?;
                if record.message.is_expired(now_ms) {
                    expired.push((
                        hash.value().to_string(),
                        record.message.pubkey.clone(),
                        record.seq,
                    ));
                }
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut messages = write_txn.open_table(MESSAGES)?;
            let mut index = write_txn.open_table(PUBKEY_INDEX)?;
            for (hash, pubkey, seq) in &expired {
                messages.remove(hash.as_str())?;
                index.remove((pubkey.as_str(), *seq))?;
            }
        }
        write_txn.commit()?;
        Ok(expired.len())
    }

    /// Number of stored messages, expired ones included until purge.
    pub fn len(&self) -> Result<u64, StoreError> {
        let read_txn = self.db.begin_read()?;
        Ok(read_txn.open_table(MESSAGES)?.len()?)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, MessageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(dir.path().join("storage.db")).unwrap();
        (dir, store)
    }

    fn msg(pubkey: &str, hash: &str) -> Message {
        Message {
            pubkey: pubkey.to_string(),
            data: format!("data-{hash}"),
            hash: hash.to_string(),
            ttl_ms: 60_000,
            timestamp_ms: common::now_ms(),
            nonce: "n".into(),
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let (_dir, store) = open_temp();
        let m = msg("pk1", "h1");
        assert!(store.insert(&m).unwrap());
        assert!(!store.insert(&m).unwrap());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_retrieve_in_insertion_order() {
        let (_dir, store) = open_temp();
        for i in 0..5 {
            store.insert(&msg("pk1", &format!("h{i}"))).unwrap();
        }
        store.insert(&msg("other", "hx")).unwrap();

        let out = store.retrieve("pk1", "", common::now_ms()).unwrap();
        let hashes: Vec<_> = out.iter().map(|m| m.hash.as_str()).collect();
        assert_eq!(hashes, vec!["h0", "h1", "h2", "h3", "h4"]);
    }

    #[test]
    fn test_retrieve_after_last_hash() {
        let (_dir, store) = open_temp();
        for i in 0..5 {
            store.insert(&msg("pk1", &format!("h{i}"))).unwrap();
        }
        let out = store.retrieve("pk1", "h2", common::now_ms()).unwrap();
        let hashes: Vec<_> = out.iter().map(|m| m.hash.as_str()).collect();
        assert_eq!(hashes, vec!["h3", "h4"]);

        // unknown last hash falls back to the full set
        let out = store.retrieve("pk1", "nope", common::now_ms()).unwrap();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_expired_messages_are_hidden_and_purged() {
        let (_dir, store) = open_temp();
        let mut old = msg("pk1", "old");
        old.timestamp_ms = 1000;
        old.ttl_ms = 1000;
        store.insert(&old).unwrap();
        store.insert(&msg("pk1", "fresh")).unwrap();

        let now = common::now_ms();
        let out = store.retrieve("pk1", "", now).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].hash, "fresh");

        assert_eq!(store.purge_expired(now).unwrap(), 1);
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.get_by_hash("old").unwrap().is_none());
    }

    #[test]
    fn test_random_live_message_skips_expired() {
        let (_dir, store) = open_temp();
        let mut dead = msg("pk1", "dead");
        dead.timestamp_ms = 0;
        dead.ttl_ms = 1;
        store.insert(&dead).unwrap();
        assert!(store.random_live_message(common::now_ms()).unwrap().is_none());

        store.insert(&msg("pk1", "alive")).unwrap();
        let got = store.random_live_message(common::now_ms()).unwrap().unwrap();
        assert_eq!(got.hash, "alive");
    }
}
