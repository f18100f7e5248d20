//! Property-based tests for the message store.
//!
//! Backed by a real temp-file ReDB database per case, so the case count
//! is kept moderate.

use crate::strategies::*;
use common::now_ms;
use proptest::prelude::*;
use storage_server::store::MessageStore;

fn open_temp() -> (tempfile::TempDir, MessageStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = MessageStore::open(dir.path().join("storage.db")).expect("open store");
    (dir, store)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Inserting the same message any number of times stores one copy
    /// and retrieve returns it once.
    #[test]
    fn prop_insert_is_idempotent(
        message in message_strategy(now_ms()),
        copies in 1usize..5,
    ) {
        let (_dir, store) = open_temp();

        prop_assert!(store.insert(&message).unwrap());
        for _ in 1..copies {
            prop_assert!(!store.insert(&message).unwrap());
        }

        prop_assert_eq!(store.len().unwrap(), 1);
        let got = store.retrieve(&message.pubkey, "", now_ms()).unwrap();
        prop_assert_eq!(got, vec![message]);
    }

    /// With `last_hash` set to the k-th message, retrieve returns exactly
    /// the strictly-later suffix, in insertion order.
    #[test]
    fn prop_retrieve_is_monotonic(
        pubkey in user_pubkey_strategy(),
        count in 1usize..10,
        pick in any::<prop::sample::Index>(),
    ) {
        let (_dir, store) = open_temp();
        let now = now_ms();

        let mut inserted = Vec::new();
        for i in 0..count {
            let mut message = common::Message {
                pubkey: pubkey.clone(),
                data: format!("payload {i}"),
                hash: format!("{i:032x}"),
                ttl_ms: 3_600_000,
                timestamp_ms: now,
                nonce: "n".into(),
            };
            message.data.push_str(&message.hash);
            store.insert(&message).unwrap();
            inserted.push(message);
        }

        let k = pick.index(count);
        let got = store.retrieve(&pubkey, &inserted[k].hash, now).unwrap();
        prop_assert_eq!(got.as_slice(), &inserted[k + 1..]);

        // and the full read returns everything in order
        let all = store.retrieve(&pubkey, "", now).unwrap();
        prop_assert_eq!(all, inserted);
    }
}
