//! Property-based tests for the replication wire framing.

use crate::strategies::*;
use common::codec::{deserialize_messages, serialize_messages, CodecError};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Whatever we frame, a peer decodes back byte-identically.
    #[test]
    fn prop_framing_round_trips(
        messages in prop::collection::vec(message_strategy(1_700_000_000_000), 0..8),
    ) {
        let wire = serialize_messages(&messages);
        prop_assert_eq!(deserialize_messages(&wire).unwrap(), messages);
    }

    /// Cutting a frame anywhere strictly inside a record is an error,
    /// never a panic and never a silently short batch.
    #[test]
    fn prop_truncation_is_detected(
        message in message_strategy(1_700_000_000_000),
        cut in any::<prop::sample::Index>(),
    ) {
        let wire = serialize_messages(std::slice::from_ref(&message));
        let cut_at = 1 + cut.index(wire.len() - 1);
        if cut_at < wire.len() {
            let result = deserialize_messages(&wire[..cut_at]);
            prop_assert!(matches!(
                result,
                Err(CodecError::UnexpectedEof(_)) | Err(CodecError::BadFieldLength(_))
            ));
        }
    }
}
