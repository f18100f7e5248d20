//! Property-based tests for envelope signing.
//!
//! Invariants: sign/verify round-trips for any body, and any single-bit
//! flip in the body or the signature breaks verification.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use proptest::prelude::*;
use storage_server::identity::{verify_signature, IdentityKeys};

fn identity_from_seed(seed: [u8; 32]) -> IdentityKeys {
    let hex_seed = hex::encode(seed);
    IdentityKeys::from_hex(&hex_seed, &hex_seed, &hex_seed).expect("valid seed keys")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_sign_verify_round_trip(
        seed in any::<[u8; 32]>(),
        body in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let identity = identity_from_seed(seed);
        let signature = identity.sign(&body);
        prop_assert!(verify_signature(&signature, &body, identity.address_b32z()));
    }

    #[test]
    fn prop_body_bit_flip_fails(
        seed in any::<[u8; 32]>(),
        body in prop::collection::vec(any::<u8>(), 1..512),
        flip in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let identity = identity_from_seed(seed);
        let signature = identity.sign(&body);

        let mut tampered = body.clone();
        let at = flip.index(tampered.len());
        tampered[at] ^= 1 << bit;
        prop_assert!(!verify_signature(&signature, &tampered, identity.address_b32z()));
    }

    #[test]
    fn prop_signature_bit_flip_fails(
        seed in any::<[u8; 32]>(),
        body in prop::collection::vec(any::<u8>(), 0..512),
        flip in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let identity = identity_from_seed(seed);
        let signature = identity.sign(&body);

        let mut raw = BASE64.decode(&signature).unwrap();
        let at = flip.index(raw.len());
        raw[at] ^= 1 << bit;
        let tampered = BASE64.encode(raw);
        prop_assert!(!verify_signature(&tampered, &body, identity.address_b32z()));
    }

    /// A signature only verifies against the signer's own address.
    #[test]
    fn prop_wrong_signer_fails(
        seed_a in any::<[u8; 32]>(),
        seed_b in any::<[u8; 32]>(),
        body in prop::collection::vec(any::<u8>(), 0..128),
    ) {
        prop_assume!(seed_a != seed_b);
        let alice = identity_from_seed(seed_a);
        let bob = identity_from_seed(seed_b);
        let signature = alice.sign(&body);
        prop_assert!(!verify_signature(&signature, &body, bob.address_b32z()));
    }
}
