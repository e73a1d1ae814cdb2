//! Property tests for the thermistor wire codec.

use std::collections::BTreeMap;

use proptest::prelude::*;

use cryofill_engine::thermistor::{decode_channels, encode_channels, format_reply, parse_reply};

fn full_mapping() -> BTreeMap<u8, String> {
    (0u8..16).map(|bit| (bit, format!("ch{bit}"))).collect()
}

proptest! {
    /// Packing a channel mask onto the wire and decoding it back through
    /// the name mapping is lossless when every bit is mapped.
    #[test]
    fn mask_survives_wire_and_codec_round_trip(mask in any::<u16>()) {
        let mapping = full_mapping();

        let wire = format_reply(mask);
        let parsed = parse_reply(&wire).unwrap();
        prop_assert_eq!(parsed, mask);

        let channels = decode_channels(parsed, &mapping);
        prop_assert_eq!(encode_channels(&channels, &mapping), mask);
    }

    /// With a partial mapping, only mapped bits survive the round trip.
    #[test]
    fn unmapped_bits_are_dropped(
        mask in any::<u16>(),
        keep in proptest::collection::btree_set(0u8..16, 0..16),
    ) {
        let mapping: BTreeMap<u8, String> =
            keep.iter().map(|&bit| (bit, format!("ch{bit}"))).collect();

        let channels = decode_channels(mask, &mapping);
        let recoded = encode_channels(&channels, &mapping);

        let kept_bits: u16 = mapping.keys().map(|&bit| 1u16 << bit).sum();
        prop_assert_eq!(recoded, mask & kept_bits);
    }

    /// Malformed replies never decode to a mask.
    #[test]
    fn garbage_replies_are_rejected(data in proptest::collection::vec(any::<u8>(), 0..16)) {
        prop_assume!(!data.starts_with(b"!01"));
        prop_assert!(parse_reply(&data).is_err());
    }
}
