//! Property tests for the wire codec

use std::collections::HashSet;

use proptest::prelude::*;
use wagner_remote::codec::{self, CommandCode, Gesture, MAX_SPEED};

fn gesture_strategy() -> impl Strategy<Value = Gesture> {
    proptest::sample::select(Gesture::ALL.to_vec())
}

proptest! {
    /// decode(encode(v)) == clamp(floor(v), 0, 100) for any finite or infinite value
    #[test]
    fn prop_speed_round_trip(value in prop_oneof![
        -1.0e6f64..1.0e6,
        -5.0f64..105.0,
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
    ]) {
        let decoded = codec::decode_speed(&codec::encode_speed(value)).unwrap();
        let expected = value.floor().clamp(0.0, f64::from(MAX_SPEED)) as u8;
        prop_assert_eq!(decoded, expected);
    }

    #[test]
    fn prop_encoded_speed_has_no_leading_zeros(value in 0.0f64..=100.0) {
        let text = String::from_utf8(codec::encode_speed(value)).unwrap();
        prop_assert!(text == "0" || !text.starts_with('0'));
        prop_assert!(text.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn prop_decode_accepts_every_valid_speed(speed in 0u8..=100) {
        prop_assert_eq!(codec::decode_speed(speed.to_string().as_bytes()), Ok(speed));
    }

    #[test]
    fn prop_decode_rejects_out_of_range(speed in 101i64..1_000_000) {
        prop_assert!(codec::decode_speed(speed.to_string().as_bytes()).is_err());
    }

    #[test]
    fn prop_decode_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..16)) {
        let _ = codec::decode_speed(&payload);
    }

    #[test]
    fn prop_encode_is_deterministic(gesture in gesture_strategy()) {
        let code = codec::encode(gesture);
        prop_assert_eq!(code, codec::encode(gesture));
        prop_assert_eq!(Gesture::from_code(&code), Some(gesture));
        prop_assert_eq!(code.to_string().parse::<CommandCode>(), Ok(code));
    }

    #[test]
    fn prop_gesture_names_parse_back(gesture in gesture_strategy()) {
        prop_assert_eq!(gesture.name().parse::<Gesture>(), Ok(gesture));
        prop_assert_eq!(gesture.name().to_uppercase().parse::<Gesture>(), Ok(gesture));
    }

    #[test]
    fn prop_command_parse_never_panics(raw in "\\PC{0,12}") {
        let _ = CommandCode::parse(&raw);
    }
}

#[test]
fn test_every_gesture_has_a_distinct_code() {
    let codes: HashSet<String> = Gesture::ALL
        .iter()
        .map(|gesture| codec::encode(*gesture).to_string())
        .collect();
    assert_eq!(codes.len(), Gesture::ALL.len());
}
