//! Property-based tests for inbound frame decoding.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never panics in `decode` (it returns `Err` gracefully).
//! 2. Any JSON payload on a relay message is forwarded byte-for-byte.
//! 3. Unrecognized discriminants always map to `UnknownType`.

use callrelay_proto::signal::{self, ClientMessage, ProtocolError, RelayKind, ServerMessage};
use proptest::prelude::*;

/// Strategy for arbitrary JSON values rendered to text, nested a few levels.
fn arb_json_text() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        Just("null".to_string()),
        any::<bool>().prop_map(|b| b.to_string()),
        any::<i64>().prop_map(|n| n.to_string()),
        "[a-zA-Z0-9 =:/.\\-]{0,32}".prop_map(|s| format!("\"{s}\"")),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6)
                .prop_map(|items| format!("[{}]", items.join(", "))),
            prop::collection::vec(("[a-z]{1,8}", inner), 0..6).prop_map(|fields| {
                let body: Vec<String> = fields
                    .into_iter()
                    .map(|(k, v)| format!("\"{k}\" : {v}"))
                    .collect();
                format!("{{{}}}", body.join(","))
            }),
        ]
    })
}

proptest! {
    #[test]
    fn arbitrary_text_never_panics(text in "\\PC{0,256}") {
        let _ = signal::decode(&text);
    }

    #[test]
    fn arbitrary_objects_never_panic(
        kind in "[a-z\\-]{0,16}",
        to in proptest::option::of("[a-z]{0,8}"),
        body in arb_json_text(),
    ) {
        let to_field = to.map(|t| format!(",\"to\":\"{t}\"")).unwrap_or_default();
        let text = format!("{{\"type\":\"{kind}\"{to_field},\"payload\":{body}}}");
        let _ = signal::decode(&text);
    }

    #[test]
    fn relay_payload_is_forwarded_verbatim(body in arb_json_text()) {
        let text = format!("{{\"type\":\"offer\",\"to\":\"bob\",\"payload\":{body}}}");
        let env = signal::decode(&text).unwrap();
        let ClientMessage::Relay { kind, to, payload } = env.message else {
            panic!("expected relay message");
        };
        prop_assert_eq!(kind, RelayKind::Offer);
        prop_assert_eq!(payload.get(), body.as_str());

        let out = ServerMessage::relay(kind, "alice".into(), to, payload).to_json().unwrap();
        let expected = format!("\"payload\":{body}");
        prop_assert!(out.contains(&expected));
    }

    #[test]
    fn unrecognized_types_are_unknown(kind in "x-[a-z]{1,12}") {
        let text = format!("{{\"type\":\"{kind}\",\"to\":\"bob\"}}");
        let err = signal::decode(&text).unwrap_err();
        prop_assert_eq!(err, ProtocolError::UnknownType(kind));
    }
}
