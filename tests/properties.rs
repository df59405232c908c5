//! Property-based invariants: digest stability, id sanitization, payload
//! boundaries, and phase uniqueness under arbitrary transition sequences.

mod common;

use std::io::Cursor;
use std::time::Duration;

use proptest::prelude::*;

use warden::event::{ReadLimits, read_event_from};
use warden::lock::path_digest;
use warden::state::{Phase, sanitize_role, session_short};

fn limits() -> ReadLimits {
    ReadLimits {
        timeout: Duration::from_secs(5),
        ..ReadLimits::default()
    }
}

proptest! {
    // -- digests --

    #[test]
    fn digest_is_always_64_hex_chars(raw in "[a-zA-Z0-9 ._/-]{1,80}") {
        let dir = tempfile::tempdir().unwrap();
        let digest = path_digest(std::path::Path::new(&raw), dir.path());
        prop_assert_eq!(digest.len(), 64);
        prop_assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn digest_is_deterministic(raw in "[a-zA-Z0-9 ._/-]{1,80}") {
        let dir = tempfile::tempdir().unwrap();
        let a = path_digest(std::path::Path::new(&raw), dir.path());
        let b = path_digest(std::path::Path::new(&raw), dir.path());
        prop_assert_eq!(a, b);
    }

    // -- id helpers --

    #[test]
    fn sanitized_roles_are_directory_safe(raw in "\\PC{0,40}") {
        let role = sanitize_role(&raw);
        prop_assert!(!role.is_empty());
        prop_assert!(role.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn session_short_is_bounded_and_safe(raw in "\\PC{0,64}") {
        let short = session_short(&raw);
        prop_assert!(!short.is_empty());
        prop_assert!(short.len() <= 6);
        prop_assert!(short.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    // -- payload size boundary --

    #[test]
    fn payloads_split_exactly_at_the_byte_limit(limit in 512_usize..4096) {
        let skeleton = r#"{"hook_event_name":"stop","session_id":"s","cwd":"/","pad":""}"#;
        prop_assume!(limit > skeleton.len());
        let pad = limit - skeleton.len();
        let payload = skeleton.replace(
            "\"pad\":\"\"",
            &format!("\"pad\":\"{}\"", "x".repeat(pad)),
        );
        prop_assert_eq!(payload.len(), limit);

        let mut lim = limits();
        lim.max_bytes = limit;
        // Exactly at the limit: accepted.
        prop_assert!(
            read_event_from(Cursor::new(payload.clone().into_bytes()), lim).is_ok()
        );
        // One byte over: rejected.
        let over = payload.replace("\"cwd\":\"/\"", "\"cwd\":\"/x\"");
        prop_assert_eq!(over.len(), limit + 1);
        prop_assert!(read_event_from(Cursor::new(over.into_bytes()), lim).is_err());
    }

    // -- depth boundary --

    #[test]
    fn nesting_splits_exactly_at_the_depth_limit(depth in 2_usize..40) {
        let arrays = depth - 1;
        let mut nested = String::new();
        for _ in 0..arrays {
            nested.push('[');
        }
        for _ in 0..arrays {
            nested.push(']');
        }
        let payload = format!(
            r#"{{"hook_event_name":"stop","session_id":"s","cwd":"/","deep":{nested}}}"#
        );

        let mut lim = limits();
        lim.max_depth = depth;
        prop_assert!(
            read_event_from(Cursor::new(payload.clone().into_bytes()), lim).is_ok(),
            "depth at the limit must parse"
        );

        let mut tighter = limits();
        tighter.max_depth = depth - 1;
        prop_assert!(
            read_event_from(Cursor::new(payload.into_bytes()), tighter).is_err(),
            "one past the limit must be rejected"
        );
    }
}

// ---------------------------------------------------------------------------
// Phase uniqueness under arbitrary transition sequences
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
enum Op {
    Activate,
    Complete,
    CompletePending,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Activate),
        Just(Op::Complete),
        Just(Op::CompletePending),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn random_transition_sequences_preserve_unique_phase(
        ops in proptest::collection::vec(op_strategy(), 1..12)
    ) {
        let project = common::TestProject::new();
        let store = project.store();
        store.open_session("sess01", project.root()).unwrap();
        let id = store.register_pending_agent("sess01", "backend", None).unwrap();

        for op in ops {
            // Individual transitions may legitimately fail (backwards or
            // out-of-order); the invariant is about the on-disk state.
            let _ = match op {
                Op::Activate => store.activate_agent("sess01", &id),
                Op::Complete => store.complete_agent("sess01", &id, None),
                Op::CompletePending => store.complete_pending_agent("sess01", &id, None),
            };

            let present: Vec<Phase> = Phase::ALL
                .iter()
                .copied()
                .filter(|phase| {
                    project
                        .root()
                        .join(".state/sessions/sess01/agents")
                        .join(phase.dir_name())
                        .join(&id)
                        .exists()
                })
                .collect();
            prop_assert_eq!(present.len(), 1, "phases present: {:?}", present);
        }
    }
}
