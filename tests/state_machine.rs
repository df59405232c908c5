//! Agent registry invariants: unique phase, monotone transitions,
//! crash-recovery, and the concurrent counter-allocation race.

mod common;

use std::path::Path;
use std::sync::{Arc, Barrier};

use common::TestProject;
use warden::state::{Phase, counter_of};

/// Count how many phase directories hold the agent right now — the on-disk
/// ground truth behind the unique-phase invariant.
fn phase_count(root: &Path, agent_id: &str) -> usize {
    Phase::ALL
        .iter()
        .filter(|phase| {
            root.join(".state/sessions/sess01/agents")
                .join(phase.dir_name())
                .join(agent_id)
                .exists()
        })
        .count()
}

// ---------------------------------------------------------------------------
// Unique phase across the lifecycle
// ---------------------------------------------------------------------------

#[test]
fn agent_is_always_in_exactly_one_phase() {
    let project = TestProject::new();
    let store = project.store();
    store.open_session("sess01", project.root()).unwrap();

    let id = store
        .register_pending_agent("sess01", "backend", None)
        .unwrap();
    assert_eq!(phase_count(project.root(), &id), 1);

    store.activate_agent("sess01", &id).unwrap();
    assert_eq!(phase_count(project.root(), &id), 1);

    store.complete_agent("sess01", &id, None).unwrap();
    assert_eq!(phase_count(project.root(), &id), 1);
}

#[test]
fn observed_phases_are_a_lifecycle_prefix() {
    let project = TestProject::new();
    let store = project.store();
    store.open_session("sess01", project.root()).unwrap();
    let id = store
        .register_pending_agent("sess01", "backend", None)
        .unwrap();

    let mut observed = vec![store.find_agent("sess01", &id).unwrap().phase];
    store.activate_agent("sess01", &id).unwrap();
    observed.push(store.find_agent("sess01", &id).unwrap().phase);
    store.complete_agent("sess01", &id, None).unwrap();
    observed.push(store.find_agent("sess01", &id).unwrap().phase);

    assert_eq!(observed, vec![Phase::Pending, Phase::Active, Phase::Completed]);
}

// ---------------------------------------------------------------------------
// L1 — transition idempotence and direction
// ---------------------------------------------------------------------------

#[test]
fn completing_twice_is_a_no_op_and_reactivation_is_forbidden() {
    let project = TestProject::new();
    let store = project.store();
    store.open_session("sess01", project.root()).unwrap();
    let id = store
        .register_pending_agent("sess01", "backend", None)
        .unwrap();
    store.activate_agent("sess01", &id).unwrap();
    store.complete_agent("sess01", &id, Some("done")).unwrap();

    // complete(complete(a)) is a no-op.
    store.complete_agent("sess01", &id, Some("again")).unwrap();
    let view = store.find_agent("sess01", &id).unwrap();
    assert_eq!(view.phase, Phase::Completed);
    assert_eq!(view.meta.status_detail.as_deref(), Some("done"));

    // activate(complete(a)) is forbidden.
    assert!(store.activate_agent("sess01", &id).is_err());
}

// ---------------------------------------------------------------------------
// L2 — registration survives a crash before the metadata write
// ---------------------------------------------------------------------------

#[test]
fn registration_with_lost_metadata_still_counts() {
    let project = TestProject::new();
    let store = project.store();
    store.open_session("sess01", project.root()).unwrap();
    let id = store
        .register_pending_agent("sess01", "backend", None)
        .unwrap();

    // Simulate the crash window between mkdir and the metadata write.
    std::fs::remove_file(
        project
            .root()
            .join(".state/sessions/sess01/agents/pending")
            .join(&id)
            .join("meta.json"),
    )
    .unwrap();

    // Exactly one pending record, recovered from the id itself.
    let pending = store.list_agents("sess01", Some(Phase::Pending));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].agent_id, id);
    assert_eq!(pending[0].meta.role, "backend");

    // And the next registration does not collide with it.
    let next = store
        .register_pending_agent("sess01", "backend", None)
        .unwrap();
    assert_ne!(next, id);
    assert_eq!(store.list_agents("sess01", Some(Phase::Pending)).len(), 2);
}

// ---------------------------------------------------------------------------
// Concurrent counter allocation
// ---------------------------------------------------------------------------

#[test]
fn concurrent_registrations_get_unique_ids() {
    const REGISTRARS: usize = 8;

    let project = TestProject::new();
    let store = project.store();
    store.open_session("sess01", project.root()).unwrap();

    let barrier = Arc::new(Barrier::new(REGISTRARS));
    let handles: Vec<_> = (0..REGISTRARS)
        .map(|_| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                store
                    .register_pending_agent("sess01", "backend", None)
                    .unwrap()
            })
        })
        .collect();

    let mut ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), REGISTRARS, "every registrar got a distinct id");

    let mut counters: Vec<u64> = ids.iter().filter_map(|id| counter_of(id)).collect();
    counters.sort_unstable();
    assert_eq!(
        counters,
        (1..=REGISTRARS as u64).collect::<Vec<_>>(),
        "counters are dense from 1"
    );
}

#[test]
fn concurrent_activation_of_one_agent_is_idempotent() {
    const CALLERS: usize = 6;

    let project = TestProject::new();
    let store = project.store();
    store.open_session("sess01", project.root()).unwrap();
    let id = store
        .register_pending_agent("sess01", "backend", None)
        .unwrap();

    let barrier = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let store = store.clone();
            let id = id.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                store.activate_agent("sess01", &id)
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(store.find_agent("sess01", &id).unwrap().phase, Phase::Active);
    assert_eq!(phase_count(project.root(), &id), 1);
}

// ---------------------------------------------------------------------------
// Listing consistency
// ---------------------------------------------------------------------------

#[test]
fn agent_is_observable_throughout_a_racing_transition() {
    const AGENTS: usize = 4;
    const ROUNDS: usize = 200;

    let project = TestProject::new();
    let store = project.store();
    store.open_session("sess01", project.root()).unwrap();
    let ids: Vec<String> = (0..AGENTS)
        .map(|_| {
            store
                .register_pending_agent("sess01", "backend", None)
                .unwrap()
        })
        .collect();

    // One thread walks every agent through its lifecycle while the main
    // thread keeps observing. Renames are atomic, so an observer probing
    // phases in lifecycle order finds each agent somewhere — never in a
    // "neither old nor new" gap.
    let mover = {
        let store = store.clone();
        let ids = ids.clone();
        std::thread::spawn(move || {
            for id in &ids {
                store.activate_agent("sess01", id).unwrap();
                store.complete_agent("sess01", id, None).unwrap();
            }
        })
    };

    for _ in 0..ROUNDS {
        for id in &ids {
            assert!(
                store.find_agent("sess01", id).is_some(),
                "agent {id} vanished mid-transition"
            );
        }
    }
    mover.join().unwrap();

    for id in &ids {
        assert_eq!(
            store.find_agent("sess01", id).unwrap().phase,
            Phase::Completed
        );
    }
}
