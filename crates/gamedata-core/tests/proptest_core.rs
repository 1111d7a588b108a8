//! Property-based tests for the gamedata core.
//!
//! Uses proptest to generate random dependency graphs and failure
//! sequences, then verify ordering and guard invariants hold.

use gamedata_core::graph::DependencyGraph;
use gamedata_core::guard::{AccessGuard, AccessKey, GuardConfig, GuardState};
use gamedata_core::test_utils::ManualClock;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ===========================================================================
// Generators
// ===========================================================================

/// Up to `max_tables` tables and random (dependent, dependency) pairs.
fn arb_graph(max_tables: usize) -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1..=max_tables).prop_flat_map(|n| {
        let edges = proptest::collection::vec((0..n, 0..n), 0..(n * 2));
        (Just(n), edges)
    })
}

fn build_graph(n: usize, edges: &[(usize, usize)]) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for i in 0..n {
        graph.add_table(&format!("t{i}"));
    }
    for &(dependent, dependency) in edges {
        graph.add_dependency(&format!("t{dependent}"), &format!("t{dependency}"));
    }
    graph
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Every table appears exactly once.
    #[test]
    fn order_is_a_permutation((n, edges) in arb_graph(30)) {
        let mut graph = build_graph(n, &edges);
        let mut order = graph.load_order().order.clone();
        order.sort();
        let mut expected: Vec<String> = (0..n).map(|i| format!("t{i}")).collect();
        expected.sort();
        prop_assert_eq!(order, expected);
    }

    /// A dependency precedes its dependent unless both are in one cycle.
    #[test]
    fn dependencies_precede_dependents((n, edges) in arb_graph(30)) {
        let mut graph = build_graph(n, &edges);
        let result = graph.load_order().clone();

        let position: HashMap<&str, usize> = result
            .order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mut cycle_of: HashMap<&str, usize> = HashMap::new();
        for (idx, cycle) in result.cycles.iter().enumerate() {
            for name in cycle {
                cycle_of.insert(name.as_str(), idx);
            }
        }

        for &(dependent, dependency) in &edges {
            if dependent == dependency {
                continue;
            }
            let a = format!("t{dependent}");
            let b = format!("t{dependency}");
            let same_cycle = matches!(
                (cycle_of.get(a.as_str()), cycle_of.get(b.as_str())),
                (Some(x), Some(y)) if x == y
            );
            if !same_cycle {
                prop_assert!(position[b.as_str()] < position[a.as_str()]);
            }
        }
    }

    /// Members of a cycle are emitted contiguously.
    #[test]
    fn cycles_are_contiguous((n, edges) in arb_graph(30)) {
        let mut graph = build_graph(n, &edges);
        let result = graph.load_order().clone();
        for cycle in &result.cycles {
            let start = result.order.iter().position(|name| name == &cycle[0]).unwrap();
            prop_assert_eq!(&result.order[start..start + cycle.len()], cycle.as_slice());
        }
    }

    /// Recomputing the order without changes is stable.
    #[test]
    fn order_is_deterministic((n, edges) in arb_graph(20)) {
        let first = build_graph(n, &edges).load_order().clone();
        let second = build_graph(n, &edges).load_order().clone();
        prop_assert_eq!(first, second);
    }

    /// Once blacklisted, a key stays denied regardless of elapsed time.
    #[test]
    fn blacklist_is_sticky(waits in proptest::collection::vec(0u64..5_000, 15..40)) {
        let clock = Arc::new(ManualClock::new());
        let guard = AccessGuard::with_clock(GuardConfig::default(), clock.clone());
        guard.mark_warm();
        let key = AccessKey::table("spells");

        let mut failures = 0;
        for wait in waits {
            clock.advance(Duration::from_millis(wait));
            if guard.should_allow(&key) {
                guard.record_attempt(&key);
                guard.record_failure(&key);
                failures += 1;
            }
            if failures >= 15 {
                prop_assert_eq!(guard.state(&key), GuardState::Blacklisted);
                prop_assert!(!guard.should_allow(&key));
            }
        }
    }

    /// Attempts never exceed the burst budget while cooling down.
    #[test]
    fn attempts_bounded_per_burst(steps in proptest::collection::vec(0u64..500, 1..60)) {
        let clock = Arc::new(ManualClock::new());
        let guard = AccessGuard::with_clock(GuardConfig::default(), clock.clone());
        guard.mark_warm();
        let key = AccessKey::by_id("feat", 9999);

        for step in steps {
            clock.advance(Duration::from_millis(step));
            if guard.should_allow(&key) {
                guard.record_attempt(&key);
                guard.record_failure(&key);
            }
            if let Some(state) = guard.retry_state(&key) {
                prop_assert!(state.attempts <= 5);
            }
        }
    }
}
