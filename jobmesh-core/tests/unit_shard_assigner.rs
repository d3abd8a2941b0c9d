//! Unit tests for shard assignment strategies
//!
//! Properties every strategy must hold, plus edge cases.

use jobmesh_core::coordinator::shard_assigner::{average_allocation, Assignment, StrategyRegistry};
use jobmesh_core::JobInstance;
use proptest::prelude::*;

fn instances(n: usize) -> Vec<JobInstance> {
    let mut list: Vec<_> = (0..n)
        .map(|i| JobInstance::from_parts(&format!("192.168.{}.{}", i / 250, i % 250 + 1), &format!("{:04}", i)))
        .collect();
    list.sort();
    list
}

fn all_items(assignment: &Assignment) -> Vec<u32> {
    let mut items: Vec<u32> = assignment.iter().flat_map(|(_, items)| items.iter().copied()).collect();
    items.sort();
    items
}

fn job_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,24}"
}

proptest! {
    /// Property: every item lands on exactly one instance
    #[test]
    fn assignment_covers_each_item_once(n in 1usize..40, total in 1u32..500, job in job_name_strategy()) {
        let candidates = instances(n);
        for name in StrategyRegistry::names() {
            let strategy = StrategyRegistry::resolve(name).unwrap();
            let assignment = strategy.sharding(&candidates, &job, total);
            prop_assert_eq!(assignment.len(), n, "{} should list every candidate", name);
            prop_assert_eq!(all_items(&assignment), (0..total).collect::<Vec<_>>());
        }
    }

    /// Property: item counts differ by at most one
    #[test]
    fn assignment_is_balanced(n in 1usize..40, total in 1u32..500, job in job_name_strategy()) {
        let candidates = instances(n);
        for name in StrategyRegistry::names() {
            let assignment = StrategyRegistry::resolve(name).unwrap().sharding(&candidates, &job, total);
            let sizes: Vec<usize> = assignment.iter().map(|(_, items)| items.len()).collect();
            let min = sizes.iter().min().copied().unwrap_or(0);
            let max = sizes.iter().max().copied().unwrap_or(0);
            prop_assert!(max - min <= 1, "{} gave sizes {:?}", name, sizes);
        }
    }

    /// Property: the first `total % n` candidates take the extra items,
    /// each in one contiguous ascending block
    #[test]
    fn average_allocation_is_contiguous(n in 1usize..40, total in 1u32..500) {
        let candidates = instances(n);
        let assignment = average_allocation(&candidates, total);
        let per = total / n as u32;
        let remainder = total % n as u32;

        let mut next = 0;
        for (idx, (instance, items)) in assignment.iter().enumerate() {
            prop_assert_eq!(instance, &candidates[idx]);
            let expected = per + u32::from((idx as u32) < remainder);
            prop_assert_eq!(items.len() as u32, expected);
            prop_assert_eq!(items.clone(), (next..next + expected).collect::<Vec<_>>());
            next += expected;
        }
    }

    /// Property: strategies are pure functions of their input
    #[test]
    fn assignment_is_deterministic(n in 1usize..20, total in 1u32..200, job in job_name_strategy()) {
        let candidates = instances(n);
        for name in StrategyRegistry::names() {
            let strategy = StrategyRegistry::resolve(name).unwrap();
            prop_assert_eq!(strategy.sharding(&candidates, &job, total), strategy.sharding(&candidates, &job, total));
        }
    }
}

#[test]
fn test_empty_candidates() {
    for name in StrategyRegistry::names() {
        let assignment = StrategyRegistry::resolve(name).unwrap().sharding(&[], "orders", 10);
        assert!(assignment.is_empty(), "{} should assign nothing", name);
    }
}

#[test]
fn test_more_instances_than_items() {
    let candidates = instances(6);
    let assignment = average_allocation(&candidates, 3);

    let empty = assignment.iter().filter(|(_, items)| items.is_empty()).count();
    assert_eq!(empty, 3);
    assert_eq!(assignment[0].1, vec![0]);
    assert_eq!(assignment[2].1, vec![2]);
}

#[test]
fn test_single_instance_takes_everything() {
    let candidates = instances(1);
    for name in StrategyRegistry::names() {
        let assignment = StrategyRegistry::resolve(name).unwrap().sharding(&candidates, "orders", 50);
        assert_eq!(assignment[0].1, (0..50).collect::<Vec<_>>());
    }
}

#[test]
fn test_rotation_depends_on_job_name() {
    let candidates = instances(5);
    let strategy = StrategyRegistry::resolve("ROUND_ROBIN").unwrap();
    let firsts: std::collections::HashSet<String> = ["orders", "billing", "audit", "reports", "mailer", "sync"]
        .iter()
        .map(|job| strategy.sharding(&candidates, job, 5)[0].0.instance_id().to_string())
        .collect();
    assert!(firsts.len() > 1, "different jobs should start on different instances");
}
