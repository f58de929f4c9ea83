use conductor::domain::models::{Dependency, DependencyKind, PlaybookDefinition, StepInstance, StepStatus, WorkerType};
use conductor::services::DependencyResolver;
use proptest::prelude::*;
use uuid::Uuid;

const STATUSES: [StepStatus; 7] = [
    StepStatus::NotReady,
    StepStatus::Pending,
    StepStatus::InProgress,
    StepStatus::RetryPending,
    StepStatus::Completed,
    StepStatus::Failed,
    StepStatus::Skipped,
];

fn status() -> impl Strategy<Value = StepStatus> {
    (0..STATUSES.len()).prop_map(|i| STATUSES[i])
}

/// A run of `statuses.len()` siblings plus a target step depending on a
/// subset of them. `true` marks an `any` dependency.
fn scenario() -> impl Strategy<Value = (Vec<StepStatus>, Vec<(u32, bool)>)> {
    prop::collection::vec(status(), 1..12).prop_flat_map(|statuses| {
        let n = statuses.len() as u32;
        let deps = prop::collection::vec((1..=n, any::<bool>()), 0..6);
        (Just(statuses), deps)
    })
}

fn build(run_id: Uuid, statuses: &[StepStatus], deps: &[(u32, bool)]) -> (StepInstance, Vec<StepInstance>) {
    let siblings = statuses
        .iter()
        .enumerate()
        .map(|(i, status)| {
            let mut step = StepInstance::new(run_id, "org", i as u32 + 1, format!("s{}", i + 1), WorkerType::System, vec![]);
            step.status = *status;
            step
        })
        .collect::<Vec<_>>();
    let dependencies = deps
        .iter()
        .map(|&(n, any)| if any { Dependency::any(n) } else { Dependency::sequential(n) })
        .collect();
    let target = StepInstance::new(run_id, "org", statuses.len() as u32 + 1, "target", WorkerType::System, dependencies);
    (target, siblings)
}

/// Reference readiness rule.
fn expected_ready(statuses: &[StepStatus], deps: &[(u32, bool)]) -> bool {
    deps.iter().all(|&(n, any)| {
        let status = statuses[(n - 1) as usize];
        if any {
            status.is_terminal()
        } else {
            status == StepStatus::Completed
        }
    })
}

/// YAML for a chain of transform steps with the given dependency lists.
fn playbook_yaml(deps: &[Vec<u32>]) -> String {
    let mut yaml = String::from("id: generated\nname: Generated\nsteps:\n");
    for (i, step_deps) in deps.iter().enumerate() {
        yaml.push_str(&format!(
            "  - id: step-{}\n    worker:\n      type: system\n      config:\n        operation: transform\n        mapping: {{}}\n",
            i + 1
        ));
        if !step_deps.is_empty() {
            yaml.push_str("    depends_on:\n");
            for d in step_deps {
                yaml.push_str(&format!("      - step: {d}\n"));
            }
        }
    }
    yaml
}

/// Dependency lists that only point backwards.
fn backward_graph() -> impl Strategy<Value = Vec<Vec<u32>>> {
    (1usize..15).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                if i == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    prop::collection::btree_set(1..=i as u32, 0..=i.min(3))
                        .prop_map(|set| set.into_iter().collect())
                        .boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

proptest! {
    /// Property: readiness matches the reference rule for every mix of
    /// sibling states and dependency kinds.
    #[test]
    fn prop_readiness_matches_rule((statuses, deps) in scenario()) {
        let resolver = DependencyResolver::new();
        let (target, siblings) = build(Uuid::new_v4(), &statuses, &deps);
        prop_assert_eq!(resolver.is_ready(&target, &siblings), expected_ready(&statuses, &deps));
    }

    /// Property: readiness ignores the order siblings are listed in.
    #[test]
    fn prop_readiness_is_order_independent((statuses, deps) in scenario()) {
        let resolver = DependencyResolver::new();
        let (target, mut siblings) = build(Uuid::new_v4(), &statuses, &deps);
        let forward = resolver.is_ready(&target, &siblings);
        siblings.reverse();
        prop_assert_eq!(resolver.is_ready(&target, &siblings), forward);
    }

    /// Property: a step with a blocking dependency is never ready, and only
    /// sequential-rule dependencies block.
    #[test]
    fn prop_blocked_steps_are_not_ready((statuses, deps) in scenario()) {
        let resolver = DependencyResolver::new();
        let (target, siblings) = build(Uuid::new_v4(), &statuses, &deps);
        let blocking = resolver.blocking_dependencies(&target, &siblings);
        if !blocking.is_empty() {
            prop_assert!(!resolver.is_ready(&target, &siblings));
        }
        for dep in blocking {
            prop_assert_ne!(dep.kind, DependencyKind::Any);
            let status = statuses[(dep.step_number - 1) as usize];
            prop_assert!(matches!(status, StepStatus::Failed | StepStatus::Skipped));
        }
    }

    /// Property: a step without dependencies is ready regardless of siblings.
    #[test]
    fn prop_no_dependencies_always_ready(statuses in prop::collection::vec(status(), 0..10)) {
        let resolver = DependencyResolver::new();
        let (target, siblings) = build(Uuid::new_v4(), &statuses, &[]);
        prop_assert!(resolver.is_ready(&target, &siblings));
    }

    /// Property: graphs whose edges only point backwards validate, and
    /// repeatedly completing ready steps finishes every step with each step
    /// completing after all of its dependencies.
    #[test]
    fn prop_backward_graphs_validate_and_drain(deps in backward_graph()) {
        let resolver = DependencyResolver::new();
        let definition = PlaybookDefinition::from_yaml(&playbook_yaml(&deps)).unwrap();
        prop_assert!(resolver.validate_graph(&definition).is_ok());

        let run_id = Uuid::new_v4();
        let mut steps: Vec<StepInstance> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, d)| StepInstance::new(run_id, "org", i as u32 + 1, d.id.clone(), WorkerType::System, d.depends_on.clone()))
            .collect();

        let mut order = Vec::new();
        while order.len() < steps.len() {
            let ready: Vec<usize> = (0..steps.len())
                .filter(|&i| !steps[i].status.is_terminal() && resolver.is_ready(&steps[i], &steps))
                .collect();
            prop_assert!(!ready.is_empty(), "no progress with {} of {} done", order.len(), steps.len());
            for i in ready {
                steps[i].status = StepStatus::Completed;
                order.push(steps[i].sequence);
            }
        }

        for (i, step_deps) in deps.iter().enumerate() {
            let position = order.iter().position(|&s| s == i as u32 + 1).unwrap();
            for d in step_deps {
                let dep_position = order.iter().position(|s| s == d).unwrap();
                prop_assert!(dep_position < position);
            }
        }
    }

    /// Property: any edge pointing at the same or a later step is rejected.
    #[test]
    fn prop_forward_edges_are_rejected(deps in backward_graph(), from in 0usize..15, offset in 0u32..3) {
        let resolver = DependencyResolver::new();
        let mut deps = deps;
        let from = from % deps.len();
        let target = (from as u32 + 1 + offset).min(deps.len() as u32 + 2);
        deps[from].push(target);

        let definition = PlaybookDefinition::from_yaml(&playbook_yaml(&deps)).unwrap();
        prop_assert!(resolver.validate_graph(&definition).is_err());
    }
}
