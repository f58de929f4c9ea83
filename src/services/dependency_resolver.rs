use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Dependency, DependencyKind, PlaybookDefinition, StepInstance, StepStatus};
use std::collections::{HashMap, HashSet};

/// Service deciding whether a step's dependencies are satisfied.
///
/// All functions are pure: they look only at the step and the snapshot of
/// its siblings passed in.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver;

/// Whether a sibling's status satisfies a dependency of the given kind.
fn satisfies(kind: DependencyKind, status: StepStatus) -> bool {
    match kind {
        DependencyKind::Any => status.is_terminal(),
        DependencyKind::Sequential | DependencyKind::Conditional | DependencyKind::Unknown => {
            status == StepStatus::Completed
        }
    }
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// A step is ready when every dependency is satisfied by its sibling.
    /// A dependency whose sibling is absent is unsatisfied.
    pub fn is_ready(&self, step: &StepInstance, siblings: &[StepInstance]) -> bool {
        if step.dependencies.is_empty() {
            return true;
        }

        let by_sequence = index_by_sequence(siblings);
        step.dependencies.iter().all(|dep| {
            by_sequence
                .get(&dep.step_number)
                .is_some_and(|sibling| satisfies(dep.kind, sibling.status))
        })
    }

    /// Dependencies that can never be satisfied: a sequential-rule
    /// dependency on a sibling that failed or was skipped.
    pub fn blocking_dependencies<'a>(
        &self,
        step: &'a StepInstance,
        siblings: &[StepInstance],
    ) -> Vec<&'a Dependency> {
        let by_sequence = index_by_sequence(siblings);
        step.dependencies
            .iter()
            .filter(|dep| dep.kind != DependencyKind::Any)
            .filter(|dep| {
                by_sequence.get(&dep.step_number).is_some_and(|sibling| {
                    matches!(sibling.status, StepStatus::Failed | StepStatus::Skipped)
                })
            })
            .collect()
    }

    /// Reject malformed dependency graphs before a definition is stored.
    ///
    /// Dependencies may only point at strictly earlier sequence numbers, so a
    /// valid graph is acyclic by construction.
    pub fn validate_graph(&self, definition: &PlaybookDefinition) -> DomainResult<()> {
        if definition.steps.is_empty() {
            return Err(DomainError::ValidationFailed(format!(
                "playbook '{}' has no steps",
                definition.id
            )));
        }

        let mut seen_ids = HashSet::new();
        for (idx, step) in definition.steps.iter().enumerate() {
            let sequence = idx as u32 + 1;

            if step.id.trim().is_empty() {
                return Err(DomainError::ValidationFailed(format!(
                    "step {sequence} has an empty id"
                )));
            }
            if !seen_ids.insert(step.id.as_str()) {
                return Err(DomainError::ValidationFailed(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }

            for dep in &step.depends_on {
                if dep.step_number == 0 || dep.step_number as usize > definition.steps.len() {
                    return Err(DomainError::ValidationFailed(format!(
                        "step '{}' depends on missing step {}",
                        step.id, dep.step_number
                    )));
                }
                if dep.step_number >= sequence {
                    return Err(DomainError::ValidationFailed(format!(
                        "step '{}' (#{sequence}) may only depend on earlier steps, found {}",
                        step.id, dep.step_number
                    )));
                }
                if dep.kind == DependencyKind::Conditional && dep.condition.is_none() {
                    return Err(DomainError::ValidationFailed(format!(
                        "conditional dependency of step '{}' on step {} has no condition",
                        step.id, dep.step_number
                    )));
                }
            }
        }
        Ok(())
    }
}

fn index_by_sequence(siblings: &[StepInstance]) -> HashMap<u32, &StepInstance> {
    siblings.iter().map(|s| (s.sequence, s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{StepDefinition, SystemOperation, WorkerSpec, WorkerType};
    use uuid::Uuid;

    fn sibling(run_id: Uuid, sequence: u32, status: StepStatus) -> StepInstance {
        let mut s = StepInstance::new(run_id, "org", sequence, format!("s{sequence}"), WorkerType::System, vec![]);
        s.status = status;
        s
    }

    fn step_with(run_id: Uuid, deps: Vec<Dependency>) -> StepInstance {
        StepInstance::new(run_id, "org", 9, "target", WorkerType::System, deps)
    }

    #[test]
    fn test_no_dependencies_is_ready_without_siblings() {
        let resolver = DependencyResolver::new();
        let step = step_with(Uuid::new_v4(), vec![]);
        assert!(resolver.is_ready(&step, &[]));
    }

    #[test]
    fn test_sequential_requires_completed() {
        let resolver = DependencyResolver::new();
        let run = Uuid::new_v4();
        let step = step_with(run, vec![Dependency::sequential(1)]);

        for status in [
            StepStatus::NotReady,
            StepStatus::Pending,
            StepStatus::InProgress,
            StepStatus::RetryPending,
            StepStatus::Failed,
            StepStatus::Skipped,
        ] {
            assert!(!resolver.is_ready(&step, &[sibling(run, 1, status)]), "{status:?}");
        }
        assert!(resolver.is_ready(&step, &[sibling(run, 1, StepStatus::Completed)]));
    }

    #[test]
    fn test_any_accepts_every_terminal_state() {
        let resolver = DependencyResolver::new();
        let run = Uuid::new_v4();
        let step = step_with(run, vec![Dependency::any(1)]);

        assert!(resolver.is_ready(&step, &[sibling(run, 1, StepStatus::Completed)]));
        assert!(resolver.is_ready(&step, &[sibling(run, 1, StepStatus::Failed)]));
        assert!(resolver.is_ready(&step, &[sibling(run, 1, StepStatus::Skipped)]));
        assert!(!resolver.is_ready(&step, &[sibling(run, 1, StepStatus::InProgress)]));
    }

    #[test]
    fn test_missing_sibling_is_not_ready() {
        let resolver = DependencyResolver::new();
        let run = Uuid::new_v4();
        let step = step_with(run, vec![Dependency::sequential(4)]);
        assert!(!resolver.is_ready(&step, &[sibling(run, 1, StepStatus::Completed)]));
    }

    #[test]
    fn test_unknown_kind_follows_sequential_rule() {
        let resolver = DependencyResolver::new();
        let run = Uuid::new_v4();
        let dep: Dependency =
            serde_json::from_value(serde_json::json!({"step_number": 1, "kind": "eventually"})).unwrap();
        assert_eq!(dep.kind, DependencyKind::Unknown);

        let step = step_with(run, vec![dep]);
        assert!(!resolver.is_ready(&step, &[sibling(run, 1, StepStatus::Failed)]));
        assert!(resolver.is_ready(&step, &[sibling(run, 1, StepStatus::Completed)]));
    }

    #[test]
    fn test_blocking_dependencies() {
        let resolver = DependencyResolver::new();
        let run = Uuid::new_v4();
        let step = step_with(run, vec![Dependency::sequential(1), Dependency::any(2), Dependency::sequential(3)]);
        let siblings = vec![
            sibling(run, 1, StepStatus::Failed),
            sibling(run, 2, StepStatus::Failed),
            sibling(run, 3, StepStatus::Pending),
        ];

        let blocking = resolver.blocking_dependencies(&step, &siblings);
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].step_number, 1);
    }

    fn definition(deps: Vec<Vec<Dependency>>) -> PlaybookDefinition {
        PlaybookDefinition {
            id: "pb".into(),
            organization_id: None,
            name: "pb".into(),
            version: 1,
            description: None,
            steps: deps
                .into_iter()
                .enumerate()
                .map(|(i, depends_on)| StepDefinition {
                    id: format!("step-{}", i + 1),
                    name: None,
                    worker: WorkerSpec::System(SystemOperation::Transform {
                        mapping: Default::default(),
                    }),
                    depends_on,
                    required: true,
                    max_retries: None,
                    permissions: vec![],
                    timeout_secs: None,
                    input: serde_json::Value::Null,
                })
                .collect(),
        }
    }

    #[test]
    fn test_validate_graph() {
        let resolver = DependencyResolver::new();
        assert!(resolver
            .validate_graph(&definition(vec![vec![], vec![Dependency::sequential(1)]]))
            .is_ok());

        // Self reference
        assert!(resolver
            .validate_graph(&definition(vec![vec![Dependency::sequential(1)]]))
            .is_err());
        // Forward reference
        assert!(resolver
            .validate_graph(&definition(vec![vec![Dependency::sequential(2)], vec![]]))
            .is_err());
        // Missing step
        assert!(resolver
            .validate_graph(&definition(vec![vec![], vec![Dependency::sequential(7)]]))
            .is_err());
        // Empty playbook
        assert!(resolver.validate_graph(&definition(vec![])).is_err());

        let mut dup = definition(vec![vec![], vec![]]);
        dup.steps[1].id = "step-1".into();
        assert!(resolver.validate_graph(&dup).is_err());
    }
}
