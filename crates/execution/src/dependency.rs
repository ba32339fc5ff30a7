//! Dependency resolution for plan steps.

use collective_core::{Plan, StepKey};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Steps that may run concurrently, in declared plan order.
pub type Wave = Vec<StepKey>;

/// The plan's `step_<N>` references form a cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cyclic dependency between steps {steps:?}")]
pub struct CyclicDependencyError {
    /// Indices of every step that could not be ordered
    pub steps: Vec<u32>,
}

/// Orders plan steps into waves.
///
/// A step lands in the first wave after all of its dependencies. Waves are
/// built iteratively (Kahn's algorithm), so arbitrarily deep or cyclic
/// plans cannot overflow the stack.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Create a new resolver.
    pub fn new() -> Self {
        Self
    }

    /// Compute the execution waves of a plan.
    pub fn resolve(&self, plan: &Plan) -> Result<Vec<Wave>, CyclicDependencyError> {
        let graph = DepGraph::build(plan);
        let levels = graph.levels()?;

        let depth = levels.iter().copied().max().map_or(0, |max| max + 1);
        let mut waves: Vec<Wave> = vec![Vec::new(); depth];
        for (pos, level) in levels.iter().enumerate() {
            waves[*level].push(graph.keys[pos]);
        }

        self.check_hints(plan, &graph, &levels);

        debug!(
            task_id = %plan.task_id(),
            waves = waves.len(),
            "Resolved plan into waves"
        );
        Ok(waves)
    }

    /// Report `parallel_with` hints that cannot be honoured.
    ///
    /// Steps are already placed in the earliest wave their dependencies
    /// allow, so hints never move a step; contradicting hints are ignored.
    fn check_hints(&self, plan: &Plan, graph: &DepGraph, levels: &[usize]) {
        for step in plan.steps() {
            let Some(&from) = graph.position.get(&step.index) else { continue };
            for other in &step.parallel_with {
                let Some(&to) = graph.position.get(other) else { continue };
                if graph.reaches(from, to) || graph.reaches(to, from) {
                    warn!(
                        step = step.index,
                        parallel_with = other,
                        "Ignoring parallel hint that contradicts a data dependency"
                    );
                } else if levels[from] != levels[to] {
                    debug!(
                        step = step.index,
                        parallel_with = other,
                        "Parallel hint spans waves; both steps already run as early as possible"
                    );
                }
            }
        }
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Step dependency graph over plan positions.
struct DepGraph {
    /// position -> step key
    keys: Vec<StepKey>,
    /// step index -> position
    position: HashMap<u32, usize>,
    /// position -> [positions it depends on]
    dependencies: Vec<BTreeSet<usize>>,
    /// position -> [positions depending on it]
    dependents: Vec<Vec<usize>>,
}

impl DepGraph {
    fn build(plan: &Plan) -> Self {
        let keys: Vec<StepKey> = plan.steps().iter().map(|s| s.key()).collect();
        let position: HashMap<u32, usize> = keys
            .iter()
            .enumerate()
            .map(|(pos, key)| (key.index(), pos))
            .collect();

        let mut dependencies = vec![BTreeSet::new(); keys.len()];
        let mut dependents = vec![Vec::new(); keys.len()];

        for (pos, step) in plan.steps().iter().enumerate() {
            for dep in step.dependencies() {
                // Plans are validated, so every reference resolves.
                if let Some(&dep_pos) = position.get(&dep.index()) {
                    if dependencies[pos].insert(dep_pos) {
                        dependents[dep_pos].push(pos);
                    }
                }
            }
        }

        Self {
            keys,
            position,
            dependencies,
            dependents,
        }
    }

    /// Wave level of every position, or the steps left in a cycle.
    fn levels(&self) -> Result<Vec<usize>, CyclicDependencyError> {
        let n = self.keys.len();
        let mut remaining: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut levels: Vec<Option<usize>> = vec![None; n];

        let mut current: Vec<usize> = (0..n).filter(|pos| remaining[*pos] == 0).collect();
        let mut level = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for &pos in &current {
                levels[pos] = Some(level);
                for &dependent in &self.dependents[pos] {
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            current = next;
            level += 1;
        }

        let unplaced: Vec<u32> = (0..n)
            .filter(|pos| levels[*pos].is_none())
            .map(|pos| self.keys[pos].index())
            .collect();

        if !unplaced.is_empty() {
            return Err(CyclicDependencyError { steps: unplaced });
        }

        Ok(levels.into_iter().flatten().collect())
    }

    /// Whether `from` transitively depends on `to`.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut visited = vec![false; self.keys.len()];

        while let Some(pos) = stack.pop() {
            for &dep in &self.dependencies[pos] {
                if dep == to {
                    return true;
                }
                if !visited[dep] {
                    visited[dep] = true;
                    stack.push(dep);
                }
            }
        }
        false
    }
}
