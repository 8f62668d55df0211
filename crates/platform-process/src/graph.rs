//! Process graph & builder (spec §4.7).
//!
//! Grounded in the teacher's `mqk-reconcile` state-machine shape: `gate.rs`
//! there is a pure, deterministic, no-IO decision function over
//! `(&Snapshot, &Fill)`. `ProcessGraph::next_step` plays the same role here
//! over `(&ProcessGraph, &str, &Value)` — building a command and touching
//! the database is entirely the process manager's job, never the graph's.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// What a step's forward edge looks like once the graph is built (spec
/// §4.7: "DirectNext / ConditionalNext / ParallelNext / Terminal").
#[derive(Clone)]
pub enum NextOf {
    Direct(String),
    Conditional {
        predicate: Predicate,
        when_true: String,
        when_false: Option<String>,
    },
    Parallel {
        branches: Vec<String>,
        join: String,
    },
    Terminal,
}

impl std::fmt::Debug for NextOf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NextOf::Direct(s) => f.debug_tuple("Direct").field(s).finish(),
            NextOf::Conditional { when_true, when_false, .. } => f
                .debug_struct("Conditional")
                .field("when_true", when_true)
                .field("when_false", when_false)
                .finish(),
            NextOf::Parallel { branches, join } => f
                .debug_struct("Parallel")
                .field("branches", branches)
                .field("join", join)
                .finish(),
            NextOf::Terminal => write!(f, "Terminal"),
        }
    }
}

#[derive(Debug, Clone)]
struct StepDef {
    next: NextOf,
    compensation: Option<String>,
}

/// An immutable DAG of process steps, built once per `process_type` at
/// startup and cached (spec §4.7: "Graphs are built once... and cached").
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    initial: String,
    steps: HashMap<String, StepDef>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("process graph has a cycle reachable from step {0:?}")]
    Cycle(String),
    #[error("unknown step {0:?} referenced while building the graph")]
    UnknownStep(String),
    #[error("builder misuse: {0}")]
    Builder(&'static str),
}

impl ProcessGraph {
    pub fn initial_step(&self) -> &str {
        &self.initial
    }

    /// `nextStep(currentStep, data) -> Maybe<name>` (spec §4.7). Returns
    /// `None` at `Terminal`, or when a `Conditional`'s false branch is
    /// absent and the predicate evaluates false.
    pub fn next_step(&self, current: &str, data: &Value) -> Option<String> {
        match self.steps.get(current).map(|s| &s.next) {
            Some(NextOf::Direct(next)) => Some(next.clone()),
            Some(NextOf::Conditional {
                predicate,
                when_true,
                when_false,
            }) => {
                if predicate(data) {
                    Some(when_true.clone())
                } else {
                    when_false.clone()
                }
            }
            Some(NextOf::Parallel { join, .. }) => Some(join.clone()),
            Some(NextOf::Terminal) | None => None,
        }
    }

    pub fn is_parallel(&self, step: &str) -> bool {
        matches!(self.steps.get(step).map(|s| &s.next), Some(NextOf::Parallel { .. }))
    }

    pub fn parallel_branches(&self, step: &str) -> Option<&[String]> {
        match self.steps.get(step).map(|s| &s.next) {
            Some(NextOf::Parallel { branches, .. }) => Some(branches),
            _ => None,
        }
    }

    pub fn join_step(&self, step: &str) -> Option<&str> {
        match self.steps.get(step).map(|s| &s.next) {
            Some(NextOf::Parallel { join, .. }) => Some(join),
            _ => None,
        }
    }

    pub fn requires_compensation(&self, step: &str) -> bool {
        self.steps.get(step).and_then(|s| s.compensation.as_ref()).is_some()
    }

    pub fn compensation_step(&self, step: &str) -> Option<&str> {
        self.steps.get(step)?.compensation.as_deref()
    }

    pub fn contains(&self, step: &str) -> bool {
        self.steps.contains_key(step)
    }
}

struct PendingConditional {
    owner: String,
    predicate: Predicate,
    when_true: Option<String>,
    when_false: Option<String>,
}

struct PendingParallel {
    gate: String,
    branches: Vec<String>,
}

/// Builder DSL (spec §4.7):
/// ```ignore
/// ProcessGraphBuilder::new()
///     .start_with("A").with_compensation("A_comp")
///     .then_if(pred).when_true("B").when_false("C")
///     .then("D")
///     .then_parallel()
///         .branch("E").with_compensation("E_comp")
///         .branch("F")
///         .branch("G").with_compensation("G_comp")
///     .join_at("H")
///     .then("I")
///     .end()
/// ```
pub struct ProcessGraphBuilder {
    steps: HashMap<String, StepDef>,
    initial: Option<String>,
    /// Steps whose forward edge is not yet known — wired to `Direct` (or
    /// `Terminal` at `.end()`) the next time a following step name is
    /// learned.
    open: Vec<String>,
    last_defined: Option<String>,
    pending_conditional: Option<PendingConditional>,
    pending_parallel: Option<PendingParallel>,
    gate_counter: u32,
}

impl Default for ProcessGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGraphBuilder {
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
            initial: None,
            open: Vec::new(),
            last_defined: None,
            pending_conditional: None,
            pending_parallel: None,
            gate_counter: 0,
        }
    }

    fn define(&mut self, name: &str) {
        self.steps.entry(name.to_string()).or_insert(StepDef {
            next: NextOf::Terminal,
            compensation: None,
        });
        self.last_defined = Some(name.to_string());
    }

    /// Resolve any pending conditional/parallel construct against `target`
    /// and wire every currently-open step's forward edge to it.
    fn resolve_open(&mut self, target: &str) {
        if let Some(mut pending) = self.pending_conditional.take() {
            let when_false = pending.when_false.take().or_else(|| Some(target.to_string()));
            let when_true = pending
                .when_true
                .clone()
                .expect("then_if must be followed by when_true before the next step");
            self.steps.insert(
                pending.owner.clone(),
                StepDef {
                    next: NextOf::Conditional {
                        predicate: pending.predicate.clone(),
                        when_true,
                        when_false,
                    },
                    compensation: self.steps.get(&pending.owner).and_then(|s| s.compensation.clone()),
                },
            );
        }
        for step in self.open.drain(..) {
            let compensation = self.steps.get(&step).and_then(|s| s.compensation.clone());
            self.steps.insert(
                step,
                StepDef {
                    next: NextOf::Direct(target.to_string()),
                    compensation,
                },
            );
        }
    }

    pub fn start_with(mut self, name: &str) -> Self {
        self.define(name);
        self.initial = Some(name.to_string());
        self.open = vec![name.to_string()];
        self
    }

    pub fn with_compensation(mut self, name: &str) -> Self {
        let target = if let Some(branch) = self.pending_parallel.as_ref().and_then(|p| p.branches.last()) {
            branch.clone()
        } else {
            self.last_defined.clone().expect("with_compensation has no preceding step")
        };
        if let Some(def) = self.steps.get_mut(&target) {
            def.compensation = Some(name.to_string());
        }
        self
    }

    pub fn then(mut self, name: &str) -> Self {
        self.resolve_open(name);
        self.define(name);
        self.open = vec![name.to_string()];
        self
    }

    /// Begin a conditional branch off the current open step(s). `open` must
    /// contain exactly one step — the owner whose `next` becomes
    /// `Conditional`.
    pub fn then_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        assert_eq!(self.open.len(), 1, "then_if requires exactly one open step");
        let owner = self.open.remove(0);
        self.pending_conditional = Some(PendingConditional {
            owner,
            predicate: Arc::new(predicate),
            when_true: None,
            when_false: None,
        });
        self
    }

    pub fn when_true(mut self, name: &str) -> Self {
        self.define(name);
        self.pending_conditional
            .as_mut()
            .expect("when_true without a preceding then_if")
            .when_true = Some(name.to_string());
        self.open.push(name.to_string());
        self
    }

    pub fn when_false(mut self, name: &str) -> Self {
        self.define(name);
        self.pending_conditional
            .as_mut()
            .expect("when_false without a preceding then_if")
            .when_false = Some(name.to_string());
        self.open.push(name.to_string());
        self
    }

    pub fn then_parallel(mut self) -> Self {
        self.gate_counter += 1;
        let gate = format!("__parallel_{}__", self.gate_counter);
        self.resolve_open(&gate);
        self.define(&gate);
        self.pending_parallel = Some(PendingParallel {
            gate,
            branches: Vec::new(),
        });
        self
    }

    pub fn branch(mut self, name: &str) -> Self {
        self.define(name);
        self.pending_parallel
            .as_mut()
            .expect("branch without a preceding then_parallel")
            .branches
            .push(name.to_string());
        self
    }

    pub fn join_at(mut self, name: &str) -> Self {
        let pending = self
            .pending_parallel
            .take()
            .expect("join_at without a preceding then_parallel");
        self.define(name);
        for branch in &pending.branches {
            self.steps.insert(
                branch.clone(),
                StepDef {
                    next: NextOf::Direct(name.to_string()),
                    compensation: self.steps.get(branch).and_then(|s| s.compensation.clone()),
                },
            );
        }
        self.steps.insert(
            pending.gate.clone(),
            StepDef {
                next: NextOf::Parallel {
                    branches: pending.branches,
                    join: name.to_string(),
                },
                compensation: None,
            },
        );
        self.open = vec![name.to_string()];
        self
    }

    pub fn end(mut self) -> Result<ProcessGraph, GraphError> {
        // No following step exists at end-of-graph, so a still-pending
        // conditional keeps whatever `when_false` it was given (no
        // fallthrough target to default to), and every currently-open step
        // (including either conditional branch) terminates the graph.
        if let Some(pending) = self.pending_conditional.take() {
            let when_true = pending
                .when_true
                .clone()
                .ok_or(GraphError::Builder("then_if has no when_true"))?;
            self.steps.insert(
                pending.owner,
                StepDef {
                    next: NextOf::Conditional {
                        predicate: pending.predicate,
                        when_true,
                        when_false: pending.when_false,
                    },
                    compensation: None,
                },
            );
        }
        for step in self.open.drain(..) {
            let compensation = self.steps.get(&step).and_then(|s| s.compensation.clone());
            self.steps.insert(
                step,
                StepDef {
                    next: NextOf::Terminal,
                    compensation,
                },
            );
        }
        let initial = self.initial.ok_or(GraphError::Builder("start_with was never called"))?;
        let graph = ProcessGraph {
            initial: initial.clone(),
            steps: self.steps,
        };
        detect_cycle(&graph)?;
        Ok(graph)
    }
}

fn detect_cycle(graph: &ProcessGraph) -> Result<(), GraphError> {
    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();
    visit(graph, graph.initial_step(), &mut visiting, &mut visited)
}

fn visit(
    graph: &ProcessGraph,
    step: &str,
    visiting: &mut HashSet<String>,
    visited: &mut HashSet<String>,
) -> Result<(), GraphError> {
    if visited.contains(step) {
        return Ok(());
    }
    if !visiting.insert(step.to_string()) {
        return Err(GraphError::Cycle(step.to_string()));
    }

    let edges: Vec<String> = match graph.steps.get(step).map(|s| &s.next) {
        Some(NextOf::Direct(next)) => vec![next.clone()],
        Some(NextOf::Conditional { when_true, when_false, .. }) => {
            let mut v = vec![when_true.clone()];
            v.extend(when_false.clone());
            v
        }
        Some(NextOf::Parallel { branches, join }) => {
            let mut v = branches.clone();
            v.push(join.clone());
            v
        }
        Some(NextOf::Terminal) | None => vec![],
    };
    for next in edges {
        visit(graph, &next, visiting, visited)?;
    }
    visiting.remove(step);
    visited.insert(step.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> ProcessGraph {
        ProcessGraphBuilder::new()
            .start_with("A")
            .with_compensation("A_comp")
            .then_if(|data: &Value| data.get("vip").and_then(Value::as_bool).unwrap_or(false))
            .when_true("B")
            .when_false("C")
            .then("D")
            .then_parallel()
            .branch("E")
            .with_compensation("E_comp")
            .branch("F")
            .branch("G")
            .join_at("H")
            .then("I")
            .end()
            .unwrap()
    }

    #[test]
    fn initial_step_is_the_first_defined_one() {
        assert_eq!(sample_graph().initial_step(), "A");
    }

    #[test]
    fn conditional_routes_on_predicate() {
        let graph = sample_graph();
        assert_eq!(graph.next_step("A", &serde_json::json!({"vip": true})), Some("B".to_string()));
        assert_eq!(graph.next_step("A", &serde_json::json!({"vip": false})), Some("C".to_string()));
    }

    #[test]
    fn both_conditional_branches_converge_on_d() {
        let graph = sample_graph();
        assert_eq!(graph.next_step("B", &Value::Null), Some("D".to_string()));
        assert_eq!(graph.next_step("C", &Value::Null), Some("D".to_string()));
    }

    #[test]
    fn d_fans_out_to_the_parallel_gate_whose_join_is_h() {
        let graph = sample_graph();
        let gate = graph.next_step("D", &Value::Null).unwrap();
        assert!(graph.is_parallel(&gate));
        assert_eq!(graph.parallel_branches(&gate), Some(["E".to_string(), "F".to_string(), "G".to_string()].as_slice()));
        assert_eq!(graph.join_step(&gate), Some("H"));
    }

    #[test]
    fn join_step_continues_to_i_then_terminal() {
        let graph = sample_graph();
        assert_eq!(graph.next_step("H", &Value::Null), Some("I".to_string()));
        assert_eq!(graph.next_step("I", &Value::Null), None);
    }

    #[test]
    fn compensation_is_attached_to_the_right_steps() {
        let graph = sample_graph();
        assert_eq!(graph.compensation_step("A"), Some("A_comp"));
        assert_eq!(graph.compensation_step("E"), Some("E_comp"));
        assert!(!graph.requires_compensation("F"));
    }

    #[test]
    fn a_graph_with_a_cycle_is_rejected() {
        let mut steps = HashMap::new();
        steps.insert(
            "A".to_string(),
            StepDef {
                next: NextOf::Direct("B".to_string()),
                compensation: None,
            },
        );
        steps.insert(
            "B".to_string(),
            StepDef {
                next: NextOf::Direct("A".to_string()),
                compensation: None,
            },
        );
        let graph = ProcessGraph {
            initial: "A".to_string(),
            steps,
        };
        assert!(matches!(detect_cycle(&graph), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn missing_when_false_falls_through_to_the_next_sequential_step() {
        let graph = ProcessGraphBuilder::new()
            .start_with("A")
            .then_if(|_: &Value| false)
            .when_true("B")
            .then("D")
            .end()
            .unwrap();
        assert_eq!(graph.next_step("A", &Value::Null), Some("D".to_string()));
    }
}
