//! The layout inference pass.
//!
//! [layout_inference] copies a source graph into a fresh output graph, operation by operation
//! in dependency order, letting each operation kind's [RewriteRule] choose the layouts its
//! tensors take. Transposes are inserted only where a consumer needs a layout its producer did
//! not provide, and at the graph outputs, which always keep their declared axis order.

use indexmap::IndexMap;
use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::context::{LayoutInferContext, PassStats};
use crate::graph::{Context, Graph, GraphError, OpId, OpKind, TensorId};
use crate::permute::{PermuteError, PermuteVector};
use crate::rules::{Registry, RewriteRule};
use crate::state::{LayoutStateError, TensorLayoutState};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LayoutInferError {
    #[error(transparent)]
    Permute(#[from] PermuteError),
    #[error(transparent)]
    State(#[from] LayoutStateError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("No rewrite rule for {op} of kind {kind}")]
    UnsupportedOperationKind { op: OpId, kind: OpKind },
    #[error("Inputs of {op} ({kind}) cannot share a layout: {detail}")]
    IncompatibleInputLayouts {
        op: OpId,
        kind: OpKind,
        detail: String,
    },
    #[error("Attribute {name:?} of {op} is invalid")]
    InvalidAttribute { op: OpId, name: String },
    #[error(
        "Graph is malformed: {} operations never became ready and {} tensors were never produced",
        .pending.len(),
        .unproduced.len()
    )]
    MalformedGraph {
        pending: Vec<OpId>,
        unproduced: Vec<TensorId>,
    },
    #[error("Rewrite rule for {op} ({kind}) did not bind output {tensor}")]
    MissingOutputBinding {
        op: OpId,
        kind: OpKind,
        tensor: TensorId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Seeding,
    Propagating,
    Finalizing,
    Done,
}

/// The result of a successful pass.
#[derive(Debug)]
pub struct LayoutInference {
    pub graph: Graph,
    /// Source graph inputs to the output graph's corresponding inputs.
    pub inputs: IndexMap<TensorId, TensorId>,
    /// Source graph outputs to output graph tensors holding the same values in declared order.
    pub outputs: IndexMap<TensorId, TensorId>,
    pub state: TensorLayoutState,
    pub stats: PassStats,
}

struct Pass<'a, 'r> {
    cx: LayoutInferContext<'a>,
    registry: &'r Registry,
    stage: Stage,
}

/// Runs layout inference over `src`, allocating the output graph from `ctx`.
///
/// On error no partial output graph is returned.
pub fn layout_inference(
    src: &Graph,
    ctx: &Context,
    registry: &Registry,
) -> Result<LayoutInference, LayoutInferError> {
    let mut pass = Pass {
        cx: LayoutInferContext::new(src, ctx.create_graph()),
        registry,
        stage: Stage::Seeding,
    };
    pass.seed()?;
    pass.enter(Stage::Propagating);
    pass.propagate()?;
    pass.check_complete()?;
    pass.enter(Stage::Finalizing);
    pass.finalize()?;
    pass.enter(Stage::Done);

    let parts = pass.cx.into_parts();
    info!(
        "Layout inference over {} operations: {} rewritten, {} transposes inserted ({} reused)",
        src.op_count(),
        parts.stats.rewritten_ops,
        parts.stats.inserted_transposes,
        parts.stats.reused_transposes
    );
    Ok(LayoutInference {
        graph: parts.graph,
        inputs: parts.inputs,
        outputs: parts.outputs,
        state: parts.state,
        stats: parts.stats,
    })
}

impl<'a, 'r> Pass<'a, 'r> {
    fn enter(&mut self, stage: Stage) {
        debug_assert!(stage > self.stage);
        debug!("{} -> {}", self.stage, stage);
        self.stage = stage;
    }

    fn seed(&mut self) -> Result<(), LayoutInferError> {
        let src = self.cx.src();
        for &input in src.inputs() {
            let seeded = self.cx.clone_tensor(input);
            let rank = src.tensor(input).rank();
            self.cx.record(input, seeded, PermuteVector::identity(rank))?;
            self.cx.bind_graph_input(input, seeded)?;
        }
        for constant in src.constants() {
            let seeded = self.cx.clone_tensor(constant);
            let rank = src.tensor(constant).rank();
            self.cx
                .record(constant, seeded, PermuteVector::identity(rank))?;
        }
        Ok(())
    }

    fn propagate(&mut self) -> Result<(), LayoutInferError> {
        let src = self.cx.src();
        let mut queue: VecDeque<OpId> = src.op_ids().filter(|&op| self.cx.is_ready(op)).collect();
        let mut queued: HashSet<OpId> = queue.iter().copied().collect();

        while let Some(op) = queue.pop_front() {
            self.rewrite(op)?;
            let fresh = self.cx.mark_rewritten(op);
            debug_assert!(fresh, "{op} rewritten twice");
            for &output in &src.op(op).outputs {
                for &consumer in src.consumers(output) {
                    if !self.cx.is_rewritten(consumer)
                        && !queued.contains(&consumer)
                        && self.cx.is_ready(consumer)
                    {
                        queued.insert(consumer);
                        queue.push_back(consumer);
                    }
                }
            }
        }
        Ok(())
    }

    fn rewrite(&mut self, op: OpId) -> Result<(), LayoutInferError> {
        let src = self.cx.src();
        let kind = &src.op(op).kind;
        let rule: &dyn RewriteRule = match self.registry.rule(kind) {
            Some(rule) => rule,
            None => match self.registry.fallback() {
                Some(rule) => {
                    warn!("No rewrite rule for kind {kind}; using the fallback for {op}");
                    rule
                }
                None => {
                    return Err(LayoutInferError::UnsupportedOperationKind {
                        op,
                        kind: kind.clone(),
                    })
                }
            },
        };
        rule.rewrite(&mut self.cx, op)?;
        for &output in &src.op(op).outputs {
            if !self.cx.state().is_produced(output) {
                return Err(LayoutInferError::MissingOutputBinding {
                    op,
                    kind: kind.clone(),
                    tensor: output,
                });
            }
        }
        Ok(())
    }

    /// Fails if propagation stopped short of the whole graph: some operation sits on a cycle or
    /// reads a tensor nothing produces.
    fn check_complete(&self) -> Result<(), LayoutInferError> {
        let src = self.cx.src();
        if self.cx.rewritten_count() == src.op_count()
            && self.cx.state().len() == src.tensor_count()
        {
            return Ok(());
        }
        let pending: Vec<OpId> = src
            .op_ids()
            .filter(|&op| !self.cx.is_rewritten(op))
            .collect();
        let unproduced: Vec<TensorId> = src
            .tensor_ids()
            .filter(|&t| !self.cx.state().is_produced(t))
            .collect();
        Err(LayoutInferError::MalformedGraph {
            pending,
            unproduced,
        })
    }

    fn finalize(&mut self) -> Result<(), LayoutInferError> {
        let src = self.cx.src();
        for &output in src.outputs() {
            // Shares any transpose an internal consumer already needed in declared order.
            let declared = PermuteVector::identity(src.tensor(output).rank());
            let bound = self.cx.reconcile(output, &declared)?;
            self.cx.promote_output(bound);
            self.cx.bind_graph_output(output, bound)?;
        }
        Ok(())
    }
}

impl LayoutInference {
    /// Both boundary maps, inputs first.
    pub fn io_map(&self) -> IndexMap<TensorId, TensorId> {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .map(|(&s, &o)| (s, o))
            .collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Seeding => "seeding",
            Stage::Propagating => "propagating",
            Stage::Finalizing => "finalizing",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}
