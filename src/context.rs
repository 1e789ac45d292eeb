use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::graph::{AttrValue, Attrs, Graph, OpId, TensorId};
use crate::infer::LayoutInferError;
use crate::permute::PermuteVector;
use crate::state::{LayoutBinding, LayoutStateError, TensorLayoutState};
use crate::tensor::TensorSpec;

pub const TRANSPOSE: &str = "transpose";
pub const RESHAPE: &str = "reshape";

/// Bookkeeping for one run of layout inference.
///
/// Holds the (read-only) source graph, the output graph under construction, the
/// [TensorLayoutState], the set of rewritten source operations, and the graph input/output
/// boundary maps. Rewrite rules read and extend the output graph through this type.
pub struct LayoutInferContext<'a> {
    src: &'a Graph,
    out: Graph,
    state: TensorLayoutState,
    rewritten: HashSet<OpId>,
    graph_inputs: IndexMap<TensorId, TensorId>,
    graph_outputs: IndexMap<TensorId, TensorId>,
    // Transposes already inserted, keyed by their input tensor and `perm`.
    relayouts: HashMap<(TensorId, PermuteVector), TensorId>,
    // Broadcast expansions, keyed by their input tensor and rank.
    expansions: HashMap<(TensorId, usize), TensorId>,
    stats: PassStats,
}

/// Counters describing what a pass did to the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PassStats {
    pub rewritten_ops: usize,
    pub inserted_transposes: usize,
    pub reused_transposes: usize,
}

pub(crate) struct ContextParts {
    pub graph: Graph,
    pub state: TensorLayoutState,
    pub inputs: IndexMap<TensorId, TensorId>,
    pub outputs: IndexMap<TensorId, TensorId>,
    pub stats: PassStats,
}

impl<'a> LayoutInferContext<'a> {
    pub fn new(src: &'a Graph, out: Graph) -> Self {
        LayoutInferContext {
            src,
            out,
            state: TensorLayoutState::new(),
            rewritten: HashSet::new(),
            graph_inputs: IndexMap::new(),
            graph_outputs: IndexMap::new(),
            relayouts: HashMap::new(),
            expansions: HashMap::new(),
            stats: PassStats::default(),
        }
    }

    /// The source graph. The returned reference outlives `self`'s borrow so that rules can hold
    /// an [Operation](crate::graph::Operation) while mutating the context.
    #[inline]
    pub fn src(&self) -> &'a Graph {
        self.src
    }

    #[inline]
    pub fn out(&self) -> &Graph {
        &self.out
    }

    #[inline]
    pub fn state(&self) -> &TensorLayoutState {
        &self.state
    }

    pub fn stats(&self) -> PassStats {
        self.stats
    }

    pub fn lookup(&self, source: TensorId) -> Result<&LayoutBinding, LayoutInferError> {
        Ok(self.state.lookup(source)?)
    }

    pub fn record(
        &mut self,
        source: TensorId,
        output: TensorId,
        pv: PermuteVector,
    ) -> Result<(), LayoutInferError> {
        debug!("{source} -> {output} with layout {pv}");
        Ok(self.state.record(source, output, pv)?)
    }

    /// Marks `op` as rewritten. Returns `false` if it already was.
    pub fn mark_rewritten(&mut self, op: OpId) -> bool {
        let fresh = self.rewritten.insert(op);
        if fresh {
            self.stats.rewritten_ops += 1;
        }
        fresh
    }

    #[inline]
    pub fn is_rewritten(&self, op: OpId) -> bool {
        self.rewritten.contains(&op)
    }

    pub fn rewritten_count(&self) -> usize {
        self.rewritten.len()
    }

    /// True if every input of `op` has been produced in the output graph. Graph inputs and
    /// constants count once they have been seeded.
    pub fn is_ready(&self, op: OpId) -> bool {
        self.src
            .op(op)
            .inputs
            .iter()
            .all(|&t| self.state.is_produced(t))
    }

    pub fn bind_graph_input(
        &mut self,
        source: TensorId,
        output: TensorId,
    ) -> Result<(), LayoutInferError> {
        if self.graph_inputs.contains_key(&source) {
            return Err(LayoutStateError::DuplicateBinding(source).into());
        }
        self.graph_inputs.insert(source, output);
        Ok(())
    }

    pub fn bind_graph_output(
        &mut self,
        source: TensorId,
        output: TensorId,
    ) -> Result<(), LayoutInferError> {
        if self.graph_outputs.contains_key(&source) {
            return Err(LayoutStateError::DuplicateBinding(source).into());
        }
        self.graph_outputs.insert(source, output);
        Ok(())
    }

    pub fn graph_input_map(&self) -> &IndexMap<TensorId, TensorId> {
        &self.graph_inputs
    }

    pub fn graph_output_map(&self) -> &IndexMap<TensorId, TensorId> {
        &self.graph_outputs
    }

    /// Copies a source tensor's spec into the output graph, keeping its role.
    pub fn clone_tensor(&mut self, source: TensorId) -> TensorId {
        self.out.create_tensor(self.src.tensor(source).clone())
    }

    /// Returns an output-graph tensor holding `source`'s value laid out by `required`.
    ///
    /// If `source` is already laid out that way, its bound tensor is returned. Otherwise a
    /// Transpose is inserted, or reused if one with the same input and `perm` already exists.
    /// The binding of `source` in the [TensorLayoutState] is never changed.
    pub fn reconcile(
        &mut self,
        source: TensorId,
        required: &PermuteVector,
    ) -> Result<TensorId, LayoutInferError> {
        let LayoutBinding { tensor, pv } = self.lookup(source)?.clone();
        if &pv == required {
            return Ok(tensor);
        }
        let spec = self.src.tensor(source).as_transient();
        self.relayout(tensor, &spec, &pv, required)
    }

    /// Like [LayoutInferContext::reconcile], but for a lower-rank operand broadcast against
    /// tensors laid out by `required`.
    ///
    /// The operand is brought to declared order, reshaped to `required.rank()` by prepending
    /// unit axes, and then transposed. Each step is shared with earlier consumers.
    pub fn reconcile_expanded(
        &mut self,
        source: TensorId,
        required: &PermuteVector,
    ) -> Result<TensorId, LayoutInferError> {
        let spec = self.src.tensor(source).as_transient();
        if spec.rank() == required.rank() {
            return self.reconcile(source, required);
        }
        let rank = required.rank();
        let expanded_spec = spec.expanded(rank)?;
        let declared = self.reconcile(source, &PermuteVector::identity(spec.rank()))?;
        let expanded = match self.expansions.get(&(declared, rank)) {
            Some(&cached) => cached,
            None => {
                let expanded = self.out.create_tensor(expanded_spec.clone());
                let mut attrs = Attrs::new();
                let dims = expanded_spec.shape.iter().map(|&d| i64::from(d)).collect();
                attrs.insert("shape".to_string(), AttrValue::Ints(dims));
                let op = self
                    .out
                    .create_operation(RESHAPE, attrs, vec![declared], vec![expanded])?;
                debug!("Inserted {RESHAPE} {op} expanding {source} to rank {rank}");
                self.expansions.insert((declared, rank), expanded);
                expanded
            }
        };
        let identity = PermuteVector::identity(rank);
        if &identity == required {
            return Ok(expanded);
        }
        self.relayout(expanded, &expanded_spec, &identity, required)
    }

    /// Returns a tensor holding `input`, whose logical spec is `logical` and which is laid out
    /// by `from`, laid out by `to` instead. Transposes are memoized by input and `perm`.
    fn relayout(
        &mut self,
        input: TensorId,
        logical: &TensorSpec,
        from: &PermuteVector,
        to: &PermuteVector,
    ) -> Result<TensorId, LayoutInferError> {
        let perm = from.invert().compose(to)?;
        if let Some(&cached) = self.relayouts.get(&(input, perm.clone())) {
            self.stats.reused_transposes += 1;
            return Ok(cached);
        }
        let transposed = self.out.create_tensor(logical.permuted(to)?);
        let mut attrs = Attrs::new();
        attrs.insert("perm".to_string(), AttrValue::Ints(perm.to_i64s()));
        let op = self
            .out
            .create_operation(TRANSPOSE, attrs, vec![input], vec![transposed])?;
        self.stats.inserted_transposes += 1;
        debug!("Inserted {TRANSPOSE} {op} ({perm}) for {input}: {from} -> {to}");
        self.relayouts.insert((input, perm), transposed);
        Ok(transposed)
    }

    /// Emits the rewritten form of source operation `src_op` into the output graph.
    ///
    /// `inputs` are output-graph tensors. One output tensor is created per source output,
    /// shaped as that source tensor laid out by the corresponding entry of `output_pvs`, and
    /// the binding is recorded. Returns the new output tensors.
    pub fn emit(
        &mut self,
        src_op: OpId,
        attrs: Attrs,
        inputs: Vec<TensorId>,
        output_pvs: Vec<PermuteVector>,
    ) -> Result<Vec<TensorId>, LayoutInferError> {
        let src = self.src;
        let op = src.op(src_op);
        debug_assert_eq!(op.outputs.len(), output_pvs.len());
        let mut outputs = Vec::with_capacity(op.outputs.len());
        for (&o, pv) in op.outputs.iter().zip(&output_pvs) {
            // Boundary roles are settled when the pass finalizes.
            let spec = src.tensor(o).permuted(pv)?.as_transient();
            outputs.push(self.out.create_tensor(spec));
        }
        let new_op = self
            .out
            .create_operation(op.kind.clone(), attrs, inputs, outputs.clone())?;
        debug!("Rewrote {} {src_op} as {new_op}", op.kind);
        for ((&o, &t), pv) in op.outputs.iter().zip(&outputs).zip(output_pvs) {
            self.record(o, t, pv)?;
        }
        Ok(outputs)
    }

    /// Makes `output` an output of the output graph, if it is an intermediate value.
    pub(crate) fn promote_output(&mut self, output: TensorId) {
        self.out.promote_to_output(output);
    }

    pub(crate) fn into_parts(self) -> ContextParts {
        ContextParts {
            graph: self.out,
            state: self.state,
            inputs: self.graph_inputs,
            outputs: self.graph_outputs,
            stats: self.stats,
        }
    }
}
