//! Arena-backed tensor computation graphs.
//!
//! Tensors and operations live in per-graph vectors and are addressed by small handles
//! ([TensorId], [OpId]) which also carry the owning graph's [GraphId]. Operations refer to their
//! operands by handle, so there are no reference cycles between producers and consumers.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{self, AtomicU32, AtomicUsize};

use crate::tensor::{TensorRole, TensorSpec};

static GRAPH_NEXT_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GraphId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId {
    graph: GraphId,
    index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId {
    graph: GraphId,
    index: u32,
}

/// An operation kind tag. The set of kinds is open: a kind means whatever the
/// [Registry](crate::rules::Registry) in use says it means.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct OpKind(String);

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Str(String),
}

pub type Attrs = BTreeMap<String, AttrValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OpKind,
    pub attrs: Attrs,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Tensor {0} does not belong to this graph")]
    ForeignTensor(TensorId),
    #[error("Tensor {0} already has a producer ({1})")]
    AlreadyProduced(TensorId, OpId),
    #[error("Tensor {0} is an input or constant and cannot be produced by an operation")]
    NotProducible(TensorId),
    #[error("Tensor {0} is bound twice as an output of the same operation")]
    RepeatedOutput(TensorId),
}

/// Allocates graphs.
///
/// Memory for tensors is never touched here; a [Context] only hands out graphs whose handles
/// cannot collide with those of any other graph in the process.
#[derive(Debug, Default)]
pub struct Context {
    graphs_created: AtomicUsize,
}

/// A directed graph of [Operation]s over tensors.
///
/// Graph inputs and outputs are the tensors created with [TensorRole::Input] and
/// [TensorRole::Output], in creation order.
#[derive(Debug)]
pub struct Graph {
    id: GraphId,
    tensors: Vec<TensorSpec>,
    producers: Vec<Option<OpId>>,
    consumers: Vec<Vec<OpId>>,
    ops: Vec<Operation>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn create_graph(&self) -> Graph {
        self.graphs_created.fetch_add(1, atomic::Ordering::Relaxed);
        Graph::new()
    }

    pub fn graphs_created(&self) -> usize {
        self.graphs_created.load(atomic::Ordering::Relaxed)
    }
}

impl Graph {
    fn new() -> Self {
        Graph {
            id: GraphId(GRAPH_NEXT_ID.fetch_add(1, atomic::Ordering::Relaxed)),
            tensors: vec![],
            producers: vec![],
            consumers: vec![],
            ops: vec![],
            inputs: vec![],
            outputs: vec![],
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn create_tensor(&mut self, spec: TensorSpec) -> TensorId {
        let id = TensorId {
            graph: self.id,
            index: self.tensors.len().try_into().unwrap(),
        };
        match spec.role {
            TensorRole::Input => self.inputs.push(id),
            TensorRole::Output => self.outputs.push(id),
            TensorRole::Constant | TensorRole::Transient => {}
        }
        self.tensors.push(spec);
        self.producers.push(None);
        self.consumers.push(vec![]);
        id
    }

    /// Adds an operation reading `inputs` and producing `outputs`.
    ///
    /// Every tensor must belong to this graph, and each output may have only one producer.
    /// Inputs and constants cannot be produced.
    pub fn create_operation(
        &mut self,
        kind: impl Into<OpKind>,
        attrs: Attrs,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Result<OpId, GraphError> {
        for &t in inputs.iter().chain(&outputs) {
            self.check_owned(t)?;
        }
        for (i, &t) in outputs.iter().enumerate() {
            if outputs[..i].contains(&t) {
                return Err(GraphError::RepeatedOutput(t));
            }
            if let Some(p) = self.producer(t) {
                return Err(GraphError::AlreadyProduced(t, p));
            }
            if self.is_source_tensor(t) {
                return Err(GraphError::NotProducible(t));
            }
        }

        let id = OpId {
            graph: self.id,
            index: self.ops.len().try_into().unwrap(),
        };
        for &t in &outputs {
            self.producers[t.index()] = Some(id);
        }
        for &t in inputs.iter().unique() {
            self.consumers[t.index()].push(id);
        }
        self.ops.push(Operation {
            kind: kind.into(),
            attrs,
            inputs,
            outputs,
        });
        Ok(id)
    }

    /// Registers a transient `tensor` as a graph output. Tensors with any other role are left
    /// alone: a graph input passed straight through remains an input.
    pub fn promote_to_output(&mut self, tensor: TensorId) {
        let spec = &mut self.tensors[tensor.index()];
        if spec.role == TensorRole::Transient {
            spec.role = TensorRole::Output;
            self.outputs.push(tensor);
        }
    }

    fn check_owned(&self, tensor: TensorId) -> Result<(), GraphError> {
        if tensor.graph != self.id || tensor.index() >= self.tensors.len() {
            return Err(GraphError::ForeignTensor(tensor));
        }
        Ok(())
    }

    pub fn contains_tensor(&self, tensor: TensorId) -> bool {
        self.check_owned(tensor).is_ok()
    }

    /// Returns the spec of `tensor`.
    ///
    /// Panics if `tensor` was not created by this graph.
    pub fn tensor(&self, tensor: TensorId) -> &TensorSpec {
        assert_eq!(tensor.graph, self.id, "{tensor} is not from graph {}", self.id);
        &self.tensors[tensor.index()]
    }

    /// Returns the operation named by `op`.
    ///
    /// Panics if `op` was not created by this graph.
    pub fn op(&self, op: OpId) -> &Operation {
        assert_eq!(op.graph, self.id, "{op} is not from graph {}", self.id);
        &self.ops[op.index()]
    }

    pub fn producer(&self, tensor: TensorId) -> Option<OpId> {
        self.producers[tensor.index()]
    }

    pub fn consumers(&self, tensor: TensorId) -> &[OpId] {
        &self.consumers[tensor.index()]
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn tensor_ids(&self) -> impl Iterator<Item = TensorId> + '_ {
        (0..self.tensors.len()).map(move |i| TensorId {
            graph: self.id,
            index: i as u32,
        })
    }

    pub fn op_ids(&self) -> impl Iterator<Item = OpId> + '_ {
        (0..self.ops.len()).map(move |i| OpId {
            graph: self.id,
            index: i as u32,
        })
    }

    pub fn constants(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.tensor_ids().filter(|&t| self.tensor(t).is_constant())
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Counts the operations of the given kind.
    pub fn count_kind(&self, kind: &str) -> usize {
        self.ops.iter().filter(|o| o.kind.as_str() == kind).count()
    }

    /// True if `tensor` is available without any operation running: an input or a constant.
    pub fn is_source_tensor(&self, tensor: TensorId) -> bool {
        matches!(
            self.tensor(tensor).role,
            TensorRole::Input | TensorRole::Constant
        )
    }
}

impl TensorId {
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }
}

impl OpId {
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }
}

impl OpKind {
    pub fn new(kind: impl Into<String>) -> Self {
        OpKind(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OpKind {
    fn from(value: &str) -> Self {
        OpKind(value.to_owned())
    }
}

impl From<String> for OpKind {
    fn from(value: String) -> Self {
        OpKind(value)
    }
}

impl Borrow<str> for OpKind {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            AttrValue::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.t{}", self.graph, self.index)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.op{}", self.graph, self.index)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Float(x) => write!(f, "{x}"),
            AttrValue::Ints(v) => write!(f, "[{}]", v.iter().join(", ")),
            AttrValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::shape;

    fn f32_tensor(g: &mut Graph, role: TensorRole) -> TensorId {
        g.create_tensor(TensorSpec::new(shape![2, 3], Dtype::Float32, role))
    }

    #[test]
    fn test_io_registered_in_creation_order() {
        let ctx = Context::new();
        let mut g = ctx.create_graph();
        let a = f32_tensor(&mut g, TensorRole::Input);
        let y = f32_tensor(&mut g, TensorRole::Output);
        let b = f32_tensor(&mut g, TensorRole::Input);
        let _c = f32_tensor(&mut g, TensorRole::Constant);
        assert_eq!(g.inputs(), &[a, b]);
        assert_eq!(g.outputs(), &[y]);
        assert_eq!(g.constants().count(), 1);
        assert_eq!(ctx.graphs_created(), 1);
    }

    #[test]
    fn test_producers_and_consumers() {
        let mut g = Context::new().create_graph();
        let x = f32_tensor(&mut g, TensorRole::Input);
        let t = f32_tensor(&mut g, TensorRole::Transient);
        let y = f32_tensor(&mut g, TensorRole::Output);
        let relu = g.create_operation("relu", Attrs::new(), vec![x], vec![t]).unwrap();
        let add = g
            .create_operation("add", Attrs::new(), vec![t, t], vec![y])
            .unwrap();
        assert_eq!(g.producer(t), Some(relu));
        assert_eq!(g.producer(x), None);
        // Reading the same tensor twice is one consumer edge.
        assert_eq!(g.consumers(t), &[add]);
        assert_eq!(g.count_kind("add"), 1);
    }

    #[test]
    fn test_rejects_second_producer() {
        let mut g = Context::new().create_graph();
        let x = f32_tensor(&mut g, TensorRole::Input);
        let t = f32_tensor(&mut g, TensorRole::Transient);
        let first = g.create_operation("relu", Attrs::new(), vec![x], vec![t]).unwrap();
        assert_eq!(
            g.create_operation("relu", Attrs::new(), vec![x], vec![t]),
            Err(GraphError::AlreadyProduced(t, first))
        );
        assert_eq!(
            g.create_operation("relu", Attrs::new(), vec![t], vec![x]),
            Err(GraphError::NotProducible(x))
        );
    }

    #[test]
    fn test_rejects_foreign_tensors() {
        let ctx = Context::new();
        let mut g1 = ctx.create_graph();
        let mut g2 = ctx.create_graph();
        let x = f32_tensor(&mut g1, TensorRole::Input);
        let y = f32_tensor(&mut g2, TensorRole::Output);
        assert_ne!(g1.id(), g2.id());
        assert!(!g2.contains_tensor(x));
        assert_eq!(
            g2.create_operation("relu", Attrs::new(), vec![x], vec![y]),
            Err(GraphError::ForeignTensor(x))
        );
    }

    #[test]
    fn test_attr_values_parse_untagged() {
        let attrs: Attrs =
            serde_json::from_str(r#"{"axis": -1, "keep_dims": true, "perm": [1, 0], "eps": 0.5}"#)
                .unwrap();
        assert_eq!(attrs["axis"].as_int(), Some(-1));
        assert_eq!(attrs["keep_dims"].as_bool(), Some(true));
        assert_eq!(attrs["perm"].as_ints(), Some(&[1i64, 0][..]));
        assert_eq!(attrs["eps"], AttrValue::Float(0.5));
    }
}
