use indexmap::IndexMap;

use crate::context::LayoutInferContext;
use crate::graph::{OpId, Operation, TensorId};
use crate::infer::LayoutInferError;
use crate::permute::PermuteVector;
use crate::rules::{attr_axes, remap_axes, RewriteRule};

/// A rule for operations which work in any layout, so long as their inputs agree (elementwise
/// arithmetic, activations).
///
/// The operation runs in the layout held by most of its highest-rank, non-constant inputs.
/// Inputs in any other layout are transposed into it, and outputs inherit it. A lower-rank
/// (broadcast) input is reshaped to the full rank with leading unit axes before it is
/// transposed, unless the operation runs in declared order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutAgnostic;

/// A layout-agnostic rule for operations with axis attributes, such as `softmax` and the
/// reductions.
///
/// The data input (the first) keeps its layout, and the axis attribute is re-expressed in that
/// layout's physical axis order.
#[derive(Debug, Clone)]
pub struct AxisAware {
    axis_attr: &'static str,
    keep_dims_attr: Option<&'static str>,
}

impl LayoutAgnostic {
    /// Chooses the layout `op` runs in. Returns `None` if `op` has no inputs.
    fn required_layout(
        cx: &LayoutInferContext<'_>,
        op: &Operation,
    ) -> Result<Option<PermuteVector>, LayoutInferError> {
        let src = cx.src();
        let Some(max_rank) = op.inputs.iter().map(|&t| src.tensor(t).rank()).max() else {
            return Ok(None);
        };

        // Insertion order breaks ties in favor of the earliest input.
        let mut votes: IndexMap<PermuteVector, usize> = IndexMap::new();
        for &t in &op.inputs {
            let spec = src.tensor(t);
            if spec.rank() == max_rank && !spec.is_constant() {
                *votes.entry(cx.lookup(t)?.pv.clone()).or_default() += 1;
            }
        }

        let mut best: Option<(PermuteVector, usize)> = None;
        for (pv, count) in votes {
            if best.as_ref().map_or(true, |(_, c)| count > *c) {
                best = Some((pv, count));
            }
        }
        Ok(Some(best.map_or_else(
            || PermuteVector::identity(max_rank),
            |(pv, _)| pv,
        )))
    }
}

impl RewriteRule for LayoutAgnostic {
    fn rewrite(
        &self,
        cx: &mut LayoutInferContext<'_>,
        op_id: OpId,
    ) -> Result<Vec<TensorId>, LayoutInferError> {
        let src = cx.src();
        let op = src.op(op_id);
        let required = LayoutAgnostic::required_layout(cx, op)?;

        let layout_for = |t: TensorId| -> Result<PermuteVector, LayoutInferError> {
            let rank = src.tensor(t).rank();
            match &required {
                None => Ok(PermuteVector::identity(rank)),
                Some(pv) if pv.rank() == rank => Ok(pv.clone()),
                Some(pv) if pv.is_identity() => Ok(PermuteVector::identity(rank)),
                Some(pv) => Err(LayoutInferError::IncompatibleInputLayouts {
                    op: op_id,
                    kind: op.kind.clone(),
                    detail: format!("rank-{rank} output {t} cannot follow layout {pv}"),
                }),
            }
        };

        let mut inputs = Vec::with_capacity(op.inputs.len());
        for &i in &op.inputs {
            let reconciled = match &required {
                Some(pv) if src.tensor(i).rank() < pv.rank() && !pv.is_identity() => {
                    cx.reconcile_expanded(i, pv)?
                }
                _ => cx.reconcile(i, &layout_for(i)?)?,
            };
            inputs.push(reconciled);
        }
        let output_pvs = op
            .outputs
            .iter()
            .map(|&o| layout_for(o))
            .collect::<Result<Vec<_>, _>>()?;
        cx.emit(op_id, op.attrs.clone(), inputs, output_pvs)
    }

    fn category(&self) -> &'static str {
        "layout-agnostic"
    }
}

impl AxisAware {
    pub fn new(axis_attr: &'static str) -> Self {
        AxisAware {
            axis_attr,
            keep_dims_attr: None,
        }
    }

    /// Sets the boolean attribute which, when false, drops the named axes from the output.
    /// The attribute defaults to true when absent.
    pub fn with_keep_dims(mut self, keep_dims_attr: &'static str) -> Self {
        self.keep_dims_attr = Some(keep_dims_attr);
        self
    }

    pub fn softmax() -> Self {
        AxisAware::new("axis")
    }

    pub fn reduce() -> Self {
        AxisAware::new("axes").with_keep_dims("keep_dims")
    }

    fn keeps_dims(&self, op_id: OpId, op: &Operation) -> Result<bool, LayoutInferError> {
        let Some(name) = self.keep_dims_attr else {
            return Ok(true);
        };
        match op.attrs.get(name) {
            None => Ok(true),
            Some(v) => v.as_bool().ok_or_else(|| LayoutInferError::InvalidAttribute {
                op: op_id,
                name: name.to_string(),
            }),
        }
    }
}

impl RewriteRule for AxisAware {
    fn rewrite(
        &self,
        cx: &mut LayoutInferContext<'_>,
        op_id: OpId,
    ) -> Result<Vec<TensorId>, LayoutInferError> {
        let src = cx.src();
        let op = src.op(op_id);
        let Some(&data) = op.inputs.first() else {
            return LayoutAgnostic.rewrite(cx, op_id);
        };
        let rank = src.tensor(data).rank();

        // Without the axis attribute there is nothing to re-express, so the operation runs in
        // declared order.
        let (pv, axes) = match op.attrs.get(self.axis_attr) {
            Some(value) => (
                cx.lookup(data)?.pv.clone(),
                attr_axes(op_id, self.axis_attr, value, rank)?,
            ),
            None => (PermuteVector::identity(rank), vec![]),
        };

        let mut attrs = op.attrs.clone();
        if let Some(value) = op.attrs.get(self.axis_attr) {
            attrs.insert(
                self.axis_attr.to_string(),
                remap_axes(op_id, self.axis_attr, value, &pv)?,
            );
        }

        let mut inputs = Vec::with_capacity(op.inputs.len());
        for &i in &op.inputs {
            let required = if src.tensor(i).rank() == rank {
                pv.clone()
            } else {
                PermuteVector::identity(src.tensor(i).rank())
            };
            inputs.push(cx.reconcile(i, &required)?);
        }

        let out_pv = if self.keeps_dims(op_id, op)? {
            pv
        } else {
            pv.without_axes(&axes)
        };
        let mut output_pvs = Vec::with_capacity(op.outputs.len());
        for &o in &op.outputs {
            let out_rank = src.tensor(o).rank();
            if out_rank == out_pv.rank() {
                output_pvs.push(out_pv.clone());
            } else if out_pv.is_identity() {
                output_pvs.push(PermuteVector::identity(out_rank));
            } else {
                return Err(LayoutInferError::IncompatibleInputLayouts {
                    op: op_id,
                    kind: op.kind.clone(),
                    detail: format!("rank-{out_rank} output {o} cannot follow layout {out_pv}"),
                });
            }
        }
        cx.emit(op_id, attrs, inputs, output_pvs)
    }

    fn category(&self) -> &'static str {
        "axis-aware"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Dtype, Shape};
    use crate::context::{RESHAPE, TRANSPOSE};
    use crate::graph::{AttrValue, Attrs, Context, Graph};
    use crate::infer::layout_inference;
    use crate::rules::{Registry, TransposeFold};
    use crate::tensor::{TensorRole, TensorSpec};
    use crate::{perm, shape};

    fn f32(g: &mut Graph, shape: Shape, role: TensorRole) -> TensorId {
        g.create_tensor(TensorSpec::new(shape, Dtype::Float32, role))
    }

    fn transposed(g: &mut Graph, x: TensorId, perm: Vec<i64>) -> TensorId {
        let spec = g.tensor(x).clone();
        let shape = perm.iter().map(|&p| spec.shape[p as usize]).collect();
        let t = f32(g, shape, TensorRole::Transient);
        let mut attrs = Attrs::new();
        attrs.insert("perm".to_string(), AttrValue::Ints(perm));
        g.create_operation(TRANSPOSE, attrs, vec![x], vec![t]).unwrap();
        t
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_all(&["add", "relu"], LayoutAgnostic)
            .register("softmax", AxisAware::softmax())
            .register("reduce_sum", AxisAware::reduce())
            .register(TRANSPOSE, TransposeFold);
        registry
    }

    #[test]
    fn test_inherits_folded_layout() {
        let ctx = Context::new();
        let mut src = ctx.create_graph();
        let x = f32(&mut src, shape![2, 3], TensorRole::Input);
        let t = transposed(&mut src, x, vec![1, 0]);
        let y = f32(&mut src, shape![3, 2], TensorRole::Output);
        src.create_operation("relu", Attrs::new(), vec![t], vec![y])
            .unwrap();

        let result = layout_inference(&src, &ctx, &registry()).unwrap();
        // The relu runs on the untransposed input; only the boundary is fixed up.
        assert_eq!(result.state.lookup(y).unwrap().pv, perm![1, 0]);
        assert_eq!(result.graph.count_kind(TRANSPOSE), 1);
        let relu = result.graph.op_ids().find(|&o| result.graph.op(o).kind.as_str() == "relu");
        let relu_in = result.graph.op(relu.unwrap()).inputs[0];
        assert_eq!(relu_in, result.inputs[&x]);
        assert_eq!(result.graph.tensor(result.outputs[&y]).shape, shape![3, 2]);
    }

    #[test]
    fn test_majority_layout_wins() {
        let ctx = Context::new();
        let mut src = ctx.create_graph();
        let x1 = f32(&mut src, shape![2, 3], TensorRole::Input);
        let x2 = f32(&mut src, shape![2, 3], TensorRole::Input);
        let x3 = f32(&mut src, shape![3, 2], TensorRole::Input);
        let t1 = transposed(&mut src, x1, vec![1, 0]);
        let t2 = transposed(&mut src, x2, vec![1, 0]);
        let y = f32(&mut src, shape![3, 2], TensorRole::Output);
        src.create_operation("add", Attrs::new(), vec![x3, t1, t2], vec![y])
            .unwrap();

        let result = layout_inference(&src, &ctx, &registry()).unwrap();
        assert_eq!(result.state.lookup(y).unwrap().pv, perm![1, 0]);
        // One transpose for the odd input out, one at the output boundary.
        assert_eq!(result.graph.count_kind(TRANSPOSE), 2);
    }

    #[test]
    fn test_constants_do_not_vote() {
        let ctx = Context::new();
        let mut src = ctx.create_graph();
        let x = f32(&mut src, shape![2, 3], TensorRole::Input);
        let c = f32(&mut src, shape![3, 2], TensorRole::Constant);
        let t = transposed(&mut src, x, vec![1, 0]);
        let y = f32(&mut src, shape![3, 2], TensorRole::Output);
        src.create_operation("add", Attrs::new(), vec![c, t], vec![y])
            .unwrap();

        let result = layout_inference(&src, &ctx, &registry()).unwrap();
        assert_eq!(result.state.lookup(y).unwrap().pv, perm![1, 0]);
        let add = result.graph.producer(result.state.lookup(y).unwrap().tensor);
        let add_in = result.graph.op(add.unwrap()).inputs[0];
        assert_ne!(add_in, result.state.lookup(c).unwrap().tensor);
        assert_eq!(result.graph.tensor(add_in).shape, shape![2, 3]);
    }

    #[test]
    fn test_broadcast_operand_in_declared_order() {
        let ctx = Context::new();
        let mut src = ctx.create_graph();
        let x = f32(&mut src, shape![2, 3], TensorRole::Input);
        let bias = f32(&mut src, shape![3], TensorRole::Input);
        let y = f32(&mut src, shape![2, 3], TensorRole::Output);
        src.create_operation("add", Attrs::new(), vec![x, bias], vec![y])
            .unwrap();
        let result = layout_inference(&src, &ctx, &registry()).unwrap();
        assert_eq!(result.graph.count_kind(TRANSPOSE), 0);
        assert_eq!(result.graph.count_kind(RESHAPE), 0);
    }

    #[test]
    fn test_broadcast_operand_is_expanded_into_layout() {
        let ctx = Context::new();
        let mut src = ctx.create_graph();
        let x = f32(&mut src, shape![2, 3], TensorRole::Input);
        let bias = f32(&mut src, shape![2], TensorRole::Constant);
        let t = transposed(&mut src, x, vec![1, 0]);
        let y = f32(&mut src, shape![3, 2], TensorRole::Output);
        src.create_operation("add", Attrs::new(), vec![t, bias], vec![y])
            .unwrap();

        let result = layout_inference(&src, &ctx, &registry()).unwrap();
        let g = &result.graph;
        assert_eq!(result.state.lookup(y).unwrap().pv, perm![1, 0]);
        let add = g.producer(result.state.lookup(y).unwrap().tensor).unwrap();
        let [data, broadcast] = g.op(add).inputs[..] else {
            panic!("add should keep two inputs");
        };
        assert_eq!(data, result.inputs[&x]);
        // [2] -> [1, 2] in declared order -> [2, 1] alongside the untransposed input.
        assert_eq!(g.tensor(broadcast).shape, shape![2, 1]);
        assert_eq!(g.count_kind(RESHAPE), 1);
        // One for the operand, one at the output boundary.
        assert_eq!(g.count_kind(TRANSPOSE), 2);
    }

    #[test]
    fn test_repeated_reduction_axes_are_rejected() {
        let ctx = Context::new();
        let mut src = ctx.create_graph();
        let x = f32(&mut src, shape![2, 3, 4], TensorRole::Input);
        let t = transposed(&mut src, x, vec![2, 0, 1]);
        let y = f32(&mut src, shape![3, 4], TensorRole::Output);
        let mut attrs = Attrs::new();
        attrs.insert("axes".to_string(), AttrValue::Ints(vec![0, -3]));
        attrs.insert("keep_dims".to_string(), AttrValue::Bool(false));
        src.create_operation("reduce_sum", attrs, vec![t], vec![y])
            .unwrap();

        assert!(matches!(
            layout_inference(&src, &ctx, &registry()),
            Err(LayoutInferError::InvalidAttribute { name, .. }) if name == "axes"
        ));
    }

    #[test]
    fn test_softmax_axis_follows_layout() {
        let ctx = Context::new();
        let mut src = ctx.create_graph();
        let x = f32(&mut src, shape![2, 3], TensorRole::Input);
        let t = transposed(&mut src, x, vec![1, 0]);
        let y = f32(&mut src, shape![3, 2], TensorRole::Output);
        let mut attrs = Attrs::new();
        attrs.insert("axis".to_string(), AttrValue::Int(-1));
        src.create_operation("softmax", attrs, vec![t], vec![y])
            .unwrap();

        let result = layout_inference(&src, &ctx, &registry()).unwrap();
        let softmax = result
            .graph
            .producer(result.state.lookup(y).unwrap().tensor)
            .unwrap();
        // Logical axis 1 of `t` is physical axis 0.
        assert_eq!(result.graph.op(softmax).attrs["axis"], AttrValue::Int(0));
    }

    #[test]
    fn test_reduction_without_keep_dims_drops_axes() {
        let ctx = Context::new();
        let mut src = ctx.create_graph();
        let x = f32(&mut src, shape![2, 3, 4], TensorRole::Input);
        let t = transposed(&mut src, x, vec![2, 0, 1]);
        let y = f32(&mut src, shape![2, 3], TensorRole::Output);
        let mut attrs = Attrs::new();
        attrs.insert("axes".to_string(), AttrValue::Ints(vec![0]));
        attrs.insert("keep_dims".to_string(), AttrValue::Bool(false));
        src.create_operation("reduce_sum", attrs, vec![t], vec![y])
            .unwrap();

        let result = layout_inference(&src, &ctx, &registry()).unwrap();
        assert_eq!(result.state.lookup(y).unwrap().pv, perm![0, 1]);
        assert_eq!(result.graph.count_kind(TRANSPOSE), 0);
        let reduce = result.graph.producer(result.outputs[&y]).unwrap();
        assert_eq!(
            result.graph.op(reduce).attrs["axes"],
            AttrValue::Ints(vec![2])
        );
    }
}
