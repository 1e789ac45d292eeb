use crate::context::LayoutInferContext;
use crate::graph::{OpId, TensorId};
use crate::infer::LayoutInferError;
use crate::permute::PermuteVector;
use crate::rules::{remap_axes, RewriteRule};

/// A rule for operations whose semantics depend on a particular axis order: reshapes, padding,
/// concatenation along an axis.
///
/// Inputs are reconciled to a canonical layout (the declared order, unless set with
/// [ShapeMutating::with_canonical]). Axis attributes are re-expressed in the canonical layout's
/// physical order: those named with [ShapeMutating::with_axis_attr] index the first input, and
/// those named with [ShapeMutating::with_output_axis_attr] index the first output (as `stack`'s
/// does). Outputs of the canonical rank are produced in the canonical layout, all others in
/// declared order.
#[derive(Debug, Clone, Default)]
pub struct ShapeMutating {
    canonical: Option<PermuteVector>,
    axis_attrs: Vec<(&'static str, Indexes)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Indexes {
    Input,
    Output,
}

impl ShapeMutating {
    pub fn new() -> Self {
        ShapeMutating::default()
    }

    pub fn with_canonical(mut self, canonical: PermuteVector) -> Self {
        self.canonical = Some(canonical);
        self
    }

    pub fn with_axis_attr(mut self, name: &'static str) -> Self {
        self.axis_attrs.push((name, Indexes::Input));
        self
    }

    pub fn with_output_axis_attr(mut self, name: &'static str) -> Self {
        self.axis_attrs.push((name, Indexes::Output));
        self
    }

    fn layout_for_rank(&self, rank: usize) -> PermuteVector {
        match &self.canonical {
            Some(pv) if pv.rank() == rank => pv.clone(),
            _ => PermuteVector::identity(rank),
        }
    }
}

impl RewriteRule for ShapeMutating {
    fn rewrite(
        &self,
        cx: &mut LayoutInferContext<'_>,
        op_id: OpId,
    ) -> Result<Vec<TensorId>, LayoutInferError> {
        let src = cx.src();
        let op = src.op(op_id);

        let mut attrs = op.attrs.clone();
        for &(name, indexes) in &self.axis_attrs {
            let Some(value) = op.attrs.get(name) else {
                continue;
            };
            let indexed = match indexes {
                Indexes::Input => op.inputs.first(),
                Indexes::Output => op.outputs.first(),
            };
            let Some(&t) = indexed else {
                continue;
            };
            let pv = self.layout_for_rank(src.tensor(t).rank());
            attrs.insert(name.to_string(), remap_axes(op_id, name, value, &pv)?);
        }

        let mut inputs = Vec::with_capacity(op.inputs.len());
        for &i in &op.inputs {
            let required = self.layout_for_rank(src.tensor(i).rank());
            inputs.push(cx.reconcile(i, &required)?);
        }
        let output_pvs = op
            .outputs
            .iter()
            .map(|&o| self.layout_for_rank(src.tensor(o).rank()))
            .collect();
        cx.emit(op_id, attrs, inputs, output_pvs)
    }

    fn category(&self) -> &'static str {
        "shape-mutating"
    }
}
