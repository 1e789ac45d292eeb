use crate::context::LayoutInferContext;
use crate::graph::{OpId, TensorId};
use crate::infer::LayoutInferError;
use crate::permute::PermuteVector;
use crate::rules::RewriteRule;

/// Folds a source-graph transpose into layout bookkeeping.
///
/// No operation is emitted. The output is bound to the input's output-graph tensor, with a
/// permute vector composed from the input's and the inverse of the transpose's `perm` (the
/// reversed axis order when `perm` is absent). A later consumer which needs another layout
/// materializes it with a single Transpose.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransposeFold;

impl RewriteRule for TransposeFold {
    fn rewrite(
        &self,
        cx: &mut LayoutInferContext<'_>,
        op_id: OpId,
    ) -> Result<Vec<TensorId>, LayoutInferError> {
        let src = cx.src();
        let op = src.op(op_id);
        let (&[input], &[output]) = (op.inputs.as_slice(), op.outputs.as_slice()) else {
            return Err(LayoutInferError::IncompatibleInputLayouts {
                op: op_id,
                kind: op.kind.clone(),
                detail: format!(
                    "expected one input and one output, got {} and {}",
                    op.inputs.len(),
                    op.outputs.len()
                ),
            });
        };

        let in_spec = src.tensor(input);
        let invalid_perm = || LayoutInferError::InvalidAttribute {
            op: op_id,
            name: "perm".to_string(),
        };
        let perm = match op.attrs.get("perm") {
            Some(value) => PermuteVector::from_i64s(value.as_ints().ok_or_else(invalid_perm)?)?,
            None => PermuteVector::new((0..in_spec.rank() as u8).rev())?,
        };
        if perm.apply(&in_spec.shape).ok().as_ref() != Some(&src.tensor(output).shape) {
            return Err(invalid_perm());
        }

        let binding = cx.lookup(input)?.clone();
        let pv = perm.invert().compose(&binding.pv)?;
        cx.record(output, binding.tensor, pv)?;
        Ok(vec![binding.tensor])
    }

    fn category(&self) -> &'static str {
        "fold"
    }
}
