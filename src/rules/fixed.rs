use crate::context::LayoutInferContext;
use crate::graph::{OpId, TensorId};
use crate::infer::LayoutInferError;
use crate::permute::PermuteVector;
use crate::rules::RewriteRule;

/// Where a [LayoutFixed] rule finds the layout its operation requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Canonical {
    /// Every input in its declared axis order.
    Identity,
    Static(PermuteVector),
    /// Read from an integer-list attribute of the operation; the identity if absent.
    Attr(&'static str),
}

/// A rule for operations which require one fixed input layout (convolutions, pooling).
///
/// Inputs whose rank matches the canonical permutation are reconciled to it. Other inputs
/// (e.g., a bias vector) are reconciled to their declared order. Outputs are produced in their
/// declared order.
#[derive(Debug, Clone)]
pub struct LayoutFixed {
    canonical: Canonical,
}

impl LayoutFixed {
    pub fn new(canonical: PermuteVector) -> Self {
        LayoutFixed {
            canonical: Canonical::Static(canonical),
        }
    }

    pub fn from_attr(name: &'static str) -> Self {
        LayoutFixed {
            canonical: Canonical::Attr(name),
        }
    }

    /// Requires every tensor in its declared order.
    pub fn identity() -> Self {
        LayoutFixed {
            canonical: Canonical::Identity,
        }
    }

    pub fn canonical(&self) -> &Canonical {
        &self.canonical
    }

    fn resolve(
        &self,
        cx: &LayoutInferContext<'_>,
        op: OpId,
    ) -> Result<Option<PermuteVector>, LayoutInferError> {
        match &self.canonical {
            Canonical::Identity => Ok(None),
            Canonical::Static(pv) => Ok(Some(pv.clone())),
            Canonical::Attr(name) => match cx.src().op(op).attrs.get(*name) {
                None => Ok(None),
                Some(value) => {
                    let raw = value
                        .as_ints()
                        .ok_or_else(|| LayoutInferError::InvalidAttribute {
                            op,
                            name: name.to_string(),
                        })?;
                    Ok(Some(PermuteVector::from_i64s(raw)?))
                }
            },
        }
    }
}

impl RewriteRule for LayoutFixed {
    fn rewrite(
        &self,
        cx: &mut LayoutInferContext<'_>,
        op_id: OpId,
    ) -> Result<Vec<TensorId>, LayoutInferError> {
        let src = cx.src();
        let op = src.op(op_id);
        let canonical = self.resolve(cx, op_id)?;

        let mut inputs = Vec::with_capacity(op.inputs.len());
        for &i in &op.inputs {
            let rank = src.tensor(i).rank();
            let required = match &canonical {
                Some(pv) if pv.rank() == rank => pv.clone(),
                _ => PermuteVector::identity(rank),
            };
            inputs.push(cx.reconcile(i, &required)?);
        }

        let output_pvs = op
            .outputs
            .iter()
            .map(|&o| PermuteVector::identity(src.tensor(o).rank()))
            .collect();
        cx.emit(op_id, op.attrs.clone(), inputs, output_pvs)
    }

    fn category(&self) -> &'static str {
        "layout-fixed"
    }
}
