//! Per-operation-kind rewrite rules.
//!
//! A [RewriteRule] lowers one source-graph operation into the output graph. It reads the layout
//! of each input from the [LayoutInferContext], decides which layout the operation needs,
//! reconciles inputs (inserting Transposes as required), emits the rewritten operation, and
//! binds every output. Rules are collected in a [Registry] keyed by [OpKind].

mod agnostic;
mod fixed;
mod reshaping;
mod transpose;

pub use agnostic::{AxisAware, LayoutAgnostic};
pub use fixed::{Canonical, LayoutFixed};
pub use reshaping::ShapeMutating;
pub use transpose::TransposeFold;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::LayoutInferContext;
use crate::graph::{AttrValue, OpId, OpKind, TensorId};
use crate::infer::LayoutInferError;
use crate::permute::PermuteVector;

pub trait RewriteRule: Send + Sync {
    /// Rewrites source operation `op`, returning the output-graph tensors it produced.
    ///
    /// On success, every output of `op` must have been recorded in the context.
    fn rewrite(
        &self,
        cx: &mut LayoutInferContext<'_>,
        op: OpId,
    ) -> Result<Vec<TensorId>, LayoutInferError>;

    /// A short name for the rule's behavior, for listings.
    fn category(&self) -> &'static str {
        "custom"
    }
}

/// Implements [RewriteRule] for plain functions and closures.
impl<F> RewriteRule for F
where
    F: Fn(&mut LayoutInferContext<'_>, OpId) -> Result<Vec<TensorId>, LayoutInferError>
        + Send
        + Sync,
{
    fn rewrite(
        &self,
        cx: &mut LayoutInferContext<'_>,
        op: OpId,
    ) -> Result<Vec<TensorId>, LayoutInferError> {
        self(cx, op)
    }
}

/// Maps operation kinds to their [RewriteRule]s.
///
/// A registry is built once and passed by reference into each pass; tests can build one holding
/// only the rules they exercise.
#[derive(Default, Clone)]
pub struct Registry {
    rules: BTreeMap<OpKind, Arc<dyn RewriteRule>>,
    fallback: Option<Arc<dyn RewriteRule>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register<R>(&mut self, kind: impl Into<OpKind>, rule: R) -> &mut Self
    where
        R: RewriteRule + 'static,
    {
        self.rules.insert(kind.into(), Arc::new(rule));
        self
    }

    /// Registers one rule for several kinds.
    pub fn register_all<R>(&mut self, kinds: &[&str], rule: R) -> &mut Self
    where
        R: RewriteRule + 'static,
    {
        let rule: Arc<dyn RewriteRule> = Arc::new(rule);
        for &kind in kinds {
            self.rules.insert(OpKind::from(kind), Arc::clone(&rule));
        }
        self
    }

    /// Sets a rule to use for operations whose kind has no rule of its own.
    pub fn with_fallback<R>(mut self, rule: R) -> Self
    where
        R: RewriteRule + 'static,
    {
        self.fallback = Some(Arc::new(rule));
        self
    }

    pub fn rule(&self, kind: &OpKind) -> Option<&dyn RewriteRule> {
        self.rules.get(kind).map(|r| r.as_ref())
    }

    pub fn fallback(&self) -> Option<&dyn RewriteRule> {
        self.fallback.as_deref()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.rules.contains_key(kind)
    }

    /// Lists registered kinds, in sorted order, with each rule's category.
    pub fn kinds(&self) -> impl Iterator<Item = (&OpKind, &'static str)> + '_ {
        self.rules.iter().map(|(k, r)| (k, r.category()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The rules for the operator library's built-in kinds.
    pub fn builtin() -> Self {
        let mut registry = Registry::new();
        registry
            .register_all(
                &["conv2d", "deconv2d", "pool2d", "fully_connected"],
                LayoutFixed::from_attr("layout"),
            )
            .register_all(
                &[
                    "add",
                    "sub",
                    "mul",
                    "div",
                    "maximum",
                    "minimum",
                    "pow",
                    "relu",
                    "relu6",
                    "leaky_relu",
                    "sigmoid",
                    "tanh",
                    "abs",
                    "neg",
                    "exp",
                    "log",
                    "sqrt",
                    "rsqrt",
                    "square",
                    "data_convert",
                    "select",
                ],
                LayoutAgnostic,
            )
            .register("softmax", AxisAware::softmax())
            .register_all(
                &["reduce_sum", "reduce_mean", "reduce_max", "reduce_min"],
                AxisAware::reduce(),
            )
            .register_all(&["reshape", "squeeze", "pad"], ShapeMutating::new())
            .register_all(
                &["concat", "gather"],
                ShapeMutating::new().with_axis_attr("axis"),
            )
            .register("stack", ShapeMutating::new().with_output_axis_attr("axis"))
            .register("transpose", TransposeFold);
        registry
    }
}

/// Resolves a possibly-negative axis attribute against `rank`.
pub(crate) fn normalize_axis(
    op: OpId,
    name: &str,
    axis: i64,
    rank: usize,
) -> Result<u8, LayoutInferError> {
    let rank = rank as i64;
    let normalized = if axis < 0 { axis + rank } else { axis };
    if !(0..rank).contains(&normalized) {
        return Err(LayoutInferError::InvalidAttribute {
            op,
            name: name.to_string(),
        });
    }
    Ok(normalized as u8)
}

/// Reads an axis-list attribute, accepting either a single integer or a list. Axes may be
/// negative but must be distinct.
pub(crate) fn attr_axes(
    op: OpId,
    name: &str,
    value: &AttrValue,
    rank: usize,
) -> Result<Vec<u8>, LayoutInferError> {
    let raw: &[i64] = match value {
        AttrValue::Int(i) => std::slice::from_ref(i),
        AttrValue::Ints(v) => v,
        _ => {
            return Err(LayoutInferError::InvalidAttribute {
                op,
                name: name.to_string(),
            })
        }
    };
    let mut axes = Vec::with_capacity(raw.len());
    for &a in raw {
        let axis = normalize_axis(op, name, a, rank)?;
        if axes.contains(&axis) {
            return Err(LayoutInferError::InvalidAttribute {
                op,
                name: name.to_string(),
            });
        }
        axes.push(axis);
    }
    Ok(axes)
}

/// Re-expresses the logical axes in `value` as the physical axes of a tensor laid out by `pv`,
/// keeping the attribute's form (single integer or list).
pub(crate) fn remap_axes(
    op: OpId,
    name: &str,
    value: &AttrValue,
    pv: &PermuteVector,
) -> Result<AttrValue, LayoutInferError> {
    let physical = attr_axes(op, name, value, pv.rank())?
        .into_iter()
        .map(|a| pv.map_axis(a).map(i64::from))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| LayoutInferError::InvalidAttribute {
            op,
            name: name.to_string(),
        })?;
    Ok(match value {
        AttrValue::Int(_) => AttrValue::Int(physical[0]),
        _ => AttrValue::Ints(physical),
    })
}
