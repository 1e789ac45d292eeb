use std::collections::HashMap;

use crate::graph::TensorId;
use crate::permute::PermuteVector;

/// Where a source-graph tensor's value lives in the output graph, and how it is laid out there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutBinding {
    pub tensor: TensorId,
    pub pv: PermuteVector,
}

/// An append-only map from source-graph tensors to their [LayoutBinding]s.
///
/// Each source tensor is bound exactly once, when it is produced in the output graph.
#[derive(Debug, Default)]
pub struct TensorLayoutState {
    bindings: HashMap<TensorId, LayoutBinding>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutStateError {
    #[error("Tensor {0} already has a layout binding")]
    DuplicateBinding(TensorId),
    #[error("Tensor {0} has not been produced yet")]
    NotYetProduced(TensorId),
}

impl TensorLayoutState {
    pub fn new() -> Self {
        TensorLayoutState::default()
    }

    pub fn record(
        &mut self,
        source: TensorId,
        output: TensorId,
        pv: PermuteVector,
    ) -> Result<(), LayoutStateError> {
        if self.bindings.contains_key(&source) {
            return Err(LayoutStateError::DuplicateBinding(source));
        }
        self.bindings.insert(source, LayoutBinding { tensor: output, pv });
        Ok(())
    }

    pub fn lookup(&self, source: TensorId) -> Result<&LayoutBinding, LayoutStateError> {
        self.bindings
            .get(&source)
            .ok_or(LayoutStateError::NotYetProduced(source))
    }

    #[inline]
    pub fn is_produced(&self, source: TensorId) -> bool {
        self.bindings.contains_key(&source)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &LayoutBinding)> {
        self.bindings.iter()
    }
}
