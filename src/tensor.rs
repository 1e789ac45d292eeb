use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::common::{Dtype, Shape};
use crate::permute::{PermuteError, PermuteVector, MAX_RANK};

/// Declares a tensor: its logical shape, element type, how it is produced, and any
/// quantization metadata.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct TensorSpec {
    pub shape: Shape,
    pub dtype: Dtype,
    #[serde(default)]
    pub role: TensorRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<Quantization>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum TensorRole {
    /// Fed by the caller. Registered as a graph input.
    Input,
    /// Read by the caller. Registered as a graph output.
    Output,
    /// Holds data known before execution.
    Constant,
    /// Produced and consumed within the graph.
    #[default]
    Transient,
}

/// Quantization parameters. Only the channel dimension of per-channel quantization is ever
/// interpreted: it names a logical axis and so must follow the tensor through transposes.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Quantization {
    PerTensor {
        scale: f32,
        zero_point: i32,
    },
    PerChannel {
        channel_dim: u8,
        scales: Vec<f32>,
        zero_points: Vec<i32>,
    },
}

impl TensorSpec {
    pub fn new(shape: Shape, dtype: Dtype, role: TensorRole) -> Self {
        TensorSpec {
            shape,
            dtype,
            role,
            quantization: None,
        }
    }

    pub fn with_quantization(mut self, quantization: Quantization) -> Self {
        self.quantization = Some(quantization);
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Checks that the rank can be permuted and that a per-channel axis names one of the
    /// tensor's axes.
    pub fn check(&self) -> Result<(), PermuteError> {
        if self.rank() > MAX_RANK {
            return Err(PermuteError::RankTooLarge(self.rank()));
        }
        if let Some(Quantization::PerChannel { channel_dim, .. }) = &self.quantization {
            if usize::from(*channel_dim) >= self.rank() {
                return Err(PermuteError::AxisOutOfRange {
                    axis: *channel_dim,
                    rank: self.rank(),
                });
            }
        }
        Ok(())
    }

    pub fn is_constant(&self) -> bool {
        self.role == TensorRole::Constant
    }

    pub fn as_transient(&self) -> TensorSpec {
        TensorSpec {
            role: TensorRole::Transient,
            ..self.clone()
        }
    }

    /// Returns the spec of this (logically-ordered) tensor when physically laid out by `pv`.
    ///
    /// The shape is permuted and the quantization channel dimension, if any, follows its logical
    /// axis to its new physical position. The role is kept.
    pub fn permuted(&self, pv: &PermuteVector) -> Result<TensorSpec, PermuteError> {
        let shape = pv.apply(&self.shape)?;
        let quantization = match &self.quantization {
            Some(Quantization::PerChannel {
                channel_dim,
                scales,
                zero_points,
            }) => Some(Quantization::PerChannel {
                channel_dim: pv.map_axis(*channel_dim).ok_or(PermuteError::AxisOutOfRange {
                    axis: *channel_dim,
                    rank: self.rank(),
                })?,
                scales: scales.clone(),
                zero_points: zero_points.clone(),
            }),
            q => q.clone(),
        };
        Ok(TensorSpec {
            shape,
            dtype: self.dtype,
            role: self.role,
            quantization,
        })
    }

    /// Returns this spec with unit axes prepended up to `rank`, as when broadcasting against a
    /// tensor of that rank. A per-channel axis shifts along with the existing axes.
    pub fn expanded(&self, rank: usize) -> Result<TensorSpec, PermuteError> {
        if rank < self.rank() {
            return Err(PermuteError::RankMismatch(rank, self.rank()));
        }
        if rank > MAX_RANK {
            return Err(PermuteError::RankTooLarge(rank));
        }
        let added = rank - self.rank();
        let mut shape: Shape = smallvec::smallvec![1; added];
        shape.extend_from_slice(&self.shape);
        let quantization = match &self.quantization {
            Some(Quantization::PerChannel {
                channel_dim,
                scales,
                zero_points,
            }) => Some(Quantization::PerChannel {
                channel_dim: channel_dim.saturating_add(added as u8),
                scales: scales.clone(),
                zero_points: zero_points.clone(),
            }),
            q => q.clone(),
        };
        Ok(TensorSpec {
            shape,
            dtype: self.dtype,
            role: self.role,
            quantization,
        })
    }
}

impl Display for TensorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.shape.iter().join("×"), self.dtype)?;
        match self.role {
            TensorRole::Transient => Ok(()),
            role => write!(f, " {}", role),
        }
    }
}

impl Display for TensorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TensorRole::Input => write!(f, "in"),
            TensorRole::Output => write!(f, "out"),
            TensorRole::Constant => write!(f, "const"),
            TensorRole::Transient => write!(f, "tmp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{perm, shape};

    #[test]
    fn test_permuted_moves_shape_and_channel_dim() {
        let spec = TensorSpec::new(shape![8, 3, 5, 5], Dtype::Int8, TensorRole::Constant)
            .with_quantization(Quantization::PerChannel {
                channel_dim: 0,
                scales: vec![0.5; 8],
                zero_points: vec![0; 8],
            });
        let permuted = spec.permuted(&perm![1, 2, 3, 0]).unwrap();
        assert_eq!(permuted.shape, shape![3, 5, 5, 8]);
        assert!(matches!(
            permuted.quantization,
            Some(Quantization::PerChannel { channel_dim: 3, .. })
        ));
        assert_eq!(permuted.role, TensorRole::Constant);
    }

    #[test]
    fn test_permuted_keeps_per_tensor_quantization() {
        let q = Quantization::PerTensor {
            scale: 0.25,
            zero_point: 3,
        };
        let spec = TensorSpec::new(shape![2, 4], Dtype::Uint8, TensorRole::Transient)
            .with_quantization(q.clone());
        assert_eq!(spec.permuted(&perm![1, 0]).unwrap().quantization, Some(q));
    }

    #[test]
    fn test_permuted_rejects_rank_mismatch() {
        let spec = TensorSpec::new(shape![2, 4], Dtype::Float32, TensorRole::Input);
        assert!(spec.permuted(&perm![0, 2, 1]).is_err());
    }

    #[test]
    fn test_channel_dim_out_of_range() {
        let spec = TensorSpec::new(shape![2, 4], Dtype::Int8, TensorRole::Input).with_quantization(
            Quantization::PerChannel {
                channel_dim: 2,
                scales: vec![1.0; 4],
                zero_points: vec![0; 4],
            },
        );
        let err = PermuteError::AxisOutOfRange { axis: 2, rank: 2 };
        assert_eq!(spec.check(), Err(err.clone()));
        assert_eq!(spec.permuted(&perm![1, 0]), Err(err));
    }

    #[test]
    fn test_check_rejects_wide_ranks() {
        let spec = TensorSpec::new(shape![1; MAX_RANK + 1], Dtype::Bool, TensorRole::Input);
        assert_eq!(spec.check(), Err(PermuteError::RankTooLarge(MAX_RANK + 1)));
        let spec = TensorSpec::new(shape![1; MAX_RANK], Dtype::Bool, TensorRole::Input);
        assert_eq!(spec.check(), Ok(()));
    }

    #[test]
    fn test_expanded_prepends_unit_axes() {
        let spec = TensorSpec::new(shape![4], Dtype::Int8, TensorRole::Constant).with_quantization(
            Quantization::PerChannel {
                channel_dim: 0,
                scales: vec![1.0; 4],
                zero_points: vec![0; 4],
            },
        );
        let expanded = spec.expanded(3).unwrap();
        assert_eq!(expanded.shape, shape![1, 1, 4]);
        assert!(matches!(
            expanded.quantization,
            Some(Quantization::PerChannel { channel_dim: 2, .. })
        ));
        assert!(spec.expanded(0).is_err());
    }

    #[test]
    fn test_role_defaults_to_transient_in_json() {
        let spec: TensorSpec =
            serde_json::from_str(r#"{"shape": [1, 2], "dtype": "float32"}"#).unwrap();
        assert_eq!(spec.role, TensorRole::Transient);
        assert_eq!(spec.to_string(), "(1×2, f32)");
    }
}
