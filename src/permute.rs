use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

use crate::common::Shape;

/// An axis permutation of a tensor of known rank.
///
/// `pv[i] = j` means physical axis `i` of a tensor, as currently laid out, holds logical axis `j`
/// of that tensor's declared axis order. The identity vector `[0, 1, ..., R-1]` means no
/// repermutation has occurred.
///
/// Values are immutable: every operation returns a fresh [PermuteVector].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct PermuteVector(SmallVec<[u8; 6]>);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PermuteError {
    #[error("Cannot combine permute vectors of rank {0} and {1}")]
    RankMismatch(usize, usize),
    #[error("{0:?} is not a permutation")]
    NotAPermutation(Vec<u8>),
    #[error("Axis {axis} is out of range for rank {rank}")]
    AxisOutOfRange { axis: u8, rank: usize },
    #[error("Rank {0} exceeds the maximum of {MAX_RANK}")]
    RankTooLarge(usize),
}

/// The highest rank a [PermuteVector] can describe.
pub const MAX_RANK: usize = u8::MAX as usize;

impl PermuteVector {
    pub fn identity(rank: usize) -> PermuteVector {
        assert!(rank <= MAX_RANK, "rank {rank} exceeds {MAX_RANK}");
        PermuteVector((0..rank).map(|i| i as u8).collect())
    }

    /// Builds a [PermuteVector] from raw axis indices, checking that they are a bijection on
    /// `0..axes.len()`.
    pub fn new<I>(axes: I) -> Result<PermuteVector, PermuteError>
    where
        I: IntoIterator<Item = u8>,
    {
        let axes: SmallVec<[u8; 6]> = axes.into_iter().collect();
        let mut seen: SmallVec<[bool; 6]> = smallvec::smallvec![false; axes.len()];
        for &a in &axes {
            match seen.get_mut(usize::from(a)) {
                Some(slot) if !*slot => *slot = true,
                _ => return Err(PermuteError::NotAPermutation(axes.to_vec())),
            }
        }
        Ok(PermuteVector(axes))
    }

    /// Like [PermuteVector::new], but from signed values as they appear in operation attributes.
    pub fn from_i64s(axes: &[i64]) -> Result<PermuteVector, PermuteError> {
        let narrowed = axes
            .iter()
            .map(|&a| u8::try_from(a))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| {
                PermuteError::NotAPermutation(axes.iter().map(|&a| a as u8).collect())
            })?;
        PermuteVector::new(narrowed)
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_i64s(&self) -> Vec<i64> {
        self.0.iter().map(|&a| i64::from(a)).collect()
    }

    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(i, &a)| usize::from(a) == i)
    }

    /// Apply `inner`, then `self`: `result[i] = self[inner[i]]`.
    pub fn compose(&self, inner: &PermuteVector) -> Result<PermuteVector, PermuteError> {
        if self.rank() != inner.rank() {
            return Err(PermuteError::RankMismatch(self.rank(), inner.rank()));
        }
        Ok(PermuteVector(
            inner.0.iter().map(|&i| self.0[usize::from(i)]).collect(),
        ))
    }

    pub fn invert(&self) -> PermuteVector {
        let mut inverted: SmallVec<[u8; 6]> = smallvec::smallvec![0; self.rank()];
        for (i, &a) in self.0.iter().enumerate() {
            inverted[usize::from(a)] = i as u8;
        }
        PermuteVector(inverted)
    }

    /// Returns the physical position holding logical axis `axis`, if it is in range.
    pub fn map_axis(&self, axis: u8) -> Option<u8> {
        self.0.iter().position(|&a| a == axis).map(|p| p as u8)
    }

    /// Returns the physical shape of a tensor with logical shape `shape` laid out by `self`.
    pub fn apply(&self, shape: &[u32]) -> Result<Shape, PermuteError> {
        if self.rank() != shape.len() {
            return Err(PermuteError::RankMismatch(self.rank(), shape.len()));
        }
        Ok(self.0.iter().map(|&a| shape[usize::from(a)]).collect())
    }

    /// Drops the logical axes in `axes`, renumbering the survivors in order.
    ///
    /// This is the layout of a tensor after the dimensions in `axes` are removed (e.g., by a
    /// reduction which does not keep dimensions). Out-of-range and repeated entries of `axes`
    /// are ignored.
    pub fn without_axes(&self, axes: &[u8]) -> PermuteVector {
        PermuteVector(
            self.0
                .iter()
                .filter(|a| !axes.contains(a))
                .map(|&a| a - axes.iter().unique().filter(|&&d| d < a).count() as u8)
                .collect(),
        )
    }
}

impl TryFrom<Vec<u8>> for PermuteVector {
    type Error = PermuteError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        PermuteVector::new(value)
    }
}

impl From<PermuteVector> for Vec<u8> {
    fn from(value: PermuteVector) -> Self {
        value.0.to_vec()
    }
}

impl fmt::Display for PermuteVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.iter().join(", "))
    }
}

#[cfg(test)]
impl proptest::arbitrary::Arbitrary for PermuteVector {
    type Parameters = Option<std::ops::RangeInclusive<usize>>;
    type Strategy = proptest::strategy::BoxedStrategy<PermuteVector>;

    fn arbitrary_with(args: Self::Parameters) -> Self::Strategy {
        use proptest::prelude::*;

        args.unwrap_or(0..=6).prop_flat_map(arb_permute_vector).boxed()
    }
}

#[cfg(test)]
pub fn arb_permute_vector(rank: usize) -> impl proptest::strategy::Strategy<Value = PermuteVector> {
    use proptest::prelude::*;

    Just((0..rank as u8).collect::<Vec<_>>())
        .prop_shuffle()
        .prop_map(|v| PermuteVector::new(v).unwrap())
}

pub mod macros {
    #[macro_export]
    macro_rules! perm {
        ($($axis:expr),*$(,)*) => {
            $crate::permute::PermuteVector::new([ $( $axis as u8 ),* ])
                .expect("perm! requires a permutation")
        };
    }
}
