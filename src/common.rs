use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub type DimSize = u32;
pub type Shape = smallvec::SmallVec<[DimSize; 5]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Bool,
    Int8,
    Uint8,
    Int16,
    Int32,
    Float16,
    Float32,
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Bool => write!(f, "bool"),
            Dtype::Int8 => write!(f, "i8"),
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Int16 => write!(f, "i16"),
            Dtype::Int32 => write!(f, "i32"),
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Float32 => write!(f, "f32"),
        }
    }
}

pub mod macros {
    #[macro_export]
    macro_rules! shape {
        ($dim:expr; $n:expr) => {{
            // Bind to a variable with an explicit type to help out type inference.
            let sv: $crate::common::Shape = $crate::smallvec::smallvec![ $dim; $n ];
            sv
        }};
        ($($dim:expr),*$(,)*) => {{
            // Bind to a variable with an explicit type to help out type inference.
            let sv: $crate::common::Shape = $crate::smallvec::smallvec![ $( $dim ),* ];
            sv
        }};
    }
}
