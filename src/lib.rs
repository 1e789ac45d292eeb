pub mod common;
pub mod context;
pub mod desc;
pub mod graph;
pub mod infer;
pub mod permute;
pub mod pprint;
pub mod rules;
pub mod state;
pub mod tensor;

pub use infer::{layout_inference, LayoutInferError, LayoutInference};

// Exported for the `shape!` macro.
pub use smallvec;
