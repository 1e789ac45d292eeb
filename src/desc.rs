//! JSON descriptions of graphs, with tensors referred to by name.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::context::PassStats;
use crate::graph::{Attrs, Context, Graph, GraphError, OpKind, TensorId};
use crate::infer::LayoutInference;
use crate::permute::PermuteError;
use crate::tensor::TensorSpec;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GraphDesc {
    /// Tensors by name. Inputs and outputs are registered in this order.
    pub tensors: IndexMap<String, TensorSpec>,
    #[serde(default)]
    pub ops: Vec<OpDesc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OpDesc {
    pub kind: OpKind,
    #[serde(default, skip_serializing_if = "Attrs::is_empty")]
    pub attrs: Attrs,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// A pass result, named after the source graph's tensors.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InferenceDesc {
    pub graph: GraphDesc,
    /// Source tensor names to the names of their counterparts in `graph`.
    pub inputs: IndexMap<String, String>,
    pub outputs: IndexMap<String, String>,
    pub stats: PassStats,
}

#[derive(thiserror::Error, Debug)]
pub enum DescError {
    #[error("Could not read graph description: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid graph description: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Operation {op} ({kind}) refers to unknown tensor {name:?}")]
    UnknownTensor {
        op: usize,
        kind: OpKind,
        name: String,
    },
    #[error("Tensor name {0:?} is used twice")]
    DuplicateName(String),
    #[error("Tensor {name:?} is invalid: {source}")]
    InvalidTensor {
        name: String,
        #[source]
        source: PermuteError,
    },
    #[error("Operation {op} ({kind}) is invalid: {source}")]
    Graph {
        op: usize,
        kind: OpKind,
        #[source]
        source: GraphError,
    },
}

impl GraphDesc {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DescError> {
        let text = fs::read_to_string(path)?;
        GraphDesc::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, DescError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Builds a [Graph], returning it with the handle of each named tensor.
    pub fn build(&self, ctx: &Context) -> Result<(Graph, IndexMap<String, TensorId>), DescError> {
        for (name, spec) in &self.tensors {
            spec.check().map_err(|source| DescError::InvalidTensor {
                name: name.clone(),
                source,
            })?;
        }
        let mut graph = ctx.create_graph();
        let names: IndexMap<String, TensorId> = self
            .tensors
            .iter()
            .map(|(name, spec)| (name.clone(), graph.create_tensor(spec.clone())))
            .collect();

        for (i, op) in self.ops.iter().enumerate() {
            let resolve = |list: &[String]| {
                list.iter()
                    .map(|name| {
                        names
                            .get(name)
                            .copied()
                            .ok_or_else(|| DescError::UnknownTensor {
                                op: i,
                                kind: op.kind.clone(),
                                name: name.clone(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()
            };
            let inputs = resolve(op.inputs.as_slice())?;
            let outputs = resolve(op.outputs.as_slice())?;
            graph
                .create_operation(op.kind.clone(), op.attrs.clone(), inputs, outputs)
                .map_err(|source| DescError::Graph {
                    op: i,
                    kind: op.kind.clone(),
                    source,
                })?;
        }
        Ok((graph, names))
    }

    /// Describes `graph`. Tensors named in `names` keep their (first) name; the rest are named
    /// `%` followed by their index.
    pub fn from_graph(
        graph: &Graph,
        names: &IndexMap<String, TensorId>,
    ) -> Result<Self, DescError> {
        let labels = tensor_labels(graph, names)?;
        let tensors = graph
            .tensor_ids()
            .map(|t| (labels[t.index()].clone(), graph.tensor(t).clone()))
            .collect();
        let label_all = |ts: &[TensorId]| -> Vec<String> {
            ts.iter().map(|t| labels[t.index()].clone()).collect()
        };
        let ops = graph
            .op_ids()
            .map(|o| {
                let op = graph.op(o);
                OpDesc {
                    kind: op.kind.clone(),
                    attrs: op.attrs.clone(),
                    inputs: label_all(op.inputs.as_slice()),
                    outputs: label_all(op.outputs.as_slice()),
                }
            })
            .collect();
        Ok(GraphDesc { tensors, ops })
    }

    pub fn to_json_pretty(&self) -> Result<String, DescError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl InferenceDesc {
    /// Describes `result`, naming its boundary tensors after their sources in `src_names`.
    pub fn new(
        result: &LayoutInference,
        src_names: &IndexMap<String, TensorId>,
    ) -> Result<Self, DescError> {
        let io = result.io_map();
        let out_names: IndexMap<String, TensorId> = src_names
            .iter()
            .filter_map(|(name, s)| io.get(s).map(|&o| (name.clone(), o)))
            .collect();
        let labels = tensor_labels(&result.graph, &out_names)?;
        let rename = |map: &IndexMap<TensorId, TensorId>| -> IndexMap<String, String> {
            src_names
                .iter()
                .filter_map(|(name, s)| {
                    map.get(s)
                        .map(|o| (name.clone(), labels[o.index()].clone()))
                })
                .collect()
        };
        Ok(InferenceDesc {
            graph: GraphDesc::from_graph(&result.graph, &out_names)?,
            inputs: rename(&result.inputs),
            outputs: rename(&result.outputs),
            stats: result.stats,
        })
    }

    pub fn to_json_pretty(&self) -> Result<String, DescError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One label per tensor of `graph`, by index.
pub(crate) fn tensor_labels(
    graph: &Graph,
    names: &IndexMap<String, TensorId>,
) -> Result<Vec<String>, DescError> {
    let mut labels: Vec<Option<String>> = vec![None; graph.tensor_count()];
    for (name, &t) in names {
        let slot = &mut labels[t.index()];
        if slot.is_none() {
            *slot = Some(name.clone());
        }
    }
    let labels: Vec<String> = labels
        .into_iter()
        .enumerate()
        .map(|(i, l)| l.unwrap_or_else(|| format!("%{i}")))
        .collect();

    let mut seen = std::collections::HashSet::new();
    for l in &labels {
        if !seen.insert(l.as_str()) {
            return Err(DescError::DuplicateName(l.clone()));
        }
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::infer::layout_inference;
    use crate::rules::Registry;
    use crate::shape;
    use crate::tensor::TensorRole;
    use std::io::Write;

    const CONV_GRAPH: &str = r#"{
        "tensors": {
            "image": {"shape": [1, 8, 8, 3], "dtype": "float32", "role": "input"},
            "bias": {"shape": [4], "dtype": "float32", "role": "constant"},
            "conv": {"shape": [1, 4, 8, 8], "dtype": "float32"},
            "act": {"shape": [1, 4, 8, 8], "dtype": "float32", "role": "output"}
        },
        "ops": [
            {"kind": "conv2d", "attrs": {"layout": [0, 3, 1, 2]},
             "inputs": ["image", "bias"], "outputs": ["conv"]},
            {"kind": "relu", "inputs": ["conv"], "outputs": ["act"]}
        ]
    }"#;

    #[test]
    fn test_load_from_file_and_build() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONV_GRAPH.as_bytes()).unwrap();

        let desc = GraphDesc::from_path(file.path()).unwrap();
        let ctx = Context::new();
        let (graph, names) = desc.build(&ctx).unwrap();
        assert_eq!(graph.inputs(), &[names["image"]]);
        assert_eq!(graph.outputs(), &[names["act"]]);
        assert_eq!(graph.tensor(names["conv"]).role, TensorRole::Transient);
        assert_eq!(graph.tensor(names["bias"]).dtype, Dtype::Float32);
        assert_eq!(graph.constants().collect::<Vec<_>>(), vec![names["bias"]]);
        assert_eq!(graph.op_count(), 2);
    }

    #[test]
    fn test_describe_inference_result() {
        let ctx = Context::new();
        let desc = GraphDesc::from_json(CONV_GRAPH).unwrap();
        let (src, names) = desc.build(&ctx).unwrap();
        let result = layout_inference(&src, &ctx, &Registry::builtin()).unwrap();

        let described = InferenceDesc::new(&result, &names).unwrap();
        assert_eq!(described.inputs["image"], "image");
        assert_eq!(described.outputs["act"], "act");
        assert!(!described.inputs.contains_key("bias"));
        assert_eq!(described.stats, result.stats);

        let kinds: Vec<&str> = described.graph.ops.iter().map(|o| o.kind.as_str()).collect();
        assert_eq!(kinds, vec!["transpose", "conv2d", "relu"]);
        // The transpose feeding the conv is unnamed.
        let transposed = &described.graph.ops[0].outputs[0];
        assert!(transposed.starts_with('%'));
        assert_eq!(described.graph.tensors[transposed].shape, shape![1, 3, 8, 8]);
    }

    #[test]
    fn test_unknown_tensor() {
        let desc = GraphDesc::from_json(
            r#"{"tensors": {"x": {"shape": [2], "dtype": "int8", "role": "input"}},
                "ops": [{"kind": "relu", "inputs": ["x"], "outputs": ["y"]}]}"#,
        )
        .unwrap();
        match desc.build(&Context::new()) {
            Err(DescError::UnknownTensor { op, name, .. }) => {
                assert_eq!(op, 0);
                assert_eq!(name, "y");
            }
            r => panic!("expected UnknownTensor, got {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_operation() {
        let desc = GraphDesc::from_json(
            r#"{"tensors": {"x": {"shape": [2], "dtype": "int8", "role": "input"}},
                "ops": [{"kind": "relu", "inputs": ["x"], "outputs": ["x"]}]}"#,
        )
        .unwrap();
        assert!(matches!(
            desc.build(&Context::new()),
            Err(DescError::Graph {
                source: GraphError::NotProducible(_),
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_tensors_are_rejected() {
        let wide = format!(
            r#"{{"tensors": {{"x": {{"shape": {:?}, "dtype": "int8", "role": "input"}}}}}}"#,
            vec![1; 300]
        );
        assert!(matches!(
            GraphDesc::from_json(&wide).unwrap().build(&Context::new()),
            Err(DescError::InvalidTensor {
                source: PermuteError::RankTooLarge(300),
                ..
            })
        ));

        let desc = GraphDesc::from_json(
            r#"{"tensors": {"w": {"shape": [4, 2], "dtype": "int8", "role": "constant",
                "quantization": {"type": "per_channel", "channel_dim": 2,
                                 "scales": [1.0, 1.0], "zero_points": [0, 0]}}}}"#,
        )
        .unwrap();
        match desc.build(&Context::new()) {
            Err(DescError::InvalidTensor { name, source }) => {
                assert_eq!(name, "w");
                assert_eq!(source, PermuteError::AxisOutOfRange { axis: 2, rank: 2 });
            }
            r => panic!("expected InvalidTensor, got {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn test_generated_names_must_not_collide() {
        let ctx = Context::new();
        let desc = GraphDesc::from_json(
            r#"{"tensors": {
                    "%1": {"shape": [2], "dtype": "int8", "role": "input"},
                    "y": {"shape": [2], "dtype": "int8", "role": "output"}
                }}"#,
        )
        .unwrap();
        let (graph, mut names) = desc.build(&ctx).unwrap();
        names.shift_remove("y");
        assert!(matches!(
            GraphDesc::from_graph(&graph, &names),
            Err(DescError::DuplicateName(n)) if n == "%1"
        ));
    }
}
