use indexmap::IndexMap;
use itertools::Itertools;
use prettytable::{self, format, row, Table};

use crate::desc::{tensor_labels, DescError};
use crate::graph::{Graph, TensorId};
use crate::infer::LayoutInference;

/// Prints the operations of a pass result and its boundary maps to stdout.
pub fn pprint(
    result: &LayoutInference,
    src_names: &IndexMap<String, TensorId>,
) -> Result<(), DescError> {
    let (ops, boundary) = tables(result, src_names)?;
    ops.printstd();
    println!();
    boundary.printstd();
    Ok(())
}

/// Like [pprint], but returns the rendered tables.
pub fn pprint_string(
    result: &LayoutInference,
    src_names: &IndexMap<String, TensorId>,
) -> Result<String, DescError> {
    let (ops, boundary) = tables(result, src_names)?;
    Ok(format!("{ops}\n{boundary}"))
}

fn tables(
    result: &LayoutInference,
    src_names: &IndexMap<String, TensorId>,
) -> Result<(Table, Table), DescError> {
    let io = result.io_map();
    let out_names: IndexMap<String, TensorId> = src_names
        .iter()
        .filter_map(|(name, s)| io.get(s).map(|&o| (name.clone(), o)))
        .collect();
    let labels = tensor_labels(&result.graph, &out_names)?;

    let mut boundary = Table::new();
    boundary.set_titles(row!["Tensor", "Role", "Bound to", "Shape"]);
    for (role, map) in [("input", &result.inputs), ("output", &result.outputs)] {
        for (name, s) in src_names {
            if let Some(&o) = map.get(s) {
                boundary.add_row(row![
                    name,
                    role,
                    labels[o.index()],
                    result.graph.tensor(o)
                ]);
            }
        }
    }
    boundary.set_format(plain_format());

    Ok((op_table(&result.graph, &labels), boundary))
}

fn op_table(graph: &Graph, labels: &[String]) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["", "Kind", "Inputs", "Outputs", "Attributes"]);
    for o in graph.op_ids() {
        let op = graph.op(o);
        let attrs = op
            .attrs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .join(" ");
        table.add_row(row![
            o,
            op.kind,
            op.inputs.iter().map(|t| &labels[t.index()]).join(", "),
            op.outputs
                .iter()
                .map(|&t| format!("{}: {}", labels[t.index()], graph.tensor(t)))
                .join(", "),
            attrs
        ]);
    }
    table.set_format(plain_format());
    table
}

fn plain_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}
