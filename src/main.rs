use anyhow::{Context as _, Result};
use clap::Parser;
use indexmap::IndexMap;
use log::info;
use rayon::prelude::*;
use std::{fs, path};

use layout_infer::desc::{GraphDesc, InferenceDesc};
use layout_infer::graph::{Context, TensorId};
use layout_infer::pprint::pprint;
use layout_infer::rules::{LayoutFixed, Registry};
use layout_infer::{layout_inference, LayoutInference};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    #[command(about = "Infer layouts for one graph")]
    Infer {
        graph: path::PathBuf,
        /// Write the rewritten graph as JSON to this file instead of stdout
        #[arg(long, short)]
        output: Option<path::PathBuf>,
        /// Print the rewritten graph as a table
        #[arg(long)]
        print: bool,
        /// Keep unknown operation kinds in declared order instead of failing
        #[arg(long)]
        fallback: bool,
    },
    #[command(about = "Infer layouts for many graphs in parallel")]
    Batch {
        #[arg(required = true)]
        graphs: Vec<path::PathBuf>,
        /// Directory for the rewritten graphs (default: next to each input)
        #[arg(long)]
        out_dir: Option<path::PathBuf>,
        /// Worker threads (default: one per core)
        #[arg(long, short)]
        jobs: Option<usize>,
        #[arg(long)]
        fallback: bool,
    },
    #[command(about = "List the built-in operation kinds")]
    Kinds,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.command {
        Command::Infer {
            graph,
            output,
            print,
            fallback,
        } => {
            let registry = registry(fallback);
            let (result, names) = run(&graph, &registry)?;
            if print {
                pprint(&result, &names)?;
            }
            let json = InferenceDesc::new(&result, &names)?.to_json_pretty()?;
            match output {
                Some(path) => fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?,
                None if !print => println!("{json}"),
                None => {}
            }
            Ok(())
        }
        Command::Batch {
            graphs,
            out_dir,
            jobs,
            fallback,
        } => {
            if let Some(jobs) = jobs {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(jobs)
                    .build_global()?;
            }
            let registry = registry(fallback);
            let failures: Vec<String> = graphs
                .par_iter()
                .filter_map(|path| {
                    let written = batch_one(path, out_dir.as_deref(), &registry);
                    written.err().map(|e| format!("{}: {e:#}", path.display()))
                })
                .collect();
            info!(
                "Processed {} graphs, {} failed",
                graphs.len(),
                failures.len()
            );
            for f in &failures {
                eprintln!("{f}");
            }
            if !failures.is_empty() {
                anyhow::bail!("{} of {} graphs failed", failures.len(), graphs.len());
            }
            Ok(())
        }
        Command::Kinds => {
            for (kind, category) in Registry::builtin().kinds() {
                println!("{kind:<16} {category}");
            }
            Ok(())
        }
    }
}

fn registry(fallback: bool) -> Registry {
    let registry = Registry::builtin();
    if fallback {
        registry.with_fallback(LayoutFixed::identity())
    } else {
        registry
    }
}

fn run(
    path: &path::Path,
    registry: &Registry,
) -> Result<(LayoutInference, IndexMap<String, TensorId>)> {
    let desc =
        GraphDesc::from_path(path).with_context(|| format!("loading {}", path.display()))?;
    // Each pass gets its own context and graphs.
    let ctx = Context::new();
    let (src, names) = desc.build(&ctx)?;
    let result = layout_inference(&src, &ctx, registry)
        .with_context(|| format!("inferring layouts for {}", path.display()))?;
    Ok((result, names))
}

fn batch_one(path: &path::Path, out_dir: Option<&path::Path>, registry: &Registry) -> Result<()> {
    let (result, names) = run(path, registry)?;
    let json = InferenceDesc::new(&result, &names)?.to_json_pretty()?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "graph".to_string());
    let dir = match out_dir {
        Some(dir) => dir.to_path_buf(),
        None => path
            .parent()
            .map(path::Path::to_path_buf)
            .unwrap_or_default(),
    };
    let dest = dir.join(format!("{stem}.layout.json"));
    fs::write(&dest, json).with_context(|| format!("writing {}", dest.display()))?;
    info!(
        "{} -> {} ({} transposes)",
        path.display(),
        dest.display(),
        result.stats.inserted_transposes
    );
    Ok(())
}
