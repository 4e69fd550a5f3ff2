//! The command-line driver: load the operation graph and previous
//! results, run one evaluation pass, save results.

use crate::db;
use crate::engine::{BuildEvaluateEngine, EvalOptions};
use crate::fs::FileSystemState;
use crate::progress::ConsoleProgress;
use crate::sandbox::ProcessSandbox;
use anyhow::anyhow;
use argh::FromArgs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// incremental evaluation of a build operation graph
#[derive(FromArgs)]
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// parallelism [default from system]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// print diagnostic log output
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// operation results file [default: graph file with .bor extension]
    #[argh(option)]
    results: Option<String>,

    /// operation graph file
    #[argh(positional)]
    graph: String,
}

pub fn run() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();

    if let Some(dir) = &args.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let parallelism = match args.parallelism {
        Some(n) => n,
        None => usize::from(std::thread::available_parallelism()?),
    };

    let mut fs = FileSystemState::new();
    let graph_path = PathBuf::from(&args.graph);
    let graph = db::read_graph_file(&graph_path, &mut fs)
        .map_err(|err| anyhow!("read {:?}: {}", graph_path, err))?;

    let results_path = match &args.results {
        Some(path) => PathBuf::from(path),
        None => graph_path.with_extension("bor"),
    };
    let mut progress = ConsoleProgress::new(args.verbose);
    let mut results = db::load_results_file(&results_path, &mut fs, &mut progress);

    let mut engine = BuildEvaluateEngine::new(
        &graph,
        &mut results,
        &mut fs,
        Arc::new(ProcessSandbox),
        &mut progress,
        EvalOptions {
            parallelism,
            ..EvalOptions::default()
        },
    );
    let outcome = engine.evaluate();

    // Save once the pass settles, also on failure: results recorded
    // before the failing operation stay valid for the next run.
    db::write_results_file(&results_path, &results, &fs)?;

    match outcome {
        Ok(true) => {
            println!("girder: build complete");
            Ok(0)
        }
        Ok(false) => {
            println!("girder: no work to do");
            Ok(0)
        }
        Err(err) => {
            eprintln!("girder: error: {}", err);
            Ok(1)
        }
    }
}
