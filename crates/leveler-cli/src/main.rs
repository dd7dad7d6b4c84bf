use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::{Context, IntoDiagnostic};
use ndarray::Array4;
use tracing_subscriber::EnvFilter;

use leveler_ir::ComputeGraph;
use leveler_opt::{
    CalibrationRestorer, CleConfig, CrossLayerEqualizer, DEFAULT_THRESHOLD, Device,
    find_layer_groups, fold_batch_norms,
};

/// leveler: cross-layer equalization for convolutional networks
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Input model (JSON)
    input: PathBuf,

    /// Output model path (default: <input>.cle.json)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Example input shape as N,C,H,W
    #[arg(long, default_value = "1,3,224,224", value_parser = parse_shape)]
    input_shape: [usize; 4],

    /// Upper bound on the scale ratio of conv -> depthwise conv -> conv groups
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,

    /// Number of equalization passes
    #[arg(long, default_value_t = 2)]
    cle_iters: usize,

    /// Skip high-bias absorption
    #[arg(long)]
    no_hba: bool,

    /// Directory for intermediate artifacts
    #[arg(long, default_value = "out")]
    work_dir: PathBuf,

    /// Directory of raw f32 `.bin` inputs used to restore batch-norm
    /// statistics for models without batch-norm
    #[arg(long)]
    calibration_dir: Option<PathBuf>,

    /// Print the discovered layer groups to stderr
    #[arg(long)]
    dump_groups: bool,

    /// Validate the model and discover groups without producing output
    #[arg(long)]
    dry_run: bool,
}

fn parse_shape(s: &str) -> Result<[usize; 4], String> {
    let dims: Vec<usize> = s
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid shape '{s}': {e}"))?;
    match dims.as_slice() {
        &[n, c, h, w] if dims.iter().all(|&d| d > 0) => Ok([n, c, h, w]),
        _ => Err(format!(
            "invalid shape '{s}', expected four positive dimensions N,C,H,W"
        )),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn dump_groups(graph: &ComputeGraph) -> miette::Result<()> {
    let mut folded = graph.clone();
    fold_batch_norms(&mut folded)
        .into_diagnostic()
        .wrap_err("batch-norm folding failed")?;
    let groups = find_layer_groups(&folded)
        .into_diagnostic()
        .wrap_err("layer group discovery failed")?;

    eprintln!("{} layer group(s):", groups.len());
    for group in &groups {
        match group.shape() {
            Some(shape) => eprintln!("  {shape:<16} {group}"),
            None => eprintln!("  {:<16} {group}", "unsupported"),
        }
    }
    Ok(())
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    // 1. Load the model.
    let graph = ComputeGraph::load_json(&cli.input)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to load {}", cli.input.display()))?;

    // 2. Optionally show the groups that will be equalized.
    if cli.dump_groups {
        dump_groups(&graph)?;
    }

    // 3. Dry-run: stop here.
    if cli.dry_run {
        return Ok(());
    }

    // 4. Configure the pipeline.
    let config = CleConfig {
        threshold: cli.threshold,
        cle_iters: cli.cle_iters,
        hba: !cli.no_hba,
        work_dir: cli.work_dir.clone(),
    };
    let mut equalizer = CrossLayerEqualizer::new(config);
    if let Some(dir) = &cli.calibration_dir {
        let restorer = CalibrationRestorer::load_from_dir(dir, cli.input_shape)
            .into_diagnostic()
            .wrap_err("failed to load calibration data")?;
        equalizer = equalizer.with_restorer(restorer, None);
    }

    // 5. Equalize.
    let example_input = Array4::<f32>::zeros(cli.input_shape);
    let equalized = equalizer
        .run(&graph, &example_input, Device::Cpu)
        .into_diagnostic()
        .wrap_err("cross-layer equalization failed")?;

    // 6. Write the result.
    let output = cli
        .output
        .unwrap_or_else(|| cli.input.with_extension("cle.json"));
    equalized
        .save_json(&output)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to write {}", output.display()))?;
    eprintln!("wrote {}", output.display());

    Ok(())
}
