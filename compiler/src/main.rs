use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use nestc::dot::emit_dot;
use nestc::func::Pipeline;
use nestc::pass::PassId;
use nestc::pipeline::{compute_provenance, run_pipeline, CompilationState, LowerOptions};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    Nest,
    Json,
    Dot,
    Regions,
    BuildInfo,
}

impl EmitStage {
    fn terminal(self) -> PassId {
        match self {
            EmitStage::Nest | EmitStage::Json => PassId::Verify,
            EmitStage::Dot => PassId::Validate,
            EmitStage::Regions => PassId::Regions,
            EmitStage::BuildInfo => PassId::Validate,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "nestc",
    version,
    about = "Loop-nest compiler — lowers scheduled pipelines (JSON) to bounded loop nests"
)]
struct Cli {
    /// Pipeline description (serde JSON of a Pipeline)
    pipeline: PathBuf,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Nest)]
    emit: EmitStage,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Disable automatic storage folding
    #[arg(long)]
    no_fold: bool,

    /// Disable the sliding window optimization
    #[arg(long)]
    no_sliding: bool,

    /// Disable stage skipping
    #[arg(long)]
    no_skip: bool,

    /// Log pass timings and decisions (RUST_LOG overrides)
    #[arg(long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "nestc=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    debug!(pipeline = %cli.pipeline.display(), emit = ?cli.emit, "nestc starting");

    let options = LowerOptions {
        storage_folding: !cli.no_fold,
        sliding_window: !cli.no_sliding,
        skip_stages: !cli.no_skip,
        ..LowerOptions::default()
    };

    // ── Read pipeline ──
    let pipeline = match load_pipeline(&cli.pipeline) {
        Ok(p) => p,
        Err(msg) => {
            eprintln!("nestc: error: {}", msg);
            std::process::exit(2);
        }
    };
    debug!(funcs = pipeline.funcs.len(), outputs = pipeline.outputs.len(), "pipeline loaded");

    // ── Lower ──
    let mut state = CompilationState::new(pipeline);
    let result = run_pipeline(&mut state, cli.emit.terminal(), &options, |_, diags| {
        for diag in diags {
            eprintln!("nestc: {}", diag);
        }
    });
    if let Err(e) = result {
        eprintln!("nestc: {}", e);
        std::process::exit(1);
    }

    // ── Emit ──
    let text = match render(&state, cli.emit, &options) {
        Ok(t) => t,
        Err(msg) => {
            eprintln!("nestc: error: {}", msg);
            std::process::exit(1);
        }
    };
    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, text) {
                eprintln!("nestc: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
            debug!(output = %path.display(), "wrote output");
        }
        None => print!("{}", text),
    }
}

fn load_pipeline(path: &Path) -> Result<Pipeline, String> {
    let source = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    serde_json::from_str(&source).map_err(|e| format!("{}: {}", path.display(), e))
}

fn render(state: &CompilationState, emit: EmitStage, options: &LowerOptions) -> Result<String, String> {
    match emit {
        EmitStage::Nest => {
            let nest = state.nest.as_ref().ok_or("no loop nest produced")?;
            Ok(format!("{}", nest))
        }
        EmitStage::Json => {
            let nest = state.nest.as_ref().ok_or("no loop nest produced")?;
            let mut json = serde_json::to_string_pretty(nest).map_err(|e| e.to_string())?;
            json.push('\n');
            Ok(json)
        }
        EmitStage::Dot => {
            let graph = state.graph.as_ref().ok_or("no call graph produced")?;
            Ok(emit_dot(&state.pipeline, graph))
        }
        EmitStage::Regions => {
            let (Some(regions), Some(order)) = (state.regions.as_ref(), state.order.as_ref())
            else {
                return Err("no regions inferred".to_string());
            };
            let mut json =
                serde_json::to_string_pretty(&regions.entries(order)).map_err(|e| e.to_string())?;
            json.push('\n');
            Ok(json)
        }
        EmitStage::BuildInfo => {
            let provenance = state
                .provenance
                .clone()
                .unwrap_or_else(|| compute_provenance(&state.pipeline, options));
            Ok(provenance.to_json())
        }
    }
}
