//! commonspace - register anatomical scans to a common template
//!
//! ## Commands
//!
//! - `register`: build a template from a batch of scans and register every scan to it
//! - `graph`: write the pipeline's stage graph as Graphviz DOT, or print the execution plan
//! - `clear-cache`: drop the stage cache kept under an output directory

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use commonspace_core::telemetry::{init_tracing, LogFormat};
use commonspace_core::{
    CommandBackend, EngineSettings, PersistentCache, PipelineEngine, PipelineGraph,
    RegistrationJob, RegistrationResult, ToolCommands,
};

#[derive(Parser)]
#[command(name = "commonspace")]
#[command(author = "Stevedores Org")]
#[command(version = commonspace_core::VERSION)]
#[command(about = "Register anatomical scans to a common template", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines (and JSON command output)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register every image to a common whole-head template
    Register(RegisterArgs),

    /// Write the pipeline stage graph as DOT
    Graph {
        /// Brain iterations to unroll
        #[arg(long, env = "COMMONSPACE_BRAIN_ITERATIONS", default_value = "3")]
        brain_iterations: u32,

        /// Output file (DOT goes to stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print stages in execution order with their inputs instead of DOT
        #[arg(long)]
        plan: bool,
    },

    /// Delete the stage cache under an output directory
    ClearCache {
        /// Output directory of an earlier run
        #[arg(short, long, env = "COMMONSPACE_OUTPUT_DIR")]
        output_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RegisterArgs {
    /// Anatomical images, in the order results are reported
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Where intermediate and registered images are written
    #[arg(short, long, env = "COMMONSPACE_OUTPUT_DIR")]
    output_dir: PathBuf,

    /// Resolution parameter forwarded to every stage (e.g. 400 for a mouse brain)
    #[arg(short, long, env = "COMMONSPACE_RESOLUTION")]
    resolution: f64,

    /// Extract brains with RATS instead of histogram-based skull stripping
    #[arg(long, env = "COMMONSPACE_USE_RATS_TOOL")]
    use_rats_tool: bool,

    /// Recompute every stage and keep no cache
    #[arg(long)]
    no_caching: bool,

    /// Cap on brain register-and-average iterations
    #[arg(long, env = "COMMONSPACE_BRAIN_ITERATIONS")]
    brain_iterations: Option<u32>,

    /// Voxels the brain mask is grown by for the head stages
    #[arg(long, env = "COMMONSPACE_SCALP_DILATION")]
    scalp_dilation: Option<u32>,

    /// Subjects processed concurrently (0 = one per CPU)
    #[arg(long, env = "COMMONSPACE_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Per-tool timeout in seconds (0 = none)
    #[arg(long, env = "COMMONSPACE_TOOL_TIMEOUT")]
    tool_timeout: Option<u64>,

    /// JSON file with `engine` and `tools` sections; flags win over it
    #[arg(long, env = "COMMONSPACE_CONFIG")]
    config: Option<PathBuf>,

    /// Verify every external program is installed before running
    #[arg(long)]
    check_tools: bool,
}

/// Contents of `--config`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileConfig {
    engine: EngineSettings,
    tools: ToolCommands,
}

fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

impl RegisterArgs {
    /// Apply flag overrides on top of the config file.
    fn resolve(&self, mut config: FileConfig) -> (EngineSettings, ToolCommands) {
        if let Some(n) = self.brain_iterations {
            config.engine.brain_iterations = n;
        }
        if let Some(v) = self.scalp_dilation {
            config.engine.scalp_dilation = v;
        }
        if let Some(n) = self.max_parallel {
            config.engine.max_parallel = n;
        }
        if let Some(t) = self.tool_timeout {
            config.tools.timeout_secs = t;
        }
        (config.engine, config.tools)
    }

    fn job(&self) -> RegistrationJob {
        RegistrationJob::new(self.images.clone(), &self.output_dir, self.resolution)
            .with_rats_tool(self.use_rats_tool)
            .with_caching(!self.no_caching)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(LogFormat::from_json_flag(cli.json), level);

    match cli.command {
        Commands::Register(args) => cmd_register(&args, cli.json).await,
        Commands::Graph {
            brain_iterations,
            output,
            plan,
        } => cmd_graph(brain_iterations, output.as_deref(), plan),
        Commands::ClearCache { output_dir } => cmd_clear_cache(&output_dir),
    }
}

async fn cmd_register(args: &RegisterArgs, json: bool) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let (settings, tools) = args.resolve(config);
    let job = args.job();

    let backend = CommandBackend::new(tools);
    if args.check_tools {
        backend
            .check_available(job.extraction_method())
            .context("Required registration tools are missing")?;
    }

    let engine = PipelineEngine::new(Arc::new(backend), settings);
    let result = engine.run(&job).await.context("Registration failed")?;
    print_result(&result, json)
}

fn print_result(result: &RegistrationResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    for path in &result.registered {
        println!("{}", path.display());
    }
    info!(
        template = %result.template.display(),
        brain_iterations = result.brain_iterations,
        computed = result.stats.computed,
        cached = result.stats.cached,
        "registration complete"
    );
    Ok(())
}

fn cmd_graph(brain_iterations: u32, output: Option<&Path>, plan: bool) -> Result<()> {
    let graph = PipelineGraph::anats_to_common(brain_iterations)?;
    if let Some(output) = output {
        graph
            .write_dot(output)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        println!("Wrote pipeline graph to {}", output.display());
    }
    if plan {
        print!("{}", render_plan(&graph));
    } else if output.is_none() {
        print!("{}", graph.to_dot());
    }
    Ok(())
}

/// One line per node, in an order that respects every dependency.
fn render_plan(graph: &PipelineGraph) -> String {
    let mut out = String::new();
    for (step, node) in graph.topological_order().into_iter().enumerate() {
        let scope = match node.stage {
            Some(stage) if stage.per_subject() => "per subject",
            Some(_) => "batch",
            None => "data",
        };
        let deps: Vec<&str> = graph
            .dependencies_of(&node.id)
            .into_iter()
            .map(|n| n.id.as_str())
            .collect();
        let deps = if deps.is_empty() {
            "-".to_string()
        } else {
            deps.join(", ")
        };
        let _ = writeln!(out, "{:>2}. {:<22} {:<11} <- {deps}", step + 1, node.id, scope);
    }
    out
}

fn cmd_clear_cache(output_dir: &Path) -> Result<()> {
    if !PersistentCache::root_for(output_dir).is_dir() {
        println!("No cache under {}", output_dir.display());
        return Ok(());
    }
    let defaults = EngineSettings::default();
    let cache = PersistentCache::open(output_dir, defaults.lock_timeout(), defaults.stale_lock())?;
    let removed = cache.clear().context("Failed to clear cache")?;
    println!("Removed {removed} cache entries from {}", output_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args.iter().copied()).expect("valid command line")
    }

    #[test]
    fn test_register_flags_override_config() {
        let cli = parse(&[
            "commonspace",
            "register",
            "a.nii.gz",
            "b.nii.gz",
            "--output-dir",
            "/tmp/out",
            "--resolution",
            "400",
            "--brain-iterations",
            "5",
            "--no-caching",
        ]);
        let Commands::Register(args) = cli.command else {
            panic!("expected register");
        };

        let config = FileConfig {
            engine: EngineSettings {
                brain_iterations: 2,
                scalp_dilation: 7,
                ..EngineSettings::default()
            },
            tools: ToolCommands::default(),
        };
        let (settings, _) = args.resolve(config);
        assert_eq!(settings.brain_iterations, 5);
        assert_eq!(settings.scalp_dilation, 7);

        let job = args.job();
        assert_eq!(job.images.len(), 2);
        assert!(!job.caching);
        assert!(!job.use_rats_tool);
        let library = RegistrationJob::new(vec![], "/tmp/out", 400.0);
        assert_eq!(job.use_rats_tool, library.use_rats_tool);
    }

    #[test]
    fn test_register_requires_images() {
        let err = Cli::try_parse_from(["commonspace", "register", "-o", "/tmp/out", "-r", "400"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_config_file_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commonspace.json");
        std::fs::write(&path, r#"{ "tools": { "allineate": "/opt/afni/3dAllineate" } }"#).unwrap();

        let config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.tools.allineate, "/opt/afni/3dAllineate");
        assert_eq!(config.tools.mean, "3dMean");
        assert_eq!(config.engine, EngineSettings::default());
    }

    #[test]
    fn test_bad_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{").unwrap();
        let err = load_config(Some(path.as_path())).unwrap_err();
        assert!(err.to_string().contains("Invalid config"));
    }

    #[test]
    fn test_plan_lists_stages_after_their_inputs() {
        let graph = PipelineGraph::anats_to_common(1).unwrap();
        let plan = render_plan(&graph);
        let lines: Vec<&str> = plan.lines().collect();

        assert_eq!(lines.len(), graph.nodes().len());
        assert!(lines[0].starts_with(" 1. images"), "{plan}");
        assert!(lines.last().unwrap().contains("registered"), "{plan}");

        let extraction = lines.iter().find(|l| l.contains("brain_extraction")).unwrap();
        assert!(extraction.contains("per subject"));
        assert!(extraction.ends_with("<- images"));

        let average = lines.iter().find(|l| l.contains("head_average")).unwrap();
        assert!(average.contains("batch"));

        let init = lines.iter().find(|l| l.contains("head_init")).unwrap();
        assert!(init.ends_with("<- images, brain_average_iter1, brain_affine_iter1, head_mask"));
    }

    #[test]
    fn test_graph_flags() {
        let cli = parse(&["commonspace", "graph", "--plan", "--brain-iterations", "2"]);
        let Commands::Graph { output, plan, brain_iterations } = cli.command else {
            panic!("expected graph");
        };
        assert!(plan);
        assert!(output.is_none());
        assert_eq!(brain_iterations, 2);
    }

    #[test]
    fn test_graph_and_clear_cache() {
        let dir = tempfile::tempdir().unwrap();
        let dot = dir.path().join("pipeline.dot");
        cmd_graph(2, Some(&dot), false).unwrap();
        assert!(std::fs::read_to_string(&dot)
            .unwrap()
            .contains("brain_affine_iter2"));

        let out = dir.path().join("common");
        cmd_clear_cache(&out).unwrap();
        let settings = EngineSettings::default();
        PersistentCache::open(&out, settings.lock_timeout(), settings.stale_lock()).unwrap();
        assert!(PersistentCache::root_for(&out).is_dir());
        cmd_clear_cache(&out).unwrap();
        assert!(!PersistentCache::root_for(&out).exists());
    }
}
