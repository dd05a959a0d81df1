use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use walkdir::WalkDir;

use sinktrace::chains::{chain_to_markdown, chains_to_json, ChainStep};
use sinktrace::client::LspClient;
use sinktrace::launcher::JdtlsLauncher;
use sinktrace::rules::resolve_rules;
use sinktrace::tracer::{Tracer, TracerOptions};
use sinktrace::uri::is_java_file;

#[derive(Parser, Debug)]
#[command(name = "sinktrace")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reverse taint chain scanner driven by a Java language server")]
struct Args {
    /// Path to the project root directory
    #[arg(short, long)]
    project: PathBuf,

    /// Path to the Eclipse JDT.LS installation directory
    #[arg(long)]
    jdtls: PathBuf,

    /// Analyze a single call site instead of scanning
    /// (format: path/To/File.java:LINE, one-based)
    #[arg(long)]
    file: Option<String>,

    /// Rules file overriding the built-in catalogue
    /// (default: ./rules.yaml if present)
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Keep only chains that start at a framework entry point with a
    /// plausible untrusted-input surface
    #[arg(long)]
    strict: bool,

    /// Share the visited set across all traces instead of per-chain scoping
    #[arg(long)]
    shared_visited: bool,

    /// Maximum number of concurrent chain traces
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Write the chain report as JSON to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Optional lombok.jar injected into the language server
    #[arg(long)]
    lombok: Option<PathBuf>,

    /// Enable verbose logging (to stderr)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting sinktrace v{}", env!("CARGO_PKG_VERSION"));

    let project_root = std::path::absolute(&args.project)
        .with_context(|| format!("invalid project path {}", args.project.display()))?;
    if !project_root.is_dir() {
        bail!("project root {} is not a directory", project_root.display());
    }

    // Single-target mode points at one call site; scan mode needs any Java
    // file as an anchor to kick the server's indexer awake.
    let target = match &args.file {
        Some(raw) => Some(parse_target(raw, &project_root)?),
        None => None,
    };
    let anchor_file = match &target {
        Some((file, _)) => file.clone(),
        None => find_anchor_file(&project_root)
            .context("no .java files found in the project, nothing to analyze")?,
    };

    let rules = resolve_rules(args.rules.as_deref())?;
    info!("loaded {} rules", rules.len());

    let launcher = JdtlsLauncher::new(args.jdtls).with_lombok(args.lombok);
    let command = launcher.build_command()?;
    let client = Arc::new(LspClient::spawn(command)?);

    let options = TracerOptions {
        strict_mode: args.strict,
        shared_visited: args.shared_visited,
        max_concurrent_traces: args.workers,
        ..TracerOptions::default()
    };
    let tracer = Arc::new(Tracer::new(client, project_root.clone(), options));
    tracer.initialize(&anchor_file).await?;

    match target {
        None => Arc::clone(&tracer).scan_and_trace(&rules).await?,
        Some((file, line)) => {
            let line_index = line - 1;
            info!("analyzing call site at {}:{line}", file.display());
            match tracer.enclosing_function(&file, line_index).await {
                Some(function) => {
                    let first_step = ChainStep {
                        file: file.clone(),
                        line: line_index,
                        func: function.name.clone(),
                        code: line_content(&file, line_index),
                        analysis: Vec::new(),
                    };
                    let mut visited = HashSet::new();
                    tracer
                        .trace_chain(
                            file,
                            function.start_line,
                            function.column,
                            vec![first_step],
                            &mut visited,
                        )
                        .await;
                }
                None => warn!("no enclosing function at that line; is the line number correct?"),
            }
        }
    }

    let chains = tracer.results.snapshot();
    if chains.is_empty() {
        info!("no vulnerability chains found");
        return Ok(());
    }

    for chain in &chains {
        println!("{}", chain_to_markdown(chain, &project_root));
    }
    if let Some(output) = &args.output {
        std::fs::write(output, chains_to_json(&chains)?)
            .with_context(|| format!("failed to write report to {}", output.display()))?;
        info!("wrote {} chains to {}", chains.len(), output.display());
    }

    Ok(())
}

/// Parse a `path/To/File.java:LINE` target into an absolute path and a
/// one-based line number.
fn parse_target(raw: &str, project_root: &std::path::Path) -> Result<(PathBuf, usize)> {
    let Some((raw_path, raw_line)) = raw.rsplit_once(':') else {
        bail!("invalid target format, expected path/To/File.java:LINE");
    };
    let line: usize = raw_line
        .parse()
        .with_context(|| format!("invalid line number {raw_line}"))?;
    if line == 0 {
        bail!("line numbers are one-based");
    }
    let path = PathBuf::from(raw_path);
    let path = if path.is_absolute() { path } else { project_root.join(path) };
    Ok((path, line))
}

/// First Java file under the root, skipping hidden and build directories.
fn find_anchor_file(root: &std::path::Path) -> Option<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !(name.starts_with('.') || name == "target" || name == "build" || name == "node_modules")
        })
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && is_java_file(entry.path()))
        .map(|entry| entry.into_path())
}

fn line_content(path: &std::path::Path, line_index: usize) -> String {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.lines().nth(line_index).map(|l| l.trim().to_string()))
        .unwrap_or_default()
}
