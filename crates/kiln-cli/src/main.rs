//! `kiln`: a thin demo frontend over [`kiln_core`]. Loads a JSON project
//! file (a stand-in for the YAML element loader kept out of scope), runs
//! the track/fetch/pull/build/push pipeline for the requested elements,
//! and re-execs itself as the job worker when spawned with
//! [`kiln_job::WORKER_FLAG`].
//!
//! Uses a `clap`-derive `Cli`/`Commands` shape and plain `println!`-based
//! report printers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kiln", version)]
#[command(about = "Declarative, reproducible build pipeline demo")]
struct Cli {
    /// JSON file describing the project's elements (see `kiln_types::Element`).
    #[arg(long, default_value = "kiln-project.json")]
    project_file: PathBuf,

    /// Override the cache directory (`kiln.toml`'s `cache.dir` otherwise).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Project name used in remote artifact references.
    #[arg(long, default_value = "kiln")]
    project_name: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline for the given elements (and their dependencies).
    Build {
        /// Element names to build (and their transitive dependencies).
        elements: Vec<String>,
    },
    /// Print the loaded project's elements without building anything.
    Show,
}

fn main() -> Result<()> {
    let mut args = std::env::args();
    let exe = args.next();
    if args.as_slice().first().map(String::as_str) == Some(kiln_job::WORKER_FLAG) {
        return kiln_job::run_worker(kiln_core::worker::run_action).context("worker run failed");
    }
    drop(exe);

    let cli = Cli::parse();
    let project = load_project(&cli.project_file)
        .with_context(|| format!("loading project file {}", cli.project_file.display()))?;

    match cli.cmd {
        Commands::Show => {
            for (name, element) in project.elements() {
                println!("{name} ({})", element.kind);
                if !element.build_dependencies.is_empty() {
                    println!("  build-deps: {}", element.build_dependencies.join(", "));
                }
                if !element.runtime_dependencies.is_empty() {
                    println!("  runtime-deps: {}", element.runtime_dependencies.join(", "));
                }
            }
        }
        Commands::Build { elements } => {
            let roots = if elements.is_empty() { project.elements().keys().cloned().collect() } else { elements };

            let mut config = kiln_config::load_config(
                cli.project_file.parent().unwrap_or_else(|| std::path::Path::new(".")),
            )
            .unwrap_or_default();
            config.apply_env();

            let options = kiln_core::SessionOptions { project_name: cli.project_name.clone(), config };
            let mut session = kiln_core::BuildSession::new(project, options)?;
            let report = session.build(&roots)?;

            for result in &report.results {
                let status = if result.success { "ok" } else { "FAILED" };
                println!("{:<8} {:<20} {status}", result.stage, result.name);
            }
            println!();
            println!("status: {:?} ({} elements, {:?})", report.status, report.results.len(), report.elapsed);

            if !report.failed.is_empty() {
                anyhow::bail!("{} element(s) failed: {}", report.failed.len(), report.failed.join(", "));
            }
        }
    }

    Ok(())
}

fn load_project(path: &PathBuf) -> Result<kiln_core::Project> {
    let text = std::fs::read_to_string(path)?;
    let elements: Vec<kiln_types::Element> = serde_json::from_str(&text)?;
    let mut project = kiln_core::Project::new();
    for element in elements {
        project.insert(element)?;
    }
    Ok(project)
}
