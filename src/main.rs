use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use weights_provisioner::core::{logging::setup_logging, settings::Settings};
use weights_provisioner::weights::{self, Manifest, Provisioner};
use weights_provisioner::workflow::WorkflowGraph;

#[derive(Debug, Parser)]
#[command(name = "weights-provisioner", version, about = "Download missing model weights")]
struct Cli {
    /// Settings file; defaults to the per-user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ensure the given weights (and those a workflow references) exist.
    Provision {
        #[arg(long)]
        manifest: PathBuf,
        /// API-format workflow JSON to scan for weight references.
        #[arg(long)]
        workflow: Option<PathBuf>,
        /// Node ids the workflow must contain.
        #[arg(long = "require-node", requires = "workflow")]
        require_nodes: Vec<String>,
        /// CivitAI model list (`[{url, dest, name}]` or `{"LIST": [...]}`).
        #[arg(long)]
        civitai: Option<PathBuf>,
        #[arg(long, env = "CIVITAI_API_TOKEN", hide_env_values = true)]
        civitai_token: Option<String>,
        #[arg(long)]
        models_root: Option<PathBuf>,
        weights: Vec<String>,
    },
    /// List catalogued weights, optionally of one type (`LORAS`, `.pth`).
    List {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Report whether a weight is present in a directory (or at a path).
    Check {
        identifier: String,
        destination: PathBuf,
    },
    /// Print the offline environment for the inference server.
    OfflineEnv,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Provision {
            manifest,
            workflow,
            require_nodes,
            civitai,
            civitai_token,
            models_root,
            weights: requested,
        } => {
            if let Some(root) = models_root {
                settings.models_root = root;
            }
            if civitai_token.is_some() {
                settings.civitai_api_token = civitai_token;
            }

            let manifest = Manifest::from_path(&manifest)
                .with_context(|| format!("load manifest {}", manifest.display()))?
                .install()
                .map_err(|_| anyhow!("manifest already installed"))?;
            let civitai_models = match civitai {
                Some(path) => weights::load_civitai_list(&path)
                    .with_context(|| format!("load civitai list {}", path.display()))?,
                None => Vec::new(),
            };

            let provisioner = Provisioner::from_settings(manifest, &settings)?;
            let report = match workflow {
                Some(path) => {
                    let graph = WorkflowGraph::from_path(&path)
                        .with_context(|| format!("load workflow {}", path.display()))?;
                    let required: Vec<&str> = require_nodes.iter().map(String::as_str).collect();
                    graph.require_nodes(&required)?;
                    provisioner.handle_workflow(&graph, &requested, &civitai_models)?
                }
                None => provisioner.download_weights(&requested, &civitai_models)?,
            };

            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serialize report")?
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::List { manifest, kind } => {
            let manifest = Manifest::from_path(&manifest)
                .with_context(|| format!("load manifest {}", manifest.display()))?;
            let entries: Vec<_> = match kind.as_deref() {
                Some(kind) => manifest.entries_by_type(kind),
                None => manifest.entries().collect(),
            };
            for entry in entries {
                let license = if entry.is_restricted() {
                    "non-commercial"
                } else {
                    "open"
                };
                println!(
                    "{}\t{}\t{}\t{} location(s)",
                    entry.identifier,
                    entry.kind,
                    license,
                    entry.locations.len()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Check {
            identifier,
            destination,
        } => {
            let path = weights::candidate_path(&identifier, &destination);
            if weights::exists(&identifier, &destination) {
                println!("present\t{}", path.display());
                Ok(ExitCode::SUCCESS)
            } else {
                println!("missing\t{}", path.display());
                Ok(ExitCode::FAILURE)
            }
        }
        Command::OfflineEnv => {
            for (key, value) in settings.offline.env_pairs() {
                println!("export {key}={value}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
