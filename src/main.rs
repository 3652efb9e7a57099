use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use certsuite_operator::config::{self, OperatorConfig};
use certsuite_operator::crd::CertSuiteRun;

#[derive(Parser)]
#[command(
    name = "certsuite-operator",
    about = "Runs the CNF certification suite for CnfCertificationSuiteRun objects",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true, env = config::CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller, the run watcher and the probe endpoints
    Serve {
        /// Listen address for the HTTP endpoints
        #[arg(long)]
        listen: Option<String>,

        /// Namespace to watch for runs
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Wait for the suite's claim file and store its report (sidecar mode)
    Harvest,

    /// Print the execution unit that would be created for a run manifest
    RenderPod {
        /// Run manifest (JSON)
        #[arg(long)]
        run: PathBuf,

        /// Pod name to use
        #[arg(long, default_value = "cnf-job-run-1")]
        pod_name: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<OperatorConfig> {
    match path {
        Some(path) => {
            let mut cfg = OperatorConfig::load(path)?;
            cfg.apply_env();
            Ok(cfg)
        }
        None => Ok(OperatorConfig::load_or_default()),
    }
}

fn init_tracing(cfg: &config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout is reserved for command output
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.as_ref())?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Serve { listen, namespace } => {
            if let Some(listen) = listen {
                cfg.http.listen_address = listen;
            }
            if let Some(namespace) = namespace {
                cfg.controller.namespace = namespace;
            }
            tracing::info!(
                namespace = %cfg.controller.namespace,
                sidecar_image = %cfg.controller.sidecar_image,
                "starting certsuite-operator"
            );
            certsuite_operator::serve(cfg).await?;
        }
        Commands::Harvest => {
            tracing::info!("starting harvester");
            certsuite_operator::harvest(cfg).await?;
        }
        Commands::RenderPod { run, pod_name } => {
            let content = std::fs::read_to_string(&run)
                .with_context(|| format!("failed to read run manifest: {}", run.display()))?;
            let manifest: CertSuiteRun = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse run manifest: {}", run.display()))?;
            let pod = certsuite_operator::render_pod(&manifest, &pod_name, &cfg)?;
            println!("{}", serde_json::to_string_pretty(&pod)?);
        }
    }

    Ok(())
}
