//! castd: the cast agent binary.
//!
//! `castd run` starts the agent and waits for Ctrl-C. The other
//! subcommands build the agent, drive one operation through its job
//! queues and print the outcome as JSON.
//!
//! ```text
//! castd --config /etc/cast/agent.toml bundles add fooapp 1.0 fooapp.tar.gz
//! castd instances create foo0 fooapp 1.0
//! ```

use std::path::PathBuf;

use anyhow::Context;
use cast_core::{AgentConfig, BundleId};
use cast_deploy::ServiceAction;
use cast_jobs::{JobHandle, JobSnapshot};
use castd::Agent;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "castd", about = "Cast deployment agent", version)]
struct Cli {
    /// Agent configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured data root.
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the agent and run until interrupted.
    Run,
    /// Application bundles.
    Bundles {
        #[command(subcommand)]
        action: BundleAction,
    },
    /// Deployed instances.
    Instances {
        #[command(subcommand)]
        action: InstanceAction,
    },
    /// Certificate authority.
    Ca {
        #[command(subcommand)]
        action: CaAction,
    },
    /// Supervised services.
    Services,
}

#[derive(Subcommand)]
enum BundleAction {
    /// Upload a bundle tarball.
    Add {
        app: String,
        version: String,
        file: PathBuf,
        /// Expected hex SHA-1 of the tarball.
        #[arg(long)]
        sha1: Option<String>,
    },
    /// List applications and their bundle versions.
    List,
    /// Remove a bundle.
    Remove { app: String, version: String },
}

#[derive(Subcommand)]
enum InstanceAction {
    /// Create an instance from an uploaded bundle.
    Create {
        name: String,
        bundle: String,
        version: String,
    },
    /// Move an instance to another version of its bundle.
    Upgrade { name: String, version: String },
    /// Delete an instance and its services.
    Delete { name: String },
    /// Remove inactive versions.
    Cleanup { name: String },
    /// Show one instance.
    Show { name: String },
    /// List instances.
    List,
    /// Control an instance's active service.
    Service {
        name: String,
        #[arg(value_parser = ["enable", "disable", "start", "stop", "restart"])]
        action: String,
    },
}

#[derive(Subcommand)]
enum CaAction {
    /// List signing requests.
    List,
    /// Submit a signing request from a PEM file.
    Add { name: String, csr: PathBuf },
    /// Sign a pending request.
    Sign {
        name: String,
        /// Replace an existing certificate.
        #[arg(long)]
        overwrite: bool,
    },
    /// Delete a request and its certificate.
    Delete { name: String },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,castd=debug,cast=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(root) = &cli.data_root {
        config.data_root = root.clone();
    }
    Ok(config)
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for the job and print its snapshot. Fails if the job did.
async fn finish(handle: JobHandle) -> anyhow::Result<()> {
    let outcome = handle.wait().await;
    let snapshot: JobSnapshot = handle.snapshot();
    print_json(&snapshot)?;
    outcome?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(&cli)?;
    let agent = Agent::init(config).await.context("initializing agent")?;

    match cli.command {
        Command::Run => run(agent).await,
        Command::Bundles { action } => bundles(&agent, action).await,
        Command::Instances { action } => instances(&agent, action).await,
        Command::Ca { action } => ca(&agent, action).await,
        Command::Services => print_json(&agent.instances.list_services().await?),
    }
}

async fn run(agent: Agent) -> anyhow::Result<()> {
    info!(data_root = ?agent.config.data_root, "cast agent running");
    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!(jobs = agent.jobs.list_jobs().len(), "shutdown signal received");
    Ok(())
}

async fn bundles(agent: &Agent, action: BundleAction) -> anyhow::Result<()> {
    match action {
        BundleAction::Add {
            app,
            version,
            file,
            sha1,
        } => {
            let stream = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            if sha1.is_none() {
                warn!("no checksum given, upload will not be verified");
            }
            let handle = agent.bundles.add_bundle(
                BundleId::new(app, version),
                Box::new(stream),
                sha1.map(cast_bundles::expect_sha1),
            )?;
            finish(handle).await
        }
        BundleAction::List => print_json(&agent.bundles.list_applications().await?),
        BundleAction::Remove { app, version } => {
            finish(agent.bundles.remove_bundle(BundleId::new(app, version))?).await
        }
    }
}

async fn instances(agent: &Agent, action: InstanceAction) -> anyhow::Result<()> {
    let instances = &agent.instances;
    match action {
        InstanceAction::Create {
            name,
            bundle,
            version,
        } => finish(instances.create_instance(&name, BundleId::new(bundle, version))?).await,
        InstanceAction::Upgrade { name, version } => {
            finish(instances.upgrade_instance(&name, &version)?).await
        }
        InstanceAction::Delete { name } => finish(instances.delete_instance(&name)?).await,
        InstanceAction::Cleanup { name } => finish(instances.cleanup_instance(&name)?).await,
        InstanceAction::Show { name } => print_json(&instances.get_instance(&name).await?),
        InstanceAction::List => print_json(&instances.list_instances().await?),
        InstanceAction::Service { name, action } => {
            let action: ServiceAction = action.parse()?;
            finish(instances.service_action(&name, action)?).await
        }
    }
}

async fn ca(agent: &Agent, action: CaAction) -> anyhow::Result<()> {
    match action {
        CaAction::List => print_json(&agent.ca.list_requests().await?),
        CaAction::Add { name, csr } => {
            let text = tokio::fs::read_to_string(&csr)
                .await
                .with_context(|| format!("reading {}", csr.display()))?;
            finish(agent.ca.create_request(&name, text)?).await
        }
        CaAction::Sign { name, overwrite } => finish(agent.ca.sign_request(&name, overwrite)?).await,
        CaAction::Delete { name } => finish(agent.ca.delete_request(&name)?).await,
    }
}
