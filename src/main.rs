//! akp - drive the Akuity Platform controllers from the command line
//!
//! Each subcommand runs one controller operation. Declared and prior state
//! are read from YAML or JSON files; the resulting state and diagnostics are
//! printed to stdout as JSON.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use akp::controller::{AgentController, IpAllowListController};
use akp::{Agent, IpAllowList, Outcome, Provider, ProviderConfig};
use akp_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use akp_common::{CallContext, Diagnostics, ENV_API_KEY_ID, ENV_API_KEY_SECRET, ENV_SERVER_URL};

/// akp - declarative control-plane adapter for the Akuity Platform
#[derive(Parser, Debug)]
#[command(name = "akp", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    provider: ProviderArgs,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Pretty, global = true)]
    log_format: LogFormatArg,

    /// Overall deadline for the operation in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

/// Provider settings; each flag falls back to its environment variable
#[derive(Args, Debug)]
struct ProviderArgs {
    /// Platform URL
    #[arg(long, env = ENV_SERVER_URL, global = true)]
    server_url: Option<String>,

    /// Organization name
    #[arg(long, env = "AKUITY_ORG_NAME", global = true)]
    org_name: Option<String>,

    /// API key id
    #[arg(long, env = ENV_API_KEY_ID, global = true)]
    api_key_id: Option<String>,

    /// API key secret
    #[arg(long, env = ENV_API_KEY_SECRET, hide_env_values = true, global = true)]
    api_key_secret: Option<String>,

    /// Accept self-signed platform certificates
    #[arg(long, global = true)]
    skip_tls_verify: bool,
}

impl From<ProviderArgs> for ProviderConfig {
    fn from(args: ProviderArgs) -> Self {
        Self {
            server_url: args.server_url,
            org_name: args.org_name,
            api_key_id: args.api_key_id,
            api_key_secret: args.api_key_secret,
            skip_tls_verify: args.skip_tls_verify,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage IP allow-list resources
    #[command(subcommand)]
    IpAllowList(ResourceCommand),

    /// Manage Kargo agents
    #[command(subcommand)]
    Agent(ResourceCommand),

    /// Inspect instances
    #[command(subcommand)]
    Instance(InstanceCommand),
}

#[derive(Subcommand, Debug)]
enum ResourceCommand {
    /// Show what applying a declaration would do
    Plan {
        /// Declared resource
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Current state, if the resource exists
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Create the declared resource
    Create {
        /// Declared resource
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Refresh state from the platform
    Read {
        /// Current state
        #[arg(long)]
        state: PathBuf,
    },
    /// Update the resource in place
    Update {
        /// Declared resource
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Current state
        #[arg(long)]
        state: PathBuf,
    },
    /// Delete the resource
    Delete {
        /// Current state
        #[arg(long)]
        state: PathBuf,
        /// Declared resource; supplies the agent kubeconfig used to remove
        /// cluster resources
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
    },
    /// Adopt an existing resource
    ///
    /// IP allow lists are imported by instance id, agents by
    /// `instance_id/name`.
    Import {
        /// Import id
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum InstanceCommand {
    /// Export an instance with all of its declarative resources
    Export {
        /// Instance id
        instance_id: String,
    },
}

/// Printed result of one controller operation
#[derive(Serialize)]
struct Report<T> {
    state: Option<T>,
    tainted: bool,
    diagnostics: Diagnostics,
}

impl<T> From<Outcome<T>> for Report<T> {
    fn from(outcome: Outcome<T>) -> Self {
        Self {
            state: outcome.state,
            tainted: outcome.tainted,
            diagnostics: outcome.diagnostics,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        filter: None,
    }) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the selected command; `Ok(false)` means the operation reported errors
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight calls");
            on_signal.cancel();
        }
    });

    let root = CallContext::with_token(cancel);
    let ctx = match cli.timeout_secs {
        Some(secs) => root.with_timeout(Duration::from_secs(secs)),
        None => root,
    };

    // Planning is local; no platform connection needed
    if let Commands::IpAllowList(ResourceCommand::Plan { file, state }) = &cli.command {
        let desired: IpAllowList = read_document(file)?;
        let state = state
            .as_deref()
            .map(read_document::<IpAllowList>)
            .transpose()?;
        print_json(&IpAllowListController::plan(state.as_ref(), &desired))?;
        return Ok(true);
    }
    if let Commands::Agent(ResourceCommand::Plan { file, state }) = &cli.command {
        let desired: Agent = read_document(file)?;
        let state = state.as_deref().map(read_document::<Agent>).transpose()?;
        print_json(&AgentController::plan(state.as_ref(), &desired))?;
        return Ok(true);
    }

    let provider = Provider::connect(&ctx, &cli.provider.into())
        .await
        .context("failed to connect to the Akuity Platform")?;

    match cli.command {
        Commands::IpAllowList(command) => {
            run_ip_allow_list(&ctx, provider.ip_allow_lists(), command).await
        }
        Commands::Agent(command) => run_agent(&ctx, provider.agents(), command).await,
        Commands::Instance(InstanceCommand::Export { instance_id }) => {
            let exported = provider
                .export_instance(&ctx, &instance_id)
                .await
                .with_context(|| format!("failed to export instance {instance_id}"))?;
            print_json(&exported)?;
            Ok(true)
        }
    }
}

async fn run_ip_allow_list(
    ctx: &CallContext,
    controller: IpAllowListController,
    command: ResourceCommand,
) -> anyhow::Result<bool> {
    let outcome = match command {
        ResourceCommand::Plan { .. } => return Ok(true),
        ResourceCommand::Create { file } => {
            let plan: IpAllowList = read_document(&file)?;
            controller.create(ctx, &plan).await
        }
        ResourceCommand::Read { state } => {
            let state: IpAllowList = read_document(&state)?;
            controller.read(ctx, &state).await
        }
        ResourceCommand::Update { file, state } => {
            let plan: IpAllowList = read_document(&file)?;
            let state: IpAllowList = read_document(&state)?;
            controller.update(ctx, &state, &plan).await
        }
        ResourceCommand::Delete { state, .. } => {
            let state: IpAllowList = read_document(&state)?;
            controller.delete(ctx, &state).await
        }
        ResourceCommand::Import { id } => controller.import(ctx, &id).await,
    };
    report(outcome)
}

async fn run_agent(
    ctx: &CallContext,
    controller: AgentController,
    command: ResourceCommand,
) -> anyhow::Result<bool> {
    let outcome = match command {
        ResourceCommand::Plan { .. } => return Ok(true),
        ResourceCommand::Create { file } => {
            let plan: Agent = read_document(&file)?;
            controller.create(ctx, &plan).await
        }
        ResourceCommand::Read { state } => {
            let state: Agent = read_document(&state)?;
            controller.read(ctx, &state).await
        }
        ResourceCommand::Update { file, state } => {
            let plan: Agent = read_document(&file)?;
            let state: Agent = read_document(&state)?;
            controller.update(ctx, &state, &plan).await
        }
        ResourceCommand::Delete { state, file } => {
            let mut state: Agent = read_document(&state)?;
            if let Some(file) = file {
                let declared: Agent = read_document(&file)?;
                state = state.with_declared_kube_config(&declared);
            }
            controller.delete(ctx, &state).await
        }
        ResourceCommand::Import { id } => controller.import(ctx, &id).await,
    };
    report(outcome)
}

fn report<T: Serialize>(outcome: Outcome<T>) -> anyhow::Result<bool> {
    for diagnostic in outcome.diagnostics.iter() {
        eprintln!("{diagnostic}");
    }
    let ok = !outcome.is_err();
    print_json(&Report::from(outcome))?;
    Ok(ok)
}

/// Read a YAML or JSON document
fn read_document<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}
