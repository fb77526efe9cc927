//! Converge - Standalone Binary
//!
//! Drives the staged convergence of the Oracle CDC -> Tableflow -> Unity
//! Catalog stack. Run `converge apply` once to reserve both linking roles,
//! then again with `--enable-link` to connect the platforms.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lakehouse_converge::agents::convergence::{
    JsonFileOutputs, MemoryOutputs, OutputStore, StackConfig, StageCoordinator,
};
use lakehouse_converge::agents::lifecycle::{ProcessInvoker, ScriptInvoker, SimulatedInvoker};
use lakehouse_converge::agents::platforms::{
    AwsCliPlatform, ConfluentPlatform, DatabricksPlatform, Platforms,
};

/// Converge - staged AWS / Confluent Cloud / Databricks linking
#[derive(Parser, Debug)]
#[command(name = "converge", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// JSON stack configuration
    #[arg(long, global = true, env = "CONVERGE_CONFIG")]
    config: Option<PathBuf>,

    /// Durable outputs file
    #[arg(long, global = true, default_value = ".converge/outputs.json", env = "CONVERGE_OUTPUTS")]
    outputs: PathBuf,

    /// Use in-memory platforms; nothing outside the process is touched
    #[arg(long, global = true, default_value = "false")]
    simulate: bool,

    /// Allow the stage-two link pass once both roles exist
    #[arg(long, global = true, default_value = "false")]
    enable_link: bool,

    /// Resource name prefix (overrides the config file)
    #[arg(long, global = true, env = "RESOURCE_PREFIX")]
    prefix: Option<String>,

    /// AWS region (overrides the config file)
    #[arg(long, global = true, env = "AWS_REGION")]
    region: Option<String>,

    /// AWS CLI profile
    #[arg(long, global = true, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// `aws` executable to drive (defaults to the one on PATH)
    #[arg(long, global = true, env = "AWS_CLI_PATH")]
    aws_cli: Option<String>,

    /// Databricks workspace host (overrides the config file)
    #[arg(long, global = true, env = "DATABRICKS_HOST")]
    databricks_host: Option<String>,

    /// Password of the CDC capture database user
    #[arg(long, global = true, env = "CFLT_USER_PASSWORD", hide_env_values = true)]
    cflt_user_password: Option<String>,

    /// Debug logging
    #[arg(long, short, global = true, default_value = "false")]
    verbose: bool,

    #[arg(long, global = true, value_enum, default_value = "json")]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Foundation pass, stage decision, then bootstrap or link
    Apply,
    /// Print the detected stage without changing anything
    Stage,
    /// List exported outputs (secrets masked)
    Outputs,
    /// Remove the catalog integration through its delete command
    DetachCatalog,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;

    // Simulated runs never touch the real outputs file
    let mut outputs: Box<dyn OutputStore> = if args.simulate {
        Box::new(MemoryOutputs::new())
    } else {
        Box::new(
            JsonFileOutputs::load(&args.outputs)
                .with_context(|| format!("Failed to open outputs at {}", args.outputs.display()))?,
        )
    };

    if let Command::Outputs = args.command {
        for key in outputs.keys() {
            if let Some(value) = outputs.get(&key) {
                println!("{} = {}", key, value.display());
            }
        }
        return Ok(());
    }

    info!(
        prefix = %config.resource_prefix,
        region = %config.region,
        simulate = args.simulate,
        enable_link = config.enable_link,
        "Starting converge"
    );

    let coordinator = build_coordinator(&args, config)?;

    match args.command {
        Command::Apply => {
            let report = coordinator
                .converge(outputs.as_mut())
                .await
                .context("Convergence run failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stage => {
            let stage = coordinator
                .determine_stage()
                .await
                .context("Failed to determine stage")?;
            println!("{}", stage);
        }
        Command::DetachCatalog => {
            let output = coordinator
                .detach_catalog(outputs.as_mut())
                .await
                .context("Failed to detach catalog integration")?;
            info!(id = %output.id, "Detach complete");
        }
        Command::Outputs => {}
    }

    Ok(())
}

fn init_logging(args: &Args) {
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match args.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

/// Config file (or defaults) with command-line overrides applied
fn load_config(args: &Args) -> Result<StackConfig> {
    let mut config = StackConfig::load(args.config.as_deref()).context("Failed to load stack config")?;

    if let Some(prefix) = &args.prefix {
        config.resource_prefix = prefix.clone();
    }
    if let Some(region) = &args.region {
        config.region = region.clone();
    }
    if let Some(host) = args.databricks_host.as_ref().filter(|h| !h.is_empty()) {
        config.dbx.host = Some(host.clone());
    }
    if let Some(password) = &args.cflt_user_password {
        config.rds.cflt_user_password = Some(password.clone());
    }
    if args.enable_link {
        config.enable_link = true;
    }

    config.validate().context("Invalid stack config")?;
    Ok(config)
}

fn build_coordinator(args: &Args, config: StackConfig) -> Result<StageCoordinator> {
    if args.simulate {
        info!("Simulation mode - using in-memory platforms");
        let platforms = Platforms::simulated(&config.region);
        let scripts: Arc<dyn ScriptInvoker> = Arc::new(SimulatedInvoker::new());
        return Ok(StageCoordinator::new(config, platforms, scripts));
    }

    let aws = AwsCliPlatform::new(&config.region)
        .with_profile(args.profile.clone())
        .with_binary(args.aws_cli.clone());
    let streaming = ConfluentPlatform::from_env().context("Failed to initialize Confluent Cloud client")?;
    let lakehouse = DatabricksPlatform::from_env(config.dbx.host.as_deref())
        .context("Failed to initialize Databricks client")?;

    let platforms = Platforms::new(Arc::new(aws), Arc::new(streaming), Arc::new(lakehouse));
    Ok(StageCoordinator::new(config, platforms, Arc::new(ProcessInvoker)))
}
