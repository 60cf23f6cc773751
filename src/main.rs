//! Steno CLI

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use steno::config::{Config, Mode};
use steno::controller::{stdout_printer, Controller};
use steno::hooks::Hooks;
use steno::StenoError;

#[derive(Parser)]
#[command(
    name = "steno",
    version,
    about = "Record and replay HTTP traffic between an application and an external service"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Record scenarios through both proxies
    Record(RecordArgs),
    /// Replay a recorded scenario
    Replay(ReplayArgs),
}

#[derive(Args)]
struct RecordArgs {
    /// Base URL of the application; incoming requests are sent to it
    app_base_url: String,

    /// Base URL of the external service; outgoing requests are sent to it
    #[arg(long)]
    out_target_url: Option<String>,

    /// Port receiving the external service's requests
    #[arg(long)]
    in_port: Option<u16>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct ReplayArgs {
    /// Base URL of the application; recorded incoming requests are sent to it
    app_base_url: String,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct CommonArgs {
    /// Port serving the control API
    #[arg(long)]
    control_port: Option<u16>,

    /// Port receiving the application's requests
    #[arg(long)]
    out_port: Option<u16>,

    /// Scenario active at startup
    #[arg(long)]
    scenario_name: Option<String>,

    /// Directory holding the scenarios
    #[arg(long)]
    scenario_dir: Option<PathBuf>,
}

impl CommonArgs {
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.control_port {
            config.control_port = port;
        }
        if let Some(port) = self.out_port {
            config.outgoing_port = port;
        }
        if let Some(name) = self.scenario_name {
            config.scenario_name = name;
        }
        if let Some(dir) = self.scenario_dir {
            config.scenario_dir = dir;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "steno=debug" } else { "steno=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(cli: Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Record(args) => {
            config.mode = Mode::Record;
            config.incoming_target_url = Some(args.app_base_url);
            if let Some(url) = args.out_target_url {
                config.outgoing_target_url = Some(url);
            }
            if let Some(port) = args.in_port {
                config.incoming_port = port;
            }
            args.common.apply(&mut config);
        }
        Commands::Replay(args) => {
            config.mode = Mode::Replay;
            config.incoming_target_url = Some(args.app_base_url);
            args.common.apply(&mut config);
        }
    }

    Ok(config)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let hooks = Hooks::from_config(&config.host_rewrites, &config.redaction);
    let controller = Arc::new(Controller::new(config, hooks, stdout_printer())?);
    let _server = controller.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutting down");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Bind conflicts already name the option to change
            if !matches!(
                e.downcast_ref::<StenoError>(),
                Some(StenoError::PortInUse { .. })
            ) {
                error!("Startup failed");
            }
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
