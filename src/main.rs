use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod cmd;
mod config;
mod error;
mod session;
mod utils;

use cmd::{DirectMethodArgs, SendArgs, UpdateTwinArgs};
use config::{Config, GlobalArgs};
use error::Error;

/// iothub-device - bridge between an operator and one IoT hub device session.
///
/// Authentication:
///   $DEVICE_CONNECTION_STRING   Shared access key connection string, used unless
///                               both --tls-cert and --tls-key are given
///   --tls-cert / --tls-key      x509 client certificate, needs --device-id and --hostname
///
/// Commands:
///   iothub-device send PAYLOAD [KEY VALUE]... [--mid ID] [--cid ID] [--qos 0|1]
///   iothub-device watch-events
///   iothub-device watch-twin
///   iothub-device direct-method NAME [--quiet]
///   iothub-device twin-state
///   iothub-device update-twin KEY VALUE [KEY VALUE]...   ("null" deletes a key)
///
/// Global flags / env:
///   -v / -vv / -vvv         Increase verbosity
///   --debug                 Debug logging, including the MQTT client
///   --compress              Single-line JSON records
///   --transport NAME        mqtt (default), amqp, http
///   --config PATH           YAML config file (or IOTHUB_DEVICE_CONFIG)
///
/// Examples:
///   iothub-device send '{"temp":21}' unit celsius
///   iothub-device --compress watch-events
///   iothub-device dm reboot --quiet
///   iothub-device update-twin firmware 1.2.0 staging null
#[derive(Parser, Debug)]
#[command(
    name = "iothub-device",
    version,
    author,
    about = "iothub-device - command-line bridge for an IoT hub device session",
    propagate_version = true,
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Enable debug logging, including the MQTT client
    #[arg(long, global = true)]
    debug: bool,

    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a device-to-cloud event
    #[command(visible_alias = "s")]
    Send(SendArgs),

    /// Subscribe to cloud-to-device messages
    #[command(visible_alias = "we")]
    WatchEvents,

    /// Subscribe to desired twin state updates
    #[command(visible_alias = "wt")]
    WatchTwin,

    /// Handle a direct method, answering each call from stdin
    #[command(visible_alias = "dm")]
    DirectMethod(DirectMethodArgs),

    /// Print the current desired and reported twin state
    #[command(visible_alias = "ts")]
    TwinState,

    /// Update reported twin state
    #[command(visible_alias = "ut")]
    UpdateTwin(UpdateTwinArgs),
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Send(_) => "send",
            Commands::WatchEvents => "watch-events",
            Commands::WatchTwin => "watch-twin",
            Commands::DirectMethod(_) => "direct-method",
            Commands::TwinState => "twin-state",
            Commands::UpdateTwin(_) => "update-twin",
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let level = utils::derive_level(cli.verbose, cli.debug);
    utils::init_logging(level, cli.debug);

    let name = cli.command.name();
    if let Err(err) = run(cli) {
        std::process::exit(report(name, &err));
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::from_args(&cli.global)?;
    debug!(?config, "configuration resolved");

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let cancel = CancellationToken::new();

    let outcome = rt.block_on(async {
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted");
                interrupt.cancel();
            }
        });

        tokio::select! {
            res = dispatch(cli.command, &config, &cancel) => res,
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    });

    // A pending stdin read lives on a blocking thread; do not wait for it.
    rt.shutdown_background();
    Ok(outcome?)
}

async fn dispatch(
    command: Commands,
    config: &Config,
    cancel: &CancellationToken,
) -> error::Result<()> {
    match command {
        Commands::Send(args) => cmd::execute_send(args, config).await,
        Commands::WatchEvents => cmd::execute_watch_events(config, cancel).await,
        Commands::WatchTwin => cmd::execute_watch_twin(config, cancel).await,
        Commands::DirectMethod(args) => cmd::execute_direct_method(args, config, cancel).await,
        Commands::TwinState => cmd::execute_twin_state(config).await,
        Commands::UpdateTwin(args) => cmd::execute_update_twin(args, config).await,
    }
}

/// Print `err` once and return the exit status.
fn report(command: &str, err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(Error::InvalidUsage(msg)) => {
            let mut cli = Cli::command();
            cli.build();
            // Render against the subcommand so its usage line is shown.
            let mut target = cli.find_subcommand(command).cloned().unwrap_or(cli);
            let usage = target.error(ErrorKind::WrongNumberOfValues, msg);
            let _ = usage.print();
            usage.exit_code()
        }
        Some(err) => {
            eprintln!("error: {err}");
            1
        }
        None => {
            eprintln!("error: {err:#}");
            1
        }
    }
}
