use std::{path::PathBuf, process::exit};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::info;
use port_blocker_common::{BLOCKED_PORT_MAP, DEFAULT_OBJECT_FILE, DEFAULT_PIN_PATH};
use serde_json::{Map as JsonMap, Number as JsonNumber, Value};

mod attach;
mod config;
mod error;
mod kernel;
mod lifecycle;
mod loader;
mod orchestrator;
mod rlimit;
mod table;

use config::{Config, SelectionPolicy, XdpMode};
use kernel::{AyaKernel, Kernel};
use lifecycle::ShutdownSignal;
use orchestrator::Outcome;
use table::filtered_port;

#[derive(Parser)]
#[command(name = "port-blocker")]
#[command(about = "Drop TCP traffic to or from one port with an XDP program", long_about = None)]
#[command(args_conflicts_with_subcommands = true, arg_required_else_help = true)]
struct Cli {
    #[command(flatten)]
    image: ImageArgs,
    /// Port to drop; `port-blocker PORT` is the same as `port-blocker hold PORT`
    #[arg(value_name = "PORT", value_parser = port_arg)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    /// The subcommand to run, with a bare port standing for `hold`.
    fn into_command(self) -> Option<(ImageArgs, Commands)> {
        let command = match (self.command, self.port) {
            (Some(command), _) => command,
            (None, Some(port)) => Commands::Hold(PortArg { port }),
            (None, None) => return None,
        };
        Some((self.image, command))
    }
}

#[derive(Args)]
struct ImageArgs {
    /// Compiled XDP object to load when no pinned table is found
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_OBJECT_FILE)]
    object: PathBuf,
    /// Where the control table is pinned for later invocations
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_PIN_PATH)]
    pin_path: PathBuf,
    /// Attach this program instead of scanning for the XDP one
    #[arg(long, global = true, value_name = "NAME")]
    program: Option<String>,
    /// XDP attach mode
    #[arg(long, global = true, value_enum, default_value_t = XdpMode::Auto)]
    xdp_mode: XdpMode,
    /// What to do when the image holds several XDP programs
    #[arg(long, global = true, value_enum, default_value_t = SelectionPolicy::LastSeenWins)]
    on_multiple: SelectionPolicy,
}

#[derive(Subcommand)]
enum Commands {
    /// Block a port, updating the pinned table or loading the program
    Set(PortArg),
    /// Load and attach the program, then hold it until SIGINT/SIGTERM
    Hold(PortArg),
    /// Print the port the pinned table currently blocks
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct PortArg {
    /// Port to drop, 1-65535
    #[arg(value_name = "PORT", value_parser = port_arg)]
    port: u16,
}

fn port_arg(input: &str) -> Result<u16, String> {
    config::parse_port(input).map_err(|err| err.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        eprintln!("port-blocker error: {err:#}");
        if let Some(hint) = err.downcast_ref::<error::Error>().and_then(error::Error::hint) {
            eprintln!("hint: {hint}");
        }
        exit(1);
    }
}

async fn run() -> Result<()> {
    let Some((image, command)) = Cli::parse().into_command() else {
        bail!("a port or a subcommand is required; see --help");
    };
    let cfg = Config {
        object_path: image.object,
        pin_path: image.pin_path,
        program: image.program,
        xdp_mode: image.xdp_mode,
        selection: image.on_multiple,
        ..Config::default()
    };
    let mut kernel = AyaKernel;

    match command {
        Commands::Set(PortArg { port }) => match orchestrator::configure(&mut kernel, &cfg, port)? {
            Outcome::Reused => info!("now blocking port {port}"),
            Outcome::Bootstrapped { pinned: true } => {
                info!("now blocking port {port}; table pinned at {}", cfg.pin_path.display())
            }
            Outcome::Bootstrapped { pinned: false } => {
                info!("now blocking port {port}; table not pinned, later runs will reload the image")
            }
        },
        Commands::Hold(PortArg { port }) => {
            let shutdown = ShutdownSignal::install()?;
            lifecycle::hold(&mut kernel, &cfg, port, shutdown.recv()).await?;
        }
        Commands::Status { json } => {
            let table = kernel
                .open_pinned_table(BLOCKED_PORT_MAP, &cfg.pin_path)
                .context("no control table is pinned; run `port-blocker set <PORT>` first")?;
            let port = filtered_port(&table)?;
            if json {
                println!("{}", status_json(&cfg.pin_path, port));
            } else {
                match port {
                    Some(port) => println!("blocking port {port} ({})", cfg.pin_path.display()),
                    None => println!("no port blocked ({})", cfg.pin_path.display()),
                }
            }
        }
    }

    Ok(())
}

fn status_json(pin_path: &std::path::Path, port: Option<u16>) -> Value {
    let mut obj = JsonMap::new();
    obj.insert(
        "pin_path".to_string(),
        Value::String(pin_path.display().to_string()),
    );
    obj.insert(
        "port".to_string(),
        port.map_or(Value::Null, |p| Value::Number(JsonNumber::from(p))),
    );
    Value::Object(obj)
}
