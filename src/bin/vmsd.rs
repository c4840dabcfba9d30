//! vmsd - VM session service
//!
//! Owns `org.vmsd.Session` on the session bus and manages emulated machines.
//!
//! Given an operation (`vmsd start vm1.vm`), the first instance becomes the
//! service and runs the operation itself. Any later instance forwards the
//! operation to the running service, prints the reply and exits.

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;

use vmsd::config::{self, Settings};
use vmsd::{CallOutcome, Client, ClientError, DuplicateStart, Operation, SessionService};

/// How long a forwarding instance waits for a starting service to own its name
const NAME_WAIT_ATTEMPTS: u32 = 10;
const NAME_WAIT_DELAY: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "vmsd")]
#[command(about = "VM session service")]
#[command(
    long_about = "vmsd owns a name on the D-Bus session bus and dispatches VM operations \
    to the machines it started. A second vmsd forwards its operation to the running one."
)]
struct Args {
    /// Settings file (default: $XDG_CONFIG_HOME/vmsd/vmsd.conf)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Session bus name to own
    #[arg(long)]
    bus_name: Option<String>,

    /// Keep running after the last machine powers off
    #[arg(long)]
    resident: bool,

    /// What to do when a machine file is started twice (allow, reject, merge)
    #[arg(long)]
    duplicate_start: Option<DuplicateStart>,

    #[command(subcommand)]
    operation: Option<Operation>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings_path = args.config.clone().or_else(config::default_path);
    let mut settings = match &settings_path {
        Some(path) => match Settings::load(path).await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("vmsd: {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Settings::default(),
    };

    if let Some(name) = args.bus_name {
        settings.bus_name = name;
    }
    if args.resident {
        settings.resident = true;
    }
    if let Some(policy) = args.duplicate_start {
        settings.duplicate_start = policy;
    }

    let bus_name = settings.bus_name.clone();
    let service = match SessionService::init(settings, settings_path).await {
        Ok(service) => service,
        Err(e) => {
            eprintln!("vmsd: {}", e);
            std::process::exit(1);
        }
    };

    let operation = args.operation.map(Operation::absolute);

    let Some(service) = service else {
        match operation {
            Some(operation) => forward(&bus_name, &operation).await,
            None => info!("vmsd is already running"),
        }
        return;
    };

    if let Some(operation) = operation {
        let handle = service.handle();
        tokio::spawn(async move {
            match handle.run_startup(operation).await {
                Ok(reply) => info!("{}", reply),
                Err(e) => log::error!("{}", e),
            }
        });
    }

    match service.run().await {
        Ok(exit) => log::debug!("exit: {:?}", exit),
        Err(e) => {
            eprintln!("vmsd: {}", e);
            std::process::exit(1);
        }
    }
}

/// Hand `operation` to the running service and print its reply
async fn forward(bus_name: &str, operation: &Operation) {
    let client = match Client::connect(bus_name).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("vmsd: {}", e);
            std::process::exit(1);
        }
    };

    // The guard holder may still be registering its name
    let mut attempts = 0;
    let result = loop {
        match client.call(operation.method(), &operation.args(), false).await {
            Err(ClientError::NotRunning(_)) if attempts < NAME_WAIT_ATTEMPTS => {
                attempts += 1;
                tokio::time::sleep(NAME_WAIT_DELAY).await;
            }
            result => break result,
        }
    };

    match result {
        Ok(CallOutcome::Reply(reply)) => println!("Reply was: {}", reply),
        Ok(CallOutcome::Sent) => {}
        Err(e) => {
            eprintln!("vmsd: {}", e);
            std::process::exit(1);
        }
    }
}
