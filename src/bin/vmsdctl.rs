//! vmsdctl - CLI for vmsd
//!
//! Talks to a running vmsd over the session bus. Never starts the service.

use clap::{Parser, Subcommand};
use futures_lite::StreamExt;
use vmsd::config::DEFAULT_BUS_NAME;
use vmsd::{CallOutcome, Client, ClientError, MachineState, Operation};

#[derive(Parser)]
#[command(name = "vmsdctl")]
#[command(about = "Control the vmsd session service")]
struct Args {
    /// Bus name of the service
    #[arg(long, global = true, default_value = DEFAULT_BUS_NAME)]
    bus_name: String,

    /// Send the call without waiting for a reply
    #[arg(long, global = true)]
    no_wait: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Operation(Operation),

    /// List running machines
    List,

    /// Exit 0 if any machine is running
    Active,

    /// Print state changes as they happen
    Watch,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let client = match Client::connect(&args.bus_name).await {
        Ok(client) => client,
        Err(e) => fail(e),
    };

    let result = match args.command {
        Command::Operation(operation) => {
            run_operation(&client, &operation.absolute(), args.no_wait).await
        }
        Command::List => list(&client).await,
        Command::Active => match client.is_active().await {
            Ok(true) => {
                println!("active");
                Ok(())
            }
            Ok(false) => {
                println!("inactive");
                std::process::exit(3);
            }
            Err(e) => Err(e),
        },
        Command::Watch => watch(&client).await,
    };

    if let Err(e) = result {
        fail(e);
    }
}

async fn run_operation(
    client: &Client,
    operation: &Operation,
    no_wait: bool,
) -> Result<(), ClientError> {
    match client.call(operation.method(), &operation.args(), no_wait).await? {
        CallOutcome::Reply(reply) => println!("{}", reply),
        CallOutcome::Sent => {} // Silent success
    }
    Ok(())
}

async fn list(client: &Client) -> Result<(), ClientError> {
    let machines = client.list_machines().await?;
    if machines.is_empty() {
        println!("No machines running");
        return Ok(());
    }
    println!("{:<50} {:>12} {:>27}", "MACHINE", "STATE", "STARTED");
    for machine in machines {
        println!(
            "{:<50} {:>12} {:>27}",
            machine.path, machine.state, machine.started_at
        );
    }
    Ok(())
}

async fn watch(client: &Client) -> Result<(), ClientError> {
    let proxy = client.proxy().await?;
    let mut changes = proxy.receive_machine_state_changed().await?;
    while let Some(signal) = changes.next().await {
        let args = signal.args()?;
        let state = MachineState::from_name(args.state()).map_or(*args.state(), |s| s.text());
        println!("{}: {}", args.path(), state);
    }
    Ok(())
}

fn fail(e: ClientError) -> ! {
    match e {
        ClientError::NotRunning(name) => {
            eprintln!("vmsdctl: service not running ({})", name);
            eprintln!("  start with: vmsd");
        }
        e => eprintln!("vmsdctl: {}", e),
    }
    std::process::exit(1);
}
