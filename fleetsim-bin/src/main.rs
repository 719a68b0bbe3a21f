mod catalog;

use catalog::Catalog;
use clap::{Parser, Subcommand};
use fleetsim_common::AppContext;
use fleetsim_error::FSResult;
use std::{path::PathBuf, time::Duration};
use tracing::info;

/// fleetsim - IoT device fleet simulator
///
/// Provisions fleets of virtual devices against a cloud IoT application and
/// drives their telemetry, property and command traffic in waves.
#[derive(Parser)]
#[command(name = "fleetsim")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "IoT device fleet simulator", long_about = None)]
struct Cli {
    /// Sets a custom config file with full path
    ///
    /// If not specified, 'fleetsim.toml' in the current working directory is
    /// used when present.
    #[arg(short, long, env = "FLEETSIM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load targets, device models, simulations and device configs from a JSON file
    Import { path: PathBuf },
    /// Run a simulation until interrupted or until the duration elapses
    Run {
        simulation_id: String,
        /// Seconds to run before stopping
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Resize the provisioned population of a device model
    Provision {
        simulation_id: String,
        model_id: String,
        count: usize,
    },
    /// Delete every device of a simulation from its target application
    Delete { simulation_id: String },
    /// List simulations with their status and device configs
    Status,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> FSResult<()> {
    let cli = Cli::parse();
    let config_path = cli.config.map(|p| p.to_string_lossy().to_string());

    let ctx = AppContext::init(config_path.as_deref()).await?;
    ctx.run(execute(&ctx, cli.command)).await
}

async fn execute(ctx: &AppContext, command: Command) -> FSResult<()> {
    match command {
        Command::Import { path } => Catalog::load(&path).await?.import(ctx.stores()).await,
        Command::Run {
            simulation_id,
            duration,
        } => {
            let controller = ctx.controller();
            controller.start_simulation(&simulation_id).await?;
            match duration {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending::<()>().await,
            }
            controller.stop_simulation(&simulation_id).await
        }
        Command::Provision {
            simulation_id,
            model_id,
            count,
        } => {
            let outcome = ctx
                .controller()
                .resize(&simulation_id, &model_id, count)
                .await?;
            info!(
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                "Fleet resized"
            );
            Ok(())
        }
        Command::Delete { simulation_id } => {
            let outcome = ctx.controller().delete_all_devices(&simulation_id).await?;
            info!(
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                "Fleet deleted"
            );
            Ok(())
        }
        Command::Status => {
            let stores = ctx.stores();
            for simulation in stores.list_simulations().await? {
                let configs = stores.list_device_configs(&simulation.id).await?;
                let devices: Vec<String> = configs
                    .iter()
                    .map(|c| format!("{}={}", c.model_id, c.device_count))
                    .collect();
                println!(
                    "{}\t{:?}\t{}\t{}",
                    simulation.id,
                    simulation.status,
                    simulation.target_id,
                    devices.join(",")
                );
            }
            Ok(())
        }
    }
}
