use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpool::store::RedisStore;
use dhcpool::{Config, DhcpServer, LeaseAllocator, Reaper, Result, Store};

#[derive(Parser)]
#[command(name = "dhcpool")]
#[command(author, version, about = "A replica-safe DHCP server backed by a shared store", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCP requests (the default).
    Run,
    /// Print the effective configuration.
    ShowConfig,
    /// Write a fresh all-zeros availability bitset to the store.
    InitPool,
    /// Delete the bitset, the time index, and every binding.
    Reset,
}

async fn connect_allocator(config: &Config) -> Result<Arc<LeaseAllocator>> {
    let store = RedisStore::connect(&config.store_host, config.store_port).await?;
    Ok(Arc::new(LeaseAllocator::new(
        Arc::new(store) as Arc<dyn Store>,
        config,
    )?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);

            let allocator = connect_allocator(&config).await?;
            if allocator.ensure_pool().await? {
                info!(
                    "Initialized availability bitset for {} addresses",
                    config.pool_size
                );
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let reaper = Reaper::new(
                Arc::clone(&allocator),
                config.reap_interval(),
                shutdown_rx,
            );
            let reaper_task = tokio::spawn(reaper.run());

            let server = DhcpServer::new(config, allocator).await?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    let _ = shutdown_tx.send(true);
                    let _ = reaper_task.await;
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::InitPool => {
            let allocator = connect_allocator(&config).await?;
            allocator.init_pool().await?;
            println!(
                "Initialized availability bitset for {} addresses starting at {}.",
                config.pool_size, config.start_ip
            );
            Ok(())
        }
        Commands::Reset => {
            let allocator = connect_allocator(&config).await?;
            allocator.reset_all().await?;
            println!("Removed the availability bitset, time index, and all bindings.");
            Ok(())
        }
    }
}
