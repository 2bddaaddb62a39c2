//! WorldSync CLI
//!
//! Thin wrapper around worldsync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Host the worlds listed in worlds.yaml
//! worldsync serve --worlds worlds.yaml
//!
//! # List the worlds a server hosts
//! worldsync worlds 127.0.0.1:5000
//!
//! # Bind the current directory to a world
//! worldsync register 127.0.0.1:5000 example-world
//!
//! # Keep a registered directory in sync
//! worldsync sync
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use worldsync_core::{
    AuthToken, Project, ServerConfig, SyncClient, SyncServer, WorldId, WorldRegistry,
    AUTH_FILE_NAME, DEFAULT_PORT, DEFAULT_WORLDS_FILE,
};

/// WorldSync - keep a directory in sync with a world on a server
#[derive(Parser)]
#[command(name = "worldsync")]
#[command(version)]
#[command(about = "WorldSync - keep a directory in sync with a world on a server")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the worlds of a registry file
    Serve {
        /// Address to listen on
        #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, env = "LISTEN_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// World registry file (created with an example entry if missing)
        #[arg(long, default_value = DEFAULT_WORLDS_FILE)]
        worlds: PathBuf,

        /// Seconds a registration may wait for its auth file
        #[arg(long, default_value_t = 600)]
        auth_timeout: u64,
    },

    /// List the worlds hosted by a server
    Worlds {
        /// Server address (host:port)
        origin: String,
    },

    /// Bind a directory to a world on a server
    Register {
        /// Server address (host:port)
        origin: String,

        /// World id
        world: String,

        /// Directory to bind (default: current directory)
        #[arg(default_value = ".")]
        dir: PathBuf,
    },

    /// Keep a registered directory in sync until Ctrl+C
    Sync {
        /// Registered directory (default: current directory)
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Cancel `token` on the first Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            println!("Received shutdown signal...");
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            host,
            port,
            worlds,
            auth_timeout,
        } => {
            let config = ServerConfig::new(host, port, worlds)
                .with_auth_timeout(Duration::from_secs(auth_timeout));
            let registry = Arc::new(
                WorldRegistry::load(&config.worlds_file).with_context(|| {
                    format!("Failed to load worlds from {}", config.worlds_file.display())
                })?,
            );
            let _reload = registry.watch()?;

            println!("Starting WorldSync server on {}", config.listen);
            for world in registry.summaries() {
                println!("  {} - {}", world.id, world.name);
            }
            println!();
            println!("Server is running. Press Ctrl+C to stop.");

            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(shutdown.clone());
            SyncServer::new(config, registry).run(shutdown).await?;
            println!("Goodbye.");
        }

        Commands::Worlds { origin } => {
            let worlds = SyncClient::new(origin.as_str())
                .list_worlds()
                .await
                .with_context(|| format!("Failed to list worlds on {origin}"))?;
            if worlds.is_empty() {
                println!("No worlds.");
            }
            for world in worlds {
                println!("{}", world.id);
                println!("  Name: {}", world.name);
            }
        }

        Commands::Register { origin, world, dir } => {
            let client = SyncClient::new(origin.as_str());
            let world = WorldId::new(world);
            let known = client
                .list_worlds()
                .await
                .with_context(|| format!("Failed to reach {origin}"))?;
            if !known.iter().any(|w| w.id == world) {
                anyhow::bail!("World '{}' is not hosted by {}", world, origin);
            }
            if let Some(existing) = Project::load(&dir).await? {
                anyhow::bail!(
                    "{} is already registered to world '{}'",
                    dir.display(),
                    existing.world
                );
            }

            let auth = AuthToken::generate();
            println!("To finish registering, create a file named '{AUTH_FILE_NAME}'");
            println!("in your directory inside world '{world}' on the server,");
            println!("containing this single line:");
            println!();
            println!("  {auth}");
            println!();
            println!("Waiting for the server to find it...");

            let project = client.register(&dir, world, auth).await?;
            println!("Registered {}.", project.root.display());
            println!("Run 'worldsync sync' in that directory to start syncing.");
        }

        Commands::Sync { dir } => {
            let project = Project::load(&dir).await?.with_context(|| {
                format!(
                    "{} is not registered; run 'worldsync register' first",
                    dir.display()
                )
            })?;
            let client = SyncClient::new(project.origin.as_str());

            println!(
                "Syncing {} with world '{}' on {}",
                project.root.display(),
                project.world,
                project.origin
            );
            println!("Press Ctrl+C to stop.");

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            client.sync(&project, cancel).await?;
            println!("Goodbye.");
        }
    }

    Ok(())
}
