//! trove daemon binary.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trove_metadata::MetadataStore;
use trove_server::bootstrap;
use trove_server::commands;

/// troved - role-scoped, audited storage daemon
#[derive(Parser, Debug)]
#[command(name = "troved")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "TROVE_CONFIG",
        default_value = "config/troved.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Serve,
    /// Manage schema migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateCommand,
    },
    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        action: AuditCommand,
    },
    /// Evaluate node mode against a storage backend
    Mode {
        #[command(subcommand)]
        action: ModeCommand,
    },
}

#[derive(Subcommand, Debug)]
enum MigrateCommand {
    /// Apply all pending migrations
    Up,
    /// Revert the most recent migration
    Down,
    /// List embedded and applied migrations
    List,
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Verify the hash chain over a range of entry ids
    Verify {
        #[arg(long)]
        from: Option<i64>,
        #[arg(long)]
        to: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum ModeCommand {
    /// Report the mode a node would run in
    Check {
        #[arg(long)]
        mode: String,
        #[arg(long)]
        backend: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&args.config).await,
        Command::Migrate { action } => migrate(&args.config, action).await,
        Command::Audit {
            action: AuditCommand::Verify { from, to },
        } => verify_audit(&args.config, from, to).await,
        Command::Mode {
            action: ModeCommand::Check { mode, backend },
        } => {
            let result = commands::check_mode(&mode, &backend)?;
            print!("{}", commands::render_mode(&result));
            Ok(())
        }
    }
}

async fn serve(config_path: &std::path::Path) -> Result<()> {
    tracing::info!("troved v{}", env!("CARGO_PKG_VERSION"));

    let config = bootstrap::load_config(config_path)?;
    let state = bootstrap::start(config).await?;

    bootstrap::serve(state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await
}

async fn migrate(config_path: &std::path::Path, action: MigrateCommand) -> Result<()> {
    let config = bootstrap::load_config(config_path)?;
    let store = bootstrap::open_for_admin(&config).await?;

    let outcome = match action {
        MigrateCommand::Up => store.migrate().await.map(|report| {
            if report.applied.is_empty() {
                println!("schema is up to date");
            }
            for version in &report.applied {
                println!("applied {version:04}");
            }
            for file in &report.drift {
                println!("drift: {file}");
            }
        }),
        MigrateCommand::Down => store.migrate_down().await.map(|reverted| match reverted {
            Some(version) => println!("reverted {version:04}"),
            None => println!("nothing to revert"),
        }),
        MigrateCommand::List => store
            .list_migrations()
            .await
            .map(|infos| print!("{}", commands::render_migrations(&infos))),
    };
    store.close().await;
    outcome.context("migration command failed")
}

async fn verify_audit(config_path: &std::path::Path, from: Option<i64>, to: Option<i64>) -> Result<()> {
    let config = bootstrap::load_config(config_path)?;
    let store = bootstrap::open_for_admin(&config).await?;

    let verification = commands::verify_audit(store.as_ref(), from, to).await;
    store.close().await;
    let verification = verification.context("audit verification failed")?;

    println!("{}", verification.summary());
    if !verification.intact {
        bail!("audit chain verification failed");
    }
    Ok(())
}
