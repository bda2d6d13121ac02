#![deny(unsafe_code)]

mod config;

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "tokio-console")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oxdav_core::{Dispatcher, LocalStore, MemoryStore, ResourceStore};
use oxdav_server::WebDavServer;

use crate::config::{FileConfig, ServeArgs};

/// WebDAV server for a local directory
#[derive(Parser)]
#[command(name = "oxdav")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Serve a directory on port 8080
    oxdav serve ~/shared --port 8080

    # Serve read-only under /files, settings from a file
    oxdav serve --config oxdav.toml --read-only --prefix /files

    # Show the effective configuration
    oxdav config --config oxdav.toml --port 9000
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress log output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a directory over WebDAV until interrupted
    Serve(ServeArgs),

    /// Print the effective configuration as TOML
    Config(ServeArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if !cli.quiet {
        setup_tracing(cli.verbose);
    }

    let result = match &cli.command {
        Commands::Serve(args) => serve(args),
        Commands::Config(args) => print_config(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn print_config(args: &ServeArgs) -> Result<()> {
    let config = args.resolve()?;
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Build the dispatcher and run the server until Ctrl-C.
fn serve(args: &ServeArgs) -> Result<()> {
    let FileConfig { root, dav, server } = args.resolve()?;

    let store: Arc<dyn ResourceStore> = match &root {
        Some(root) => Arc::new(
            LocalStore::open(root)
                .with_context(|| format!("Cannot serve {}", root.display()))?,
        ),
        None if args.memory => Arc::new(MemoryStore::new()),
        None => anyhow::bail!("No directory to serve: pass ROOT, set `root` in the config file, or use --memory"),
    };

    let dispatcher = Dispatcher::new(store, dav).context("Invalid DAV configuration")?;
    let dispatcher = Arc::new(dispatcher);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let server = WebDavServer::start(dispatcher, server)
            .await
            .context("Failed to start WebDAV server")?;

        match &root {
            Some(root) => info!(root = %root.display(), url = %server.url(), "Serving directory"),
            None => info!(url = %server.url(), "Serving in-memory tree"),
        }
        eprintln!("WebDAV server listening on {}", server.url());

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Interrupted, shutting down");
        server.stop().await;
        Ok(())
    })
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    #[cfg(feature = "tokio-console")]
    {
        use tracing_subscriber::Layer;

        let fmt_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
        tracing_subscriber::registry()
            .with(console_subscriber::spawn())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_filter(fmt_filter),
            )
            .init();
    }

    #[cfg(not(feature = "tokio-console"))]
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}
