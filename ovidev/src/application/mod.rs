pub mod handlers;

use std::path::PathBuf;

use clap::Parser;
use ovi_core::config::RegistryConfig;
use ovi_core::error::Result;
use tracing_subscriber::EnvFilter;

use crate::presentation::cli::{Cli, Commands};

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cache_root = cli.cache_root.clone().unwrap_or_else(default_cache_root);
    let mut config = RegistryConfig::new(cli.registry.clone(), cli.org.clone(), cache_root);
    config.cache_enabled = !cli.no_cache;

    match cli.command {
        Commands::Pull {
            image,
            name,
            location,
        } => handlers::handle_pull(config, image, name, location).await,
        Commands::Push {
            vm_dir,
            image_name,
            tags,
            chunk_size_mb,
            dry_run,
            reassemble,
            deterministic,
        } => {
            handlers::handle_push(
                config,
                vm_dir,
                image_name,
                tags,
                chunk_size_mb,
                dry_run,
                reassemble,
                deterministic,
            )
            .await
        }
        Commands::Prune { image } => handlers::handle_prune(config, image).await,
    }
}

fn default_cache_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ovi")
}
