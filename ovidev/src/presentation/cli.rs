use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "ovi: VM images over OCI registries", long_about = None)]
pub struct Cli {
    /// Registry host (a scheme may be given for local registries)
    #[arg(long, global = true, default_value = "ghcr.io", env = "OVI_REGISTRY")]
    pub registry: String,

    /// Organisation the repositories live under
    #[arg(long, global = true, default_value = "trycua", env = "OVI_ORG")]
    pub org: String,

    /// Root of the content-addressed cache (defaults to ~/.ovi)
    #[arg(long, global = true, env = "OVI_CACHE_ROOT")]
    pub cache_root: Option<PathBuf>,

    /// Disable the cache; transfers run through scratch directories
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pull an image and reconstruct its VM directory
    Pull {
        /// Image reference, `name:tag`
        image: String,

        /// Directory name for the VM (defaults to name_tag)
        #[arg(long)]
        name: Option<String>,

        /// Parent directory receiving the VM
        #[arg(long)]
        location: Option<PathBuf>,
    },

    /// Package a VM directory and push it under one or more tags
    Push {
        vm_dir: PathBuf,
        image_name: String,
        #[arg(required = true)]
        tags: Vec<String>,

        #[arg(long, default_value_t = 512)]
        chunk_size_mb: u64,

        /// Hash and cache chunks without talking to the registry
        #[arg(long)]
        dry_run: bool,

        /// Rebuild the disk from cached chunks and require matching digests
        #[arg(long)]
        reassemble: bool,

        /// Omit the created timestamp so identical inputs produce identical
        /// manifests
        #[arg(long)]
        deterministic: bool,
    },

    /// Drop cached manifest directories an image no longer points at
    Prune {
        /// Image reference, `name:tag`
        image: String,
    },
}
