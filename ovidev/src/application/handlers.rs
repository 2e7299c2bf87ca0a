use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use ovi_core::config::RegistryConfig;
use ovi_core::error::Result;
use ovi_core::pull::{self, PullOptions};
use ovi_core::push::{self, PushOptions};
use ovi_core::transfer::TransferProgress;

/// Renders the engine's progress counters until aborted.
fn spawn_progress_bar(
    progress: Arc<TransferProgress>,
) -> (ProgressBar, tokio::task::JoinHandle<()>) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let render = tokio::spawn({
        let bar = bar.clone();
        async move {
            loop {
                let (done_bytes, total_bytes, done_files, total_files) = progress.snapshot();
                bar.set_length(total_bytes);
                bar.set_position(done_bytes);
                bar.set_message(format!("{done_files}/{total_files} layers"));
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    });
    (bar, render)
}

pub async fn handle_pull(
    config: RegistryConfig,
    image: String,
    name: Option<String>,
    location: Option<PathBuf>,
) -> Result<()> {
    let progress = Arc::new(TransferProgress::default());
    let (bar, render) = spawn_progress_bar(progress.clone());

    let opts = PullOptions {
        vm_name: name,
        location,
        concurrency: None,
        progress: Some(progress),
    };
    let outcome = pull::pull(&config, &image, Some(&opts)).await;

    render.abort();
    bar.finish_and_clear();
    let outcome = outcome?;
    println!(
        "pulled {image} -> {} (manifest {}{})",
        outcome.vm_dir.display(),
        outcome.manifest_id,
        if outcome.reused_cache { ", from cache" } else { "" }
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_push(
    config: RegistryConfig,
    vm_dir: PathBuf,
    image_name: String,
    tags: Vec<String>,
    chunk_size_mb: u64,
    dry_run: bool,
    reassemble: bool,
    deterministic: bool,
) -> Result<()> {
    let progress = Arc::new(TransferProgress::default());
    let (bar, render) = spawn_progress_bar(progress.clone());

    let opts = PushOptions {
        chunk_size_mb: Some(chunk_size_mb),
        dry_run,
        reassemble,
        deterministic,
        concurrency: None,
        progress: Some(progress),
    };
    let outcome = push::push(&config, &vm_dir, &image_name, &tags, Some(&opts)).await;

    render.abort();
    bar.finish_and_clear();
    let outcome = outcome?;
    if dry_run {
        println!(
            "dry run: {} layers hashed, manifest would be {}",
            outcome.layers, outcome.manifest_digest
        );
    } else {
        println!(
            "pushed {image_name} ({} layers, {} uploaded, {} already present) as {}",
            outcome.layers,
            outcome.uploaded_blobs,
            outcome.reused_blobs,
            outcome.manifest_digest
        );
    }
    Ok(())
}

pub async fn handle_prune(config: RegistryConfig, image: String) -> Result<()> {
    let removed = pull::prune(&config, &image).await?;
    println!("pruned {removed} stale manifest directories for {image}");
    Ok(())
}
