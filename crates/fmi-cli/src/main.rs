use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fmi_core::PostId;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fmi-cli")]
#[command(about = "Mirror forum posts from a remote API into a local store")]
struct Cli {
    /// YAML file whose keys override the FMI_* environment settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one post and any missing ancestors.
    Sync { post_id: PostId },
    /// Walk ids downward from `--from` (discovered when omitted) to `--to`.
    Batch {
        #[arg(long)]
        from: Option<PostId>,
        #[arg(long, default_value_t = PostId(1), value_parser = parse_lowest_id)]
        to: PostId,
        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Report the highest post id the remote currently serves.
    Discover,
}

fn parse_lowest_id(raw: &str) -> Result<PostId, String> {
    let id: PostId = raw.parse().map_err(|err| format!("{err}"))?;
    if id < fmi_sync::FIRST_POST_ID {
        return Err(format!("post ids start at {}", fmi_sync::FIRST_POST_ID));
    }
    Ok(id)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let pipeline = fmi_sync::pipeline_from_env(cli.config.as_deref()).await?;

    match cli.command.unwrap_or(Commands::Batch {
        from: None,
        to: PostId(1),
        json: false,
    }) {
        Commands::Sync { post_id } => {
            let outcome = pipeline.sync_post(post_id).await?;
            println!("sync complete: post={post_id} outcome={outcome}");
        }
        Commands::Batch { from, to, json } => {
            let report = pipeline.run_batch(from, to).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "batch complete: run_id={} range={}..={} processed={} created={} updated={} skipped={} deferred={} failed={}",
                    report.run_id,
                    report.highest_id,
                    report.lowest_id,
                    report.processed,
                    report.created,
                    report.updated,
                    report.skipped,
                    report.deferred,
                    report.failed
                );
            }
        }
        Commands::Discover => {
            let highest = pipeline
                .discover_highest_id()
                .await?
                .context("remote serves no posts")?;
            println!("highest post id: {highest}");
        }
    }

    println!("posts stored: {}", pipeline.stored_posts().await?);
    Ok(())
}
