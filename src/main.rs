use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

use treepatch::patch_format::DEFAULT_HIGH_WATER_MARK;
use treepatch::{apply_patch, create_patch, read_manifest, ApplyOptions, CreateOptions};

#[derive(Parser)]
#[command(name = "treepatch", about = "Incremental file-tree patch creator and applier")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch directory by comparing a new tree against a baseline
    Create {
        /// Path to the baseline (previously known) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the incoming (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Patch directory to (re)create
        #[arg(long, short)]
        output: PathBuf,
        /// Records buffered between pipeline stages
        #[arg(long, default_value_t = DEFAULT_HIGH_WATER_MARK)]
        high_water_mark: usize,
    },
    /// Apply a patch directory to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long, default_value = ".")]
        target: PathBuf,
        /// Path to the patch directory
        #[arg(long, short)]
        patch: PathBuf,
        /// Keep applying remaining files after a per-file failure
        #[arg(long)]
        keep_going: bool,
        /// Records buffered between pipeline stages
        #[arg(long, default_value_t = DEFAULT_HIGH_WATER_MARK)]
        high_water_mark: usize,
    },
    /// List the entries of a patch directory
    Show {
        /// Path to the patch directory
        #[arg(long, short)]
        patch: PathBuf,
    },
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            old,
            new,
            output,
            high_water_mark,
        } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let counter = create_patch(&old, &new, &output, CreateOptions { high_water_mark })
                .await
                .with_context(|| format!("Failed to create patch at {}", output.display()))?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            println!("  Files added: {}", counter.new);
            println!("  Files changed: {}", counter.changed);
            println!("  Files deleted: {}", counter.deleted);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            target,
            patch,
            keep_going,
            high_water_mark,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let options = ApplyOptions {
                keep_going,
                high_water_mark,
                ..ApplyOptions::default()
            };
            let start = Instant::now();
            let summary = apply_patch(&target, &patch, options)
                .await
                .with_context(|| format!("Failed to apply patch {}", patch.display()))?;
            let elapsed = start.elapsed();

            println!("\nPatch applied successfully!");
            println!("  Files added: {}", summary.applied.new);
            println!("  Files changed: {}", summary.applied.changed);
            println!("  Files deleted: {}", summary.applied.deleted);
            if summary.failed > 0 {
                println!("  Files failed: {}", summary.failed);
            }
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Show { patch } => {
            let manifest = read_manifest(&patch)
                .await
                .with_context(|| format!("Failed to read patch {}", patch.display()))?;
            for (path, status) in manifest.iter() {
                println!("{status:>8}  {path}");
            }
            println!("\n{}", manifest.counter());
        }
    }

    Ok(())
}
