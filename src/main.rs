use anyhow::Context;
use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use treedelta::apply::{self, Output};
use treedelta::bsdiff::BsdiffOptions;
use treedelta::cancel::CancelToken;
use treedelta::container::WalkOptions;
use treedelta::create;
use treedelta::heal::{self, HealOptions, HealSpec};
use treedelta::patch_format::WoundKind;
use treedelta::rediff::{self, RediffOptions};
use treedelta::signature::Signature;
use treedelta::validate;
use treedelta::wire::{CodecRegistry, CompressionSettings};

#[derive(Parser)]
#[command(name = "treedelta", version, about = "Binary deltas between directory trees")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the block signature of a directory
    Sign {
        /// Directory to hash
        dir: PathBuf,
        /// Output path for the signature file
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long, default_value = "zstd-9")]
        compression: CompressionSettings,
    },
    /// Create a patch from a target tree (or its signature) to a source tree
    Diff {
        /// Directory the patch applies to, or its signature file
        #[arg(long)]
        target: PathBuf,
        /// Directory the patch produces
        #[arg(long)]
        source: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Also write the source tree's signature here
        #[arg(long)]
        signature_out: Option<PathBuf>,
        #[arg(long, default_value = "brotli-1")]
        compression: CompressionSettings,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Directory holding the target tree
        #[arg(long)]
        target: PathBuf,
        /// Decode and check the patch without writing anything
        #[arg(long, conflicts_with = "fresh")]
        dry: bool,
        /// Build the source tree into this empty directory instead of in place
        #[arg(long)]
        fresh: Option<PathBuf>,
    },
    /// Check a directory against a signature
    Verify {
        #[arg(long, short)]
        signature: PathBuf,
        #[arg(long)]
        dir: PathBuf,
    },
    /// Check a directory against a signature and repair wounded files
    Heal {
        #[arg(long, short)]
        signature: PathBuf,
        #[arg(long)]
        dir: PathBuf,
        /// Where good copies come from, e.g. "archive,build.zip"
        #[arg(long)]
        from: String,
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Re-encode an rsync patch with bsdiff where it pays off
    Rediff {
        #[arg(long, short)]
        patch: PathBuf,
        /// Directory holding the patch's target tree
        #[arg(long)]
        target: PathBuf,
        /// Directory holding the patch's source tree
        #[arg(long)]
        source: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long, default_value = "brotli-9")]
        compression: CompressionSettings,
        /// Suffix-array partitions per old file
        #[arg(long, default_value_t = 1)]
        partitions: usize,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_signature(path: &Path, registry: &CodecRegistry) -> anyhow::Result<Signature> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Signature::read(BufReader::new(file), registry)
        .with_context(|| format!("reading signature {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let start = Instant::now();
    match cli.command {
        Commands::Sign {
            dir,
            output,
            compression,
        } => {
            println!("Signing {}...", dir.display());
            let signature = tokio::task::spawn_blocking(move || -> anyhow::Result<Signature> {
                let signature = Signature::compute_dir(&dir, &WalkOptions::default(), &cancel)?;
                let file = File::create(&output).with_context(|| format!("creating {}", output.display()))?;
                let writer = signature.write(BufWriter::new(file), compression, &CodecRegistry::default())?;
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                Ok(signature)
            })
            .await??;

            println!("\nSignature written!");
            println!("  Files: {}", signature.container.files.len());
            println!("  Bytes: {}", signature.container.size);
            println!("  Blocks: {}", signature.hashes.len());
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Diff {
            target,
            source,
            output,
            signature_out,
            compression,
        } => {
            println!("Creating patch...");
            println!("  Target: {}", target.display());
            println!("  Source: {}", source.display());
            println!("  Output: {}", output.display());

            let stats = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                let registry = CodecRegistry::default();
                let walk = WalkOptions::default();
                let signature = if target.is_dir() {
                    Signature::compute_dir(&target, &walk, &cancel)?
                } else {
                    read_signature(&target, &registry)?
                };
                Ok(create::create_patch(
                    &signature,
                    &source,
                    &walk,
                    &output,
                    signature_out.as_deref(),
                    compression,
                    &registry,
                    &cancel,
                )?)
            })
            .await??;

            println!("\nPatch created successfully!");
            println!("  Files: {}", stats.files);
            println!("  Bytes reused: {}", stats.reused_bytes());
            println!("  Fresh bytes: {}", stats.fresh_bytes);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Apply {
            patch,
            target,
            dry,
            fresh,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let summary = tokio::task::spawn_blocking(move || {
                let output = match (&fresh, dry) {
                    (_, true) => Output::Dry,
                    (Some(out), false) => Output::Fresh(out),
                    (None, false) => Output::Overlay,
                };
                apply::apply_patch(&patch, &target, output, &CodecRegistry::default(), &cancel)
            })
            .await??;

            println!("\nPatch applied successfully!");
            println!("  Files patched: {}", summary.files_patched);
            println!("  Files transposed: {}", summary.files_transposed);
            println!("  Files bsdiffed: {}", summary.files_bsdiffed);
            println!("  Bytes written: {}", summary.bytes_written);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Verify { signature, dir } => {
            println!("Verifying {}...", dir.display());
            let (report, wounds) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                let signature = read_signature(&signature, &CodecRegistry::default())?;
                let (tx, rx) = unbounded();
                let report = validate::validate(&signature, &dir, &tx, &cancel)?;
                drop(tx);
                let wounds: Vec<String> = rx
                    .iter()
                    .filter(|w| w.kind == WoundKind::File)
                    .map(|w| {
                        let path = usize::try_from(w.file_index)
                            .ok()
                            .and_then(|i| signature.container.files.get(i))
                            .map_or("?", |f| f.path.as_str());
                        format!("{path} [{}, {})", w.start, w.end)
                    })
                    .collect();
                Ok((report, wounds))
            })
            .await??;

            for wound in &wounds {
                println!("  wounded: {wound}");
            }
            println!("\nVerification finished.");
            println!("  Files checked: {}", report.files_checked);
            println!("  Bytes checked: {}", report.bytes_checked);
            println!("  Wounded files: {}", report.wounded_files);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
            if report.wounds > 0 {
                anyhow::bail!("{} wounded files", report.wounded_files);
            }
        }
        Commands::Heal {
            signature,
            dir,
            from,
            workers,
        } => {
            println!("Healing {}...", dir.display());
            let (report, summary) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                let signature = read_signature(&signature, &CodecRegistry::default())?;
                let options = HealOptions {
                    workers,
                    ..Default::default()
                };
                let healer = HealSpec::parse(&from)?.build(signature.container.clone(), &dir, options)?;
                Ok(heal::validate_and_heal(&signature, &dir, &healer, &cancel)?)
            })
            .await??;

            println!("\nHealing finished.");
            println!("  Files checked: {}", report.files_checked);
            println!("  Wounded files: {}", report.wounded_files);
            println!("  Files healed: {}", summary.files_healed);
            println!("  Bytes healed: {}", summary.bytes_healed);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Rediff {
            patch,
            target,
            source,
            output,
            compression,
            partitions,
        } => {
            println!("Optimizing patch...");
            println!("  Patch: {}", patch.display());
            println!("  Output: {}", output.display());

            let stats = tokio::task::spawn_blocking(move || {
                let options = RediffOptions {
                    compression,
                    bsdiff: BsdiffOptions {
                        partitions,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                rediff::rediff_file(
                    &patch,
                    &target,
                    &source,
                    &output,
                    &CodecRegistry::default(),
                    &options,
                    &cancel,
                )
            })
            .await??;

            println!("\nPatch optimized!");
            println!("  Files bsdiffed: {}", stats.files_bsdiffed);
            println!("  Files copied: {}", stats.files_copied);
            println!("  Extra bytes: {}", stats.extra_bytes);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
    }

    Ok(())
}
