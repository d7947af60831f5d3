use blockbundle::codec::{CodecId, DEFAULT_COMPRESSION_LEVEL};
use blockbundle::compare::{compare_block_files, diff_command};
use blockbundle::config::ChainConfig;
use blockbundle::range::BlockRange;
use blockbundle::rewrite::{merge_one_block_files, normalize_bundles, RewriteOptions, RewriteSummary};
use blockbundle::scan::{check_bundles_batch, BatchOptions, PrintDetails, ScanContext, ScanOptions};
use blockbundle::store::open_store;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "blockbundle", about = "Audit, rebuild and stream fixed-size block bundles")]
struct Cli {
    #[command(flatten)]
    chain: ChainArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ChainArgs {
    /// JSON file with `bundle_size` and `first_streamable_block`
    #[arg(long, global = true)]
    chain_config: Option<PathBuf>,
    /// Overrides the chain config's bundle size
    #[arg(long, global = true)]
    bundle_size: Option<u64>,
    /// Overrides the chain config's first streamable block
    #[arg(long, global = true)]
    first_streamable_block: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Details {
    Nothing,
    Stats,
    Full,
}

impl From<Details> for PrintDetails {
    fn from(d: Details) -> Self {
        match d {
            Details::Nothing => PrintDetails::Nothing,
            Details::Stats   => PrintDetails::Stats,
            Details::Full    => PrintDetails::Full,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check a bundle store for holes (stop = 0 scans everything)
    Check {
        store: String,
        start: u64,
        stop:  u64,
        #[arg(short, long, default_value = "100000")]
        batch_size: u64,
        #[arg(short, long, default_value = "4")]
        workers: usize,
        #[arg(short, long, value_enum, default_value = "nothing")]
        print: Details,
    },
    /// Merge one-block files into bundles
    Merge {
        source: String,
        dest:   String,
        start:  u64,
        stop:   u64,
        /// Delete one-block files once merged
        #[arg(long)]
        delete: bool,
        /// Codec: zstd (default), lz4, none
        #[arg(short, long, default_value = "zstd")]
        codec: String,
    },
    /// Rewrite bundles from a source store into a destination store
    Normalize {
        source: String,
        dest:   String,
        start:  u64,
        stop:   u64,
        /// Codec: zstd (default), lz4, none
        #[arg(short, long, default_value = "zstd")]
        codec: String,
    },
    /// Compare two JSON block files
    Compare {
        a: PathBuf,
        b: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli   = Cli::parse();
    let chain = load_chain(&cli.chain)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {

        // ── Check ────────────────────────────────────────────────────────────
        Commands::Check { store, start, stop, batch_size, workers, print } => {
            let object_store = open_store(&store)?;
            let options = ScanOptions { print_details: print.into(), ..ScanOptions::default() };
            let ctx = ScanContext::new(object_store, store.as_str(), chain)
                .with_options(options)
                .with_cancel(cancel);
            let report = check_bundles_batch(
                ctx,
                BlockRange::new(start, stop),
                BatchOptions { batch_size, workers },
                std::io::stdout(),
            )
            .await?;
            info!(jobs = report.jobs.len(), hole_found = report.hole_found(), "check complete");
        }

        // ── Merge ────────────────────────────────────────────────────────────
        Commands::Merge { source, dest, start, stop, delete, codec } => {
            let src = open_store(&source)?;
            let dst = open_store(&dest)?;
            let options = RewriteOptions {
                codec:         parse_codec(&codec),
                level:         DEFAULT_COMPRESSION_LEVEL,
                delete_source: delete,
            };
            let summary = merge_one_block_files(
                src.as_ref(), dst, chain, BlockRange::new(start, stop), options, &cancel,
            )
            .await?;
            print_summary("Merged", &summary);
        }

        // ── Normalize ────────────────────────────────────────────────────────
        Commands::Normalize { source, dest, start, stop, codec } => {
            let src = open_store(&source)?;
            let dst = open_store(&dest)?;
            let options = RewriteOptions { codec: parse_codec(&codec), ..RewriteOptions::default() };
            let summary = normalize_bundles(
                src.as_ref(), dst, chain, BlockRange::new(start, stop), None, options, &cancel,
            )
            .await?;
            print_summary("Normalized", &summary);
        }

        // ── Compare ──────────────────────────────────────────────────────────
        Commands::Compare { a, b } => {
            if compare_block_files(&a, &b)? {
                println!("Files are equal, all good");
            } else {
                let editor = std::env::var("DIFF_EDITOR").ok();
                println!("Files differ, run the following command to see the difference:");
                println!();
                println!("    {}", diff_command(&a, &b, editor.as_deref()));
                println!();
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn load_chain(args: &ChainArgs) -> Result<ChainConfig, Box<dyn std::error::Error>> {
    let mut chain = match &args.chain_config {
        Some(path) => ChainConfig::from_json_file(path)?,
        None       => ChainConfig::default(),
    };
    if let Some(size) = args.bundle_size {
        chain.bundle_size = size;
    }
    if let Some(first) = args.first_streamable_block {
        chain.first_streamable_block = first;
    }
    chain.validate()?;
    Ok(chain)
}

fn parse_codec(s: &str) -> CodecId {
    CodecId::from_name(s).unwrap_or_else(|| {
        warn!(codec = s, "unknown codec, defaulting to zstd");
        CodecId::Zstd
    })
}

fn print_summary(verb: &str, summary: &RewriteSummary) {
    println!(
        "{verb} {} blocks from {} objects into {} bundles",
        summary.blocks_read.saturating_sub(summary.blocks_skipped),
        summary.objects_read,
        summary.bundles_written.len(),
    );
    if let Some(range) = summary.pending_range {
        println!("  {} trailing blocks {range} not written (partial bundle)", summary.pending_blocks);
    }
    if summary.objects_deleted > 0 {
        println!("  deleted {} one-block files", summary.objects_deleted);
    }
}
