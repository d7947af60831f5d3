//! Offline rewrites through the bundler: merging one-block objects into
//! bundles, and replaying existing bundles into a new store.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::bundler::{BundleError, BundleWriter, BundlerOptions, Progress, TransformHook};
use crate::codec::{CodecError, CodecId, SegmentReader, DEFAULT_COMPRESSION_LEVEL};
use crate::config::ChainConfig;
use crate::range::{parse_bundle_base, walk_prefix, BlockRange};
use crate::store::{cancellable, ObjectStore, StoreError};

#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("start block {start} must be on a boundary (bundle size {bundle_size})")]
    Misaligned { start: u64, bundle_size: u64 },
    #[error("invalid range: start {start} is not below stop {stop}")]
    InvalidRange { start: u64, stop: u64 },
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("unable to decode {key}: {source}")]
    Codec { key: String, #[source] source: CodecError },
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("rewrite cancelled")]
    Cancelled,
}

impl From<StoreError> for RewriteError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Cancelled => RewriteError::Cancelled,
            other => RewriteError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteOptions {
    pub codec:         CodecId,
    pub level:         i32,
    /// Merge only: remove one-block objects once their bundle is written.
    pub delete_source: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            codec:         CodecId::default(),
            level:         DEFAULT_COMPRESSION_LEVEL,
            delete_source: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    pub objects_read:    u64,
    pub blocks_read:     u64,
    /// Blocks dropped because an equal or higher number was already fed.
    pub blocks_skipped:  u64,
    pub bundles_written: Vec<String>,
    pub objects_deleted: u64,
    /// The stop block was reached (as opposed to the source running out).
    pub end_of_stream:   bool,
    /// Blocks of a trailing partial bundle that were never written.
    pub pending_blocks:  usize,
    pub pending_range:   Option<BlockRange>,
}

/// Merge one-block objects (`<10-digit number>-<suffix>`, each holding a
/// one-block segment) from `source` into bundles of `dest`, for blocks in
/// `[range.start, range.stop)`.
pub async fn merge_one_block_files(
    source:  &dyn ObjectStore,
    dest:    Arc<dyn ObjectStore>,
    chain:   ChainConfig,
    range:   BlockRange,
    options: RewriteOptions,
    cancel:  &CancellationToken,
) -> Result<RewriteSummary, RewriteError> {
    if range.start % chain.bundle_size != 0 {
        return Err(RewriteError::Misaligned { start: range.start, bundle_size: chain.bundle_size });
    }
    if range.is_bounded() && range.stop <= range.start {
        return Err(RewriteError::InvalidRange { start: range.start, stop: range.stop });
    }

    let mut writer = bundle_writer(dest, chain, range, &options, cancel);
    let mut summary = RewriteSummary::default();
    // One-block keys fed to the bundler whose bundle is not written yet.
    let mut fed_keys: Vec<(u64, String)> = Vec::new();

    let keys = cancellable(cancel, source.list(&walk_prefix(&range, chain.bundle_size))).await?;
    info!(source_objects = keys.len(), block_range = %range, "merging one-block files");

    for key in keys {
        let Some(number) = parse_bundle_base(&key) else { continue };
        if number < range.start {
            continue;
        }
        let blocks = read_object(source, &key, cancel).await?;
        summary.objects_read += 1;

        for block in blocks {
            summary.blocks_read += 1;
            if writer.last_block_num().is_some_and(|last| block.number <= last) {
                warn!(key = %key, block = %block, "block already merged, skipping (forked one-block file?)");
                summary.blocks_skipped += 1;
                continue;
            }
            let progress = writer.process(block).await?;
            if progress == Progress::EndOfStream {
                summary.end_of_stream = true;
                if options.delete_source {
                    summary.objects_deleted += delete_keys(source, &mut fed_keys, u64::MAX, cancel).await?;
                }
                return Ok(finish(summary, &writer));
            }
            fed_keys.push((number, key.clone()));
            if let (Progress::Flushed(_), true) = (&progress, options.delete_source) {
                let below = writer.low_block_num().unwrap_or(0);
                summary.objects_deleted += delete_keys(source, &mut fed_keys, below, cancel).await?;
            }
        }
    }
    Ok(finish(summary, &writer))
}

/// Replay bundles of `source` from `range.start` through `transform` into
/// bundles of `dest`, ending at `range.stop` or when the source runs out.
pub async fn normalize_bundles(
    source:    &dyn ObjectStore,
    dest:      Arc<dyn ObjectStore>,
    chain:     ChainConfig,
    range:     BlockRange,
    transform: Option<TransformHook>,
    options:   RewriteOptions,
    cancel:    &CancellationToken,
) -> Result<RewriteSummary, RewriteError> {
    if !chain.is_boundary(range.start) {
        return Err(RewriteError::Misaligned { start: range.start, bundle_size: chain.bundle_size });
    }
    if range.is_bounded() && range.stop <= range.start {
        return Err(RewriteError::InvalidRange { start: range.start, stop: range.stop });
    }

    let mut writer = bundle_writer(dest, chain, range, &options, cancel);
    if let Some(hook) = transform {
        writer = writer.with_transform(hook);
    }
    let mut summary = RewriteSummary::default();

    let keys = cancellable(cancel, source.list(&walk_prefix(&range, chain.bundle_size))).await?;
    info!(source_bundles = keys.len(), block_range = %range, "normalizing bundles");

    for key in keys {
        let Some(base) = parse_bundle_base(&key) else { continue };
        if base + chain.bundle_size <= range.start {
            continue;
        }
        let blocks = read_object(source, &key, cancel).await?;
        summary.objects_read += 1;
        debug!(key = %key, blocks = blocks.len(), "replaying bundle");

        for block in blocks {
            summary.blocks_read += 1;
            if block.number < range.start {
                continue;
            }
            if writer.last_block_num().is_some_and(|last| block.number <= last) {
                warn!(key = %key, block = %block, "block already replayed, skipping");
                summary.blocks_skipped += 1;
                continue;
            }
            if writer.process(block).await? == Progress::EndOfStream {
                summary.end_of_stream = true;
                info!(bundles = writer.written_keys().len(), "complete");
                return Ok(finish(summary, &writer));
            }
        }
    }
    Ok(finish(summary, &writer))
}

fn bundle_writer(
    dest:    Arc<dyn ObjectStore>,
    chain:   ChainConfig,
    range:   BlockRange,
    options: &RewriteOptions,
    cancel:  &CancellationToken,
) -> BundleWriter {
    let bundler = BundlerOptions {
        stop_block_num: range.is_bounded().then_some(range.stop),
        codec:          options.codec,
        level:          options.level,
    };
    BundleWriter::new(dest, chain, bundler).with_cancel(cancel.clone())
}

async fn read_object(store: &dyn ObjectStore, key: &str, cancel: &CancellationToken) -> Result<Vec<Block>, RewriteError> {
    let data = cancellable(cancel, store.open(key)).await?;
    let codec_err = |source| RewriteError::Codec { key: key.to_string(), source };
    let blocks = SegmentReader::new(&data[..])
        .map_err(codec_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(codec_err)?;
    Ok(blocks)
}

/// Delete fed keys for blocks below `below`, returning how many went.
async fn delete_keys(
    store:    &dyn ObjectStore,
    fed_keys: &mut Vec<(u64, String)>,
    below:    u64,
    cancel:   &CancellationToken,
) -> Result<u64, RewriteError> {
    let mut deleted = 0;
    let mut kept = Vec::new();
    for (number, key) in fed_keys.drain(..) {
        if number < below {
            cancellable(cancel, store.delete(&key)).await?;
            deleted += 1;
        } else {
            kept.push((number, key));
        }
    }
    *fed_keys = kept;
    if deleted > 0 {
        debug!(deleted, "deleted merged one-block files");
    }
    Ok(deleted)
}

fn finish(mut summary: RewriteSummary, writer: &BundleWriter) -> RewriteSummary {
    summary.bundles_written = writer.written_keys().to_vec();
    let pending = writer.pending();
    summary.pending_blocks = pending.len();
    if let (Some(first), Some(last)) = (pending.first(), pending.last()) {
        let range = BlockRange::new(first.number, last.number);
        warn!(block_range = %range, blocks = pending.len(), "source exhausted, trailing partial bundle not written");
        summary.pending_range = Some(range);
    }
    summary
}
