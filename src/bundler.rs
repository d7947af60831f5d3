//! Bundler: accumulates an ordered run of blocks into boundary-aligned
//! bundles and writes each one to the store under its zero-padded base.
//!
//! One [`BundleWriter`] is driven by exactly one loop (stream ingest, merge
//! or normalize); it is never shared.  A bundle is encoded in memory and
//! written in a single store call, so a failure never leaves a partial
//! object under the bundle's key.

use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::block::Block;
use crate::codec::{encode_segment, CodecError, CodecId, DEFAULT_COMPRESSION_LEVEL};
use crate::config::ChainConfig;
use crate::range::{bundle_key, round_to_bundle_start};
use crate::store::{cancellable, ObjectStore, StoreError};

const MAX_PREALLOCATED_BLOCKS: u64 = 1_000;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Caller-supplied rewrite applied to every block before it is bundled.
pub type TransformHook = Box<dyn FnMut(Block) -> Result<Block, BoxError> + Send>;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("received unexpected block #{number} (not a boundary, not the first streamable block {first_streamable})")]
    UnexpectedFirstBlock { number: u64, first_streamable: u64 },
    #[error("block #{number} arrived after block #{last}")]
    OutOfOrder { number: u64, last: u64 },
    #[error("no blocks to write to bundle {base}")]
    EmptyBundle { base: u64 },
    #[error("tweaking block: {0}")]
    Transform(#[source] BoxError),
    #[error("encoding bundle: {0}")]
    Codec(#[from] CodecError),
    #[error("writing bundle {key} to store: {source}")]
    Store { key: String, #[source] source: StoreError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundlerOptions {
    /// Blocks at or above this number end the stream.
    pub stop_block_num: Option<u64>,
    pub codec:          CodecId,
    pub level:          i32,
}

impl Default for BundlerOptions {
    fn default() -> Self {
        Self {
            stop_block_num: None,
            codec:          CodecId::default(),
            level:          DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Outcome of feeding one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Buffered,
    /// At least one bundle was written; carries the last key written.
    Flushed(String),
    /// The stop block was reached; buffered blocks have been flushed.
    EndOfStream,
}

pub struct BundleWriter {
    store:     Arc<dyn ObjectStore>,
    chain:     ChainConfig,
    options:   BundlerOptions,
    transform: Option<TransformHook>,
    cancel:    CancellationToken,

    low:       Option<u64>,
    last:      Option<u64>,
    pending:   Vec<Block>,
    written:   Vec<String>,
}

impl BundleWriter {
    pub fn new(store: Arc<dyn ObjectStore>, chain: ChainConfig, options: BundlerOptions) -> Self {
        Self {
            store,
            chain,
            options,
            transform: None,
            cancel:    CancellationToken::new(),
            low:       None,
            last:      None,
            pending:   Vec::with_capacity(chain.bundle_size.min(MAX_PREALLOCATED_BLOCKS) as usize),
            written:   Vec::new(),
        }
    }

    pub fn with_transform(mut self, hook: TransformHook) -> Self {
        self.transform = Some(hook);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Base of the bundle being accumulated, `None` before the first block.
    pub fn low_block_num(&self) -> Option<u64> {
        self.low
    }

    pub fn last_block_num(&self) -> Option<u64> {
        self.last
    }

    pub fn pending(&self) -> &[Block] {
        &self.pending
    }

    /// Keys written so far, in write order.
    pub fn written_keys(&self) -> &[String] {
        &self.written
    }

    pub async fn process(&mut self, block: Block) -> Result<Progress, BundleError> {
        let block = match self.transform.as_mut() {
            Some(hook) => hook(block).map_err(BundleError::Transform)?,
            None => block,
        };
        let size = self.chain.bundle_size;

        if let Some(stop) = self.options.stop_block_num {
            if block.number >= stop {
                if !self.pending.is_empty() {
                    self.flush().await?;
                }
                debug!(block_num = block.number, stop_block_num = stop, "stop block reached");
                return Ok(Progress::EndOfStream);
            }
        }

        let Some(low) = self.low else {
            if !self.chain.is_boundary(block.number) {
                return Err(BundleError::UnexpectedFirstBlock {
                    number:           block.number,
                    first_streamable: self.chain.first_streamable_block,
                });
            }
            self.low  = Some(round_to_bundle_start(block.number, size));
            self.last = Some(block.number);
            self.pending.push(block);
            return self.flush_if_complete(None).await;
        };

        if let Some(last) = self.last {
            if block.number <= last {
                return Err(BundleError::OutOfOrder { number: block.number, last });
            }
        }

        let mut flushed = None;
        if block.number > low + size - 1 {
            if !self.pending.is_empty() {
                flushed = Some(self.flush().await?);
            }
            let anchor = round_to_bundle_start(block.number, size);
            debug!(block_num = block.number, from = low, to = anchor, "gap in block stream, re-anchoring bundle");
            self.low = Some(anchor);
        }
        self.last = Some(block.number);
        self.pending.push(block);
        self.flush_if_complete(flushed).await
    }

    async fn flush_if_complete(&mut self, flushed: Option<String>) -> Result<Progress, BundleError> {
        let (Some(low), Some(last)) = (self.low, self.last) else {
            return Ok(Progress::Buffered);
        };
        let size = self.chain.bundle_size;
        if last == low + size - 1 {
            let key = self.flush().await?;
            self.low = Some(low + size);
            return Ok(Progress::Flushed(key));
        }
        Ok(flushed.map_or(Progress::Buffered, Progress::Flushed))
    }

    async fn flush(&mut self) -> Result<String, BundleError> {
        let base = self.low.unwrap_or_default();
        if self.pending.is_empty() {
            return Err(BundleError::EmptyBundle { base });
        }
        let key  = bundle_key(base);
        let data = encode_segment(&self.pending, self.options.codec, self.options.level)?;
        info!(
            filename = %key,
            low_block_num = base,
            blocks = self.pending.len(),
            bytes = data.len(),
            codec = self.options.codec.name(),
            "writing bundle to store"
        );
        cancellable(&self.cancel, self.store.write(&key, Bytes::from(data)))
            .await
            .map_err(|source| BundleError::Store { key: key.clone(), source })?;
        self.pending.clear();
        self.written.push(key.clone());
        Ok(key)
    }
}
