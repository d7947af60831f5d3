//! Streaming ingest: pull blocks from a remote block stream and bundle
//! them into the store.
//!
//! Transport failures mid-stream are retried after a fixed delay with the
//! cursor of the last processed response.  Failing to open the stream at
//! all, failing to decode a response, or a bundler error ends the run.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::block::{decode_block, Block};
use crate::bundler::{BoxError, BundleError, BundleWriter, Progress};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(4);

// ── Remote stream model ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkStep {
    New,
    Undo,
    Irreversible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocksRequest {
    pub start_block_num: i64,
    /// `0` streams forever.
    pub stop_block_num:  u64,
    pub fork_steps:      Vec<ForkStep>,
    /// Resume token of the last processed response; empty on the first call.
    pub cursor:          String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocksResponse {
    /// One encoded block, opaque to the stream.
    pub block:  Bytes,
    pub step:   ForkStep,
    pub cursor: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("remote error: {0}")]
    Remote(String),
}

pub type ResponseStream = BoxStream<'static, Result<BlocksResponse, StreamError>>;

#[async_trait]
pub trait BlockStreamClient: Send + Sync {
    async fn blocks(&self, request: BlocksRequest) -> Result<ResponseStream, StreamError>;
}

/// Turns a response payload into a block.
pub trait ResponseDecoder: Send + Sync {
    fn decode(&self, response: &BlocksResponse) -> Result<Block, BoxError>;
}

/// Reads the payload as a single block record.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordDecoder;

impl ResponseDecoder for RecordDecoder {
    fn decode(&self, response: &BlocksResponse) -> Result<Block, BoxError> {
        Ok(decode_block(&response.block)?)
    }
}

// ── Loop ──────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unable to start blocks stream: {0}")]
    Connect(#[source] StreamError),
    #[error("error decoding response to block: {0}")]
    Decode(#[source] BoxError),
    #[error("write to bundle writer: {0}")]
    Bundle(#[from] BundleError),
    #[error("start block {0} does not fit a signed 64-bit request field")]
    StartBlockOutOfRange(u64),
    #[error("ingest cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub start_block: u64,
    /// `0` streams forever.
    pub stop_block:  u64,
    pub retry_delay: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self { start_block: 0, stop_block: 0, retry_delay: DEFAULT_RETRY_DELAY }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub responses:       u64,
    /// Responses replayed after a retry and dropped.
    pub skipped:         u64,
    pub retries:         u64,
    pub last_block:      Option<u64>,
    pub cursor:          String,
    pub bundles_written: usize,
    /// Ended because the bundler reached its stop block.
    pub end_of_stream:   bool,
}

pub async fn download_blocks(
    client:  &dyn BlockStreamClient,
    decoder: &dyn ResponseDecoder,
    writer:  &mut BundleWriter,
    options: &IngestOptions,
    cancel:  &CancellationToken,
) -> Result<IngestSummary, IngestError> {
    let mut summary = IngestSummary::default();
    let start_block_num = i64::try_from(options.start_block)
        .map_err(|_| IngestError::StartBlockOutOfRange(options.start_block))?;

    loop {
        let request = BlocksRequest {
            start_block_num,
            stop_block_num: options.stop_block,
            fork_steps:     vec![ForkStep::Irreversible],
            cursor:         summary.cursor.clone(),
        };
        debug!(start_block_num, stop_block_num = options.stop_block, cursor = %request.cursor, "requesting blocks stream");

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            res = client.blocks(request) => res.map_err(IngestError::Connect)?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                next = stream.next() => next,
            };
            let response = match next {
                None => {
                    summary.bundles_written = writer.written_keys().len();
                    info!(last_block = ?summary.last_block, bundles = summary.bundles_written, "blocks stream ended");
                    return Ok(summary);
                }
                Some(Ok(response)) => response,
                Some(Err(e)) => {
                    error!(retry_delay = ?options.retry_delay, error = %e, "stream encountered a remote error, going to retry");
                    summary.retries += 1;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                        _ = tokio::time::sleep(options.retry_delay) => {}
                    }
                    break;
                }
            };
            summary.responses += 1;

            let block = decoder.decode(&response).map_err(IngestError::Decode)?;
            if summary.last_block.is_some_and(|last| block.number <= last) {
                debug!(block_num = block.number, "already processed, skipping");
                summary.skipped += 1;
                summary.cursor = response.cursor;
                continue;
            }

            let number = block.number;
            if writer.process(block).await? == Progress::EndOfStream {
                summary.end_of_stream = true;
                summary.bundles_written = writer.written_keys().len();
                info!(stop_block = number, bundles = summary.bundles_written, "stop block reached");
                return Ok(summary);
            }
            summary.last_block = Some(number);
            summary.cursor = response.cursor;
        }
    }
}
