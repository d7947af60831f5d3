//! Bundle scanning: hole detection, optional block replay through the
//! linkage tracker, and the batch driver that runs many scan jobs at once.
//!
//! # Report format
//!
//! Report lines are plain text routed through
//! [`crate::aggregator::OrderedLogAggregator`], one marker per verdict:
//!
//! | Marker | Meaning |
//! |--------|---------|
//! | `✅` | contiguous range |
//! | `❌` | missing range, unreadable segment, large linkage gap |
//! | `🔶` | warning: incomplete range, fork issue, short or duplicate segment |
//! | `🆘` / `🆗` | job verdict: holes found / no hole found |

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockFilters, BlockRef};
use crate::config::ChainConfig;
use crate::range::BlockRange;
use crate::store::{ObjectStore, StoreError};

mod batch;
mod segment;

pub use batch::{check_bundles_batch, find_min_max, partition, BatchOptions, BatchReport};
pub use segment::check_bundles;

/// Emit an intermediate "range OK" line every this many bundles.
pub const PROGRESS_INTERVAL: u64 = 10_000;

// ── Options ───────────────────────────────────────────────────────────────────

/// How much of each bundle the scanner looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PrintDetails {
    /// Keys only; bundles are never opened.
    #[default]
    Nothing,
    /// Open bundles, replay linkage, one summary line per block.
    Stats,
    /// As `Stats`, but every block is printed as JSON.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub print_details:        PrintDetails,
    /// Minimum detail level at which short segments are reported.  Some
    /// chains legitimately produce short bundles.
    pub short_segment_detail: PrintDetails,
    /// Walked bundles between intermediate "range OK" lines.
    pub progress_interval:    u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            print_details:        PrintDetails::Nothing,
            short_segment_detail: PrintDetails::Stats,
            progress_interval:    PROGRESS_INTERVAL,
        }
    }
}

/// Everything a scan job needs; cheap to clone into each worker.
#[derive(Clone)]
pub struct ScanContext {
    pub store:       Arc<dyn ObjectStore>,
    /// Shown in the report header, usually the store URL.
    pub store_label: String,
    pub chain:       ChainConfig,
    pub options:     ScanOptions,
    pub cancel:      CancellationToken,
}

impl ScanContext {
    pub fn new(store: Arc<dyn ObjectStore>, store_label: impl Into<String>, chain: ChainConfig) -> Self {
        Self {
            store,
            store_label: store_label.into(),
            chain,
            options: ScanOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// One bounded sub-range of a larger scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanJob {
    pub job_id: u64,
    pub range:  BlockRange,
}

// ── Reports ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub job_id:             u64,
    /// Requested range after clamping to the first streamable block.
    pub range:              BlockRange,
    /// Bundles walked, duplicates excluded.
    pub bundles_seen:       u64,
    pub hole_found:         bool,
    /// Closed ranges of missing blocks, in walk order.
    pub missing:            Vec<BlockRange>,
    /// Bases of bundles overlapping an already-walked range.
    pub duplicates:         Vec<u64>,
    /// Keys whose bundle could not be fully read.
    pub unreadable:         Vec<String>,
    pub short_segments:     Vec<String>,
    pub lowest_block_seen:  Option<u64>,
    pub highest_block_seen: Option<u64>,
    pub last_linked:        Option<BlockRef>,
    pub incomplete:         bool,
    pub fork_issue:         bool,
    pub seen_filters:       Vec<BlockFilters>,
}

impl JobReport {
    fn new(job_id: u64, range: BlockRange) -> Self {
        Self { job_id, range, ..Self::default() }
    }

    /// True when nothing but clean "range OK" verdicts were produced.
    pub fn is_clean(&self) -> bool {
        !self.hole_found
            && !self.incomplete
            && !self.fork_issue
            && self.duplicates.is_empty()
            && self.unreadable.is_empty()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("invalid range: start {start} is after stop {stop}")]
    InvalidRange { start: u64, stop: u64 },
    #[error("invalid batch options: {0}")]
    InvalidOptions(&'static str),
    #[error("no bundle found in store")]
    EmptyStore,
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("scan cancelled")]
    Cancelled,
    #[error("scan worker failed: {0}")]
    Worker(String),
    #[error("unable to write scan output: {0}")]
    Output(#[from] io::Error),
}

impl From<StoreError> for ScanError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Cancelled => ScanError::Cancelled,
            other => ScanError::Store(other),
        }
    }
}
