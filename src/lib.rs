pub mod range;
pub mod config;
pub mod block;
pub mod codec;
pub mod store;
pub mod linkage;
pub mod aggregator;
pub mod scan;
pub mod bundler;
pub mod ingest;
pub mod rewrite;
pub mod compare;

pub use range::{bundle_key, parse_bundle_base, BlockRange};
pub use config::ChainConfig;
pub use block::{Block, BlockRef, decode_block, encode_block};
pub use codec::{CodecId, SegmentReader, SegmentWriter};
pub use store::{open_store, LocalStore, MemoryStore, ObjectStore};
pub use aggregator::{LogEntry, OrderedLogAggregator};
pub use scan::{check_bundles, check_bundles_batch, BatchOptions, PrintDetails, ScanContext, ScanOptions};
pub use bundler::{BundleWriter, BundlerOptions, Progress};
pub use ingest::{download_blocks, BlockStreamClient, IngestOptions};
pub use rewrite::{merge_one_block_files, normalize_bundles, RewriteOptions};
pub use compare::compare_block_files;
