#![allow(dead_code)]

use std::sync::Arc;

use blockbundle::block::Block;
use blockbundle::codec::{encode_segment, CodecId, DEFAULT_COMPRESSION_LEVEL};
use blockbundle::config::ChainConfig;
use blockbundle::range::{bundle_key, BlockRange};
use blockbundle::scan::{check_bundles_batch, BatchOptions, BatchReport, PrintDetails, ScanContext, ScanOptions};
use blockbundle::store::MemoryStore;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Block `n` whose parent is block `n - 1`.
pub fn block(n: u64) -> Block {
    Block {
        number:        n,
        id:            format!("{n:08x}"),
        parent_id:     format!("{:08x}", n.saturating_sub(1)),
        parent_number: n.saturating_sub(1),
        lib_num:       n.saturating_sub(1),
        timestamp:     DateTime::<Utc>::from_timestamp(1_600_000_000 + n as i64, 0).unwrap(),
        filters:       None,
        payload:       Bytes::from(n.to_le_bytes().to_vec()),
    }
}

/// Every block a full bundle starting at `base` holds.
pub fn bundle_blocks(chain: &ChainConfig, base: u64) -> Vec<Block> {
    let first = base.max(chain.first_streamable_block);
    (first..base + chain.bundle_size).map(block).collect()
}

pub fn put_bundle(store: &MemoryStore, base: u64, blocks: &[Block]) {
    let data = encode_segment(blocks, CodecId::Zstd, DEFAULT_COMPRESSION_LEVEL).unwrap();
    store.insert(bundle_key(base), data);
}

/// A store holding complete bundles at `bases`.
pub fn bundle_store(chain: &ChainConfig, bases: impl IntoIterator<Item = u64>) -> MemoryStore {
    let store = MemoryStore::new();
    for base in bases {
        put_bundle(&store, base, &bundle_blocks(chain, base));
    }
    store
}

pub async fn scan(
    store:   &MemoryStore,
    chain:   ChainConfig,
    range:   BlockRange,
    batch:   BatchOptions,
    details: PrintDetails,
) -> (BatchReport<Vec<u8>>, String) {
    let options = ScanOptions { print_details: details, ..ScanOptions::default() };
    scan_with(store, chain, range, batch, options).await
}

pub async fn scan_with(
    store:   &MemoryStore,
    chain:   ChainConfig,
    range:   BlockRange,
    batch:   BatchOptions,
    options: ScanOptions,
) -> (BatchReport<Vec<u8>>, String) {
    let ctx = ScanContext::new(Arc::new(store.clone()), "memory://test", chain).with_options(options);
    let report = check_bundles_batch(ctx, range, batch, Vec::new()).await.unwrap();
    let text = String::from_utf8(report.output.clone()).unwrap();
    (report, text)
}
