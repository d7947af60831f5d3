mod common;

use std::sync::Arc;

use blockbundle::block::{Block, RecordError, MAX_RECORD_SIZE};
use blockbundle::bundler::{BoxError, BundleError, BundleWriter, BundlerOptions, Progress, TransformHook};
use blockbundle::codec::{decode_segment, encode_segment, CodecError, CodecId};
use blockbundle::config::ChainConfig;
use blockbundle::range::BlockRange;
use blockbundle::rewrite::{merge_one_block_files, normalize_bundles, RewriteError, RewriteOptions};
use blockbundle::scan::{find_min_max, BatchOptions, PrintDetails};
use blockbundle::store::{MemoryStore, ObjectStore};
use common::{block, bundle_store, scan};
use tokio_util::sync::CancellationToken;

fn writer(store: &MemoryStore, stop: Option<u64>) -> BundleWriter {
    let options = BundlerOptions { stop_block_num: stop, ..BundlerOptions::default() };
    BundleWriter::new(Arc::new(store.clone()), ChainConfig::default(), options)
}

async fn bundle_numbers(store: &MemoryStore, key: &str) -> Vec<u64> {
    let data = store.open(key).await.unwrap();
    decode_segment(&data).unwrap().iter().map(|b| b.number).collect()
}

// ── Bundler ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_full_bundles_from_aligned_stream() {
    let store = MemoryStore::new();
    let mut w = writer(&store, None);

    let mut flushed = Vec::new();
    for n in 100..300 {
        if let Progress::Flushed(key) = w.process(block(n)).await.unwrap() {
            flushed.push(key);
        }
    }

    assert_eq!(flushed, vec!["0000000100", "0000000200"]);
    assert_eq!(store.keys(), vec!["0000000100", "0000000200"]);
    assert_eq!(bundle_numbers(&store, "0000000100").await, (100..200).collect::<Vec<_>>());
    assert_eq!(bundle_numbers(&store, "0000000200").await, (200..300).collect::<Vec<_>>());
    assert!(w.pending().is_empty());
}

#[tokio::test]
async fn partial_bundle_stays_buffered() {
    let store = MemoryStore::new();
    let mut w = writer(&store, None);
    for n in 100..350 {
        w.process(block(n)).await.unwrap();
    }
    assert_eq!(store.len(), 2);
    assert_eq!(w.pending().len(), 50);
    assert_eq!(w.low_block_num(), Some(300));
}

#[tokio::test]
async fn stop_block_flushes_partial_bundle() {
    let store = MemoryStore::new();
    let mut w = writer(&store, Some(250));

    let mut last = Progress::Buffered;
    for n in 100..300 {
        last = w.process(block(n)).await.unwrap();
        if last == Progress::EndOfStream {
            break;
        }
    }

    assert_eq!(last, Progress::EndOfStream);
    assert_eq!(w.written_keys(), ["0000000100", "0000000200"]);
    assert_eq!(bundle_numbers(&store, "0000000200").await, (200..250).collect::<Vec<_>>());
}

#[tokio::test]
async fn misaligned_first_block_is_rejected() {
    let store = MemoryStore::new();
    let mut w = writer(&store, None);
    let err = w.process(block(150)).await.unwrap_err();
    assert!(matches!(err, BundleError::UnexpectedFirstBlock { number: 150, first_streamable: 0 }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn lz4_bundles_read_back() {
    let store = MemoryStore::new();
    let options = BundlerOptions { codec: CodecId::Lz4, ..BundlerOptions::default() };
    let mut w = BundleWriter::new(Arc::new(store.clone()), ChainConfig::default(), options);
    for n in 0..100 {
        w.process(block(n)).await.unwrap();
    }
    assert_eq!(bundle_numbers(&store, "0000000000").await.len(), 100);
}

#[tokio::test]
async fn oversized_block_fails_the_flush() {
    let store = MemoryStore::new();
    let chain = ChainConfig::new(1, 0).unwrap();
    let mut w = BundleWriter::new(Arc::new(store.clone()), chain, BundlerOptions::default());

    let mut huge = block(0);
    huge.payload = bytes::Bytes::from(vec![0u8; MAX_RECORD_SIZE as usize + 1]);
    let err = w.process(huge).await.unwrap_err();

    assert!(matches!(err, BundleError::Codec(CodecError::Record(RecordError::Oversized(_)))));
    assert!(store.is_empty());
}

// ── Normalize ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn identity_normalize_preserves_coverage() {
    let chain = ChainConfig::default();
    let source = bundle_store(&chain, (0..5).map(|i| i * 100));
    let dest = MemoryStore::new();
    let cancel = CancellationToken::new();

    let identity: TransformHook = Box::new(|b: Block| -> Result<Block, BoxError> { Ok(b) });
    let summary = normalize_bundles(
        &source,
        Arc::new(dest.clone()),
        chain,
        BlockRange::unbounded(0),
        Some(identity),
        RewriteOptions::default(),
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(summary.blocks_read, 500);
    assert_eq!(summary.pending_blocks, 0);
    assert_eq!(dest.keys(), source.keys());
    assert_eq!(
        find_min_max(&dest, &chain, &cancel).await.unwrap(),
        find_min_max(&source, &chain, &cancel).await.unwrap()
    );
    for key in dest.keys() {
        assert_eq!(
            decode_segment(&dest.open(&key).await.unwrap()).unwrap(),
            decode_segment(&source.open(&key).await.unwrap()).unwrap()
        );
    }

    let (report, _) = scan(&dest, chain, BlockRange::new(0, 500), BatchOptions::default(), PrintDetails::Stats).await;
    assert!(!report.hole_found());
    assert!(report.jobs.iter().all(|j| j.is_clean()));
}

#[tokio::test]
async fn normalize_applies_transform_and_stops() {
    let chain = ChainConfig::default();
    let source = bundle_store(&chain, (0..5).map(|i| i * 100));
    let dest = MemoryStore::new();

    let tweak: TransformHook = Box::new(|mut b: Block| -> Result<Block, BoxError> {
        b.payload = bytes::Bytes::from_static(b"normalized");
        Ok(b)
    });
    let summary = normalize_bundles(
        &source,
        Arc::new(dest.clone()),
        chain,
        BlockRange::new(100, 250),
        Some(tweak),
        RewriteOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(summary.end_of_stream);
    assert_eq!(summary.bundles_written, vec!["0000000100", "0000000200"]);
    let blocks = decode_segment(&dest.open("0000000200").await.unwrap()).unwrap();
    assert_eq!(blocks.len(), 50);
    assert!(blocks.iter().all(|b| &b.payload[..] == b"normalized"));
}

#[tokio::test]
async fn normalize_reports_trailing_partial_bundle() {
    let chain = ChainConfig::default();
    let source = bundle_store(&chain, [0, 100]);
    common::put_bundle(&source, 200, &(200..240).map(block).collect::<Vec<_>>());
    let dest = MemoryStore::new();

    let summary = normalize_bundles(
        &source,
        Arc::new(dest.clone()),
        chain,
        BlockRange::unbounded(0),
        None,
        RewriteOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(!summary.end_of_stream);
    assert_eq!(dest.keys(), vec!["0000000000", "0000000100"]);
    assert_eq!(summary.pending_blocks, 40);
    assert_eq!(summary.pending_range, Some(BlockRange::new(200, 239)));
}

#[tokio::test]
async fn normalize_requires_boundary_start() {
    let chain = ChainConfig::default();
    let res = normalize_bundles(
        &MemoryStore::new(),
        Arc::new(MemoryStore::new()),
        chain,
        BlockRange::new(150, 300),
        None,
        RewriteOptions::default(),
        &CancellationToken::new(),
    )
    .await;
    assert!(matches!(res, Err(RewriteError::Misaligned { start: 150, bundle_size: 100 })));
}

// ── Merge ────────────────────────────────────────────────────────────────────

fn one_block_store(numbers: impl IntoIterator<Item = u64>) -> MemoryStore {
    let store = MemoryStore::new();
    for n in numbers {
        let b = block(n);
        let data = encode_segment([&b], CodecId::None, 0).unwrap();
        store.insert(format!("{:010}-{}-{}", n, b.id, b.parent_id), data);
    }
    store
}

#[tokio::test]
async fn merge_one_block_files_into_bundles() {
    let chain = ChainConfig::default();
    let source = one_block_store(100..231);
    let dest = MemoryStore::new();
    let options = RewriteOptions { delete_source: true, ..RewriteOptions::default() };

    let summary = merge_one_block_files(
        &source,
        Arc::new(dest.clone()),
        chain,
        BlockRange::new(100, 200),
        options,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(summary.end_of_stream);
    assert_eq!(dest.keys(), vec!["0000000100"]);
    assert_eq!(bundle_numbers(&dest, "0000000100").await, (100..200).collect::<Vec<_>>());
    assert_eq!(summary.objects_deleted, 100);
    assert_eq!(source.len(), 31);
}

#[tokio::test]
async fn merge_skips_forked_duplicates() {
    let chain = ChainConfig::default();
    let source = one_block_store(0..100);
    let mut fork = block(50);
    fork.id = "fork".into();
    source.insert(
        "0000000050-fork-00000031",
        encode_segment([&fork], CodecId::None, 0).unwrap(),
    );
    let dest = MemoryStore::new();

    let summary = merge_one_block_files(
        &source,
        Arc::new(dest.clone()),
        chain,
        BlockRange::new(0, 100),
        RewriteOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.blocks_skipped, 1);
    assert_eq!(dest.keys(), vec!["0000000000"]);
    assert_eq!(bundle_numbers(&dest, "0000000000").await.len(), 100);
}

#[tokio::test]
async fn merge_requires_boundary_start() {
    let res = merge_one_block_files(
        &MemoryStore::new(),
        Arc::new(MemoryStore::new()),
        ChainConfig::default(),
        BlockRange::new(150, 300),
        RewriteOptions::default(),
        &CancellationToken::new(),
    )
    .await;
    assert!(matches!(res, Err(RewriteError::Misaligned { .. })));
}
