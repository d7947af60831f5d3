mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockbundle::block::encode_block;
use blockbundle::bundler::{BundleWriter, BundlerOptions};
use blockbundle::config::ChainConfig;
use blockbundle::ingest::{
    download_blocks, BlockStreamClient, BlocksRequest, BlocksResponse, ForkStep, IngestError, IngestOptions,
    RecordDecoder, ResponseStream, StreamError,
};
use blockbundle::store::MemoryStore;
use bytes::Bytes;
use common::block;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type Script = Vec<Result<BlocksResponse, StreamError>>;

/// Serves one scripted stream per `blocks()` call.
#[derive(Default)]
struct ScriptedClient {
    scripts:  Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<BlocksRequest>>,
}

impl ScriptedClient {
    fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self { scripts: Mutex::new(scripts.into_iter().collect()), ..Self::default() }
    }
}

#[async_trait]
impl BlockStreamClient for ScriptedClient {
    async fn blocks(&self, request: BlocksRequest) -> Result<ResponseStream, StreamError> {
        self.requests.lock().push(request);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| StreamError::Unavailable("connection refused".into()))?;
        Ok(stream::iter(script).boxed())
    }
}

fn response(n: u64) -> Result<BlocksResponse, StreamError> {
    Ok(BlocksResponse {
        block:  Bytes::from(encode_block(&block(n)).unwrap()),
        step:   ForkStep::Irreversible,
        cursor: format!("cursor-{n}"),
    })
}

fn bundle_writer(store: &MemoryStore, stop: Option<u64>) -> BundleWriter {
    let options = BundlerOptions { stop_block_num: stop, ..BundlerOptions::default() };
    BundleWriter::new(Arc::new(store.clone()), ChainConfig::default(), options)
}

fn options(stop_block: u64) -> IngestOptions {
    IngestOptions { start_block: 0, stop_block, ..IngestOptions::default() }
}

#[tokio::test(start_paused = true)]
async fn retries_after_stream_error_and_resumes() {
    let mut first: Script = (0..150).map(response).collect();
    first.push(Err(StreamError::Remote("connection reset".into())));
    let second: Script = (140..300).map(response).collect();
    let client = ScriptedClient::new([first, second]);
    let store = MemoryStore::new();
    let mut writer = bundle_writer(&store, None);

    let started = tokio::time::Instant::now();
    let summary = download_blocks(&client, &RecordDecoder, &mut writer, &options(300), &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(4));
    assert_eq!(summary.retries, 1);
    assert_eq!(summary.skipped, 10);
    assert_eq!(summary.last_block, Some(299));
    assert_eq!(summary.cursor, "cursor-299");
    assert_eq!(summary.bundles_written, 3);
    assert_eq!(store.keys(), vec!["0000000000", "0000000100", "0000000200"]);

    let requests = client.requests.lock();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].cursor, "");
    assert_eq!(requests[1].cursor, "cursor-149");
    assert_eq!(requests[1].fork_steps, vec![ForkStep::Irreversible]);
    assert_eq!(requests[1].stop_block_num, 300);
}

#[tokio::test]
async fn failing_to_connect_is_fatal() {
    let client = ScriptedClient::new([]);
    let mut writer = bundle_writer(&MemoryStore::new(), None);

    let res = download_blocks(&client, &RecordDecoder, &mut writer, &options(0), &CancellationToken::new()).await;
    assert!(matches!(res, Err(IngestError::Connect(StreamError::Unavailable(_)))));
}

#[tokio::test]
async fn undecodable_response_is_fatal() {
    let garbage = Ok(BlocksResponse {
        block:  Bytes::from_static(b"not a block"),
        step:   ForkStep::Irreversible,
        cursor: "c".into(),
    });
    let client = ScriptedClient::new([vec![response(0), garbage]]);
    let mut writer = bundle_writer(&MemoryStore::new(), None);

    let res = download_blocks(&client, &RecordDecoder, &mut writer, &options(0), &CancellationToken::new()).await;
    assert!(matches!(res, Err(IngestError::Decode(_))));
}

#[tokio::test]
async fn misaligned_stream_start_is_fatal() {
    let client = ScriptedClient::new([(150..160).map(response).collect()]);
    let mut writer = bundle_writer(&MemoryStore::new(), None);

    let res = download_blocks(&client, &RecordDecoder, &mut writer, &options(0), &CancellationToken::new()).await;
    assert!(matches!(res, Err(IngestError::Bundle(_))));
}

#[tokio::test]
async fn stop_block_ends_ingest() {
    let client = ScriptedClient::new([(0..400).map(response).collect()]);
    let store = MemoryStore::new();
    let mut writer = bundle_writer(&store, Some(150));

    let summary = download_blocks(&client, &RecordDecoder, &mut writer, &options(150), &CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.end_of_stream);
    assert_eq!(summary.last_block, Some(149));
    assert_eq!(store.keys(), vec!["0000000000", "0000000100"]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff() {
    let client = ScriptedClient::new([vec![Err(StreamError::Remote("boom".into()))]]);
    let mut writer = bundle_writer(&MemoryStore::new(), None);
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        })
    };
    let res = download_blocks(&client, &RecordDecoder, &mut writer, &options(0), &cancel).await;
    canceller.await.unwrap();

    assert!(matches!(res, Err(IngestError::Cancelled)));
    assert_eq!(client.requests.lock().len(), 1);
}

#[tokio::test]
async fn start_block_beyond_signed_range_is_rejected() {
    let client = ScriptedClient::new([(0..10).map(response).collect()]);
    let mut writer = bundle_writer(&MemoryStore::new(), None);
    let options = IngestOptions { start_block: u64::MAX, ..IngestOptions::default() };

    let res = download_blocks(&client, &RecordDecoder, &mut writer, &options, &CancellationToken::new()).await;

    assert!(matches!(res, Err(IngestError::StartBlockOutOfRange(u64::MAX))));
    assert!(client.requests.lock().is_empty());
}
