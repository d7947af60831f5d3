//! Batch driver: split a range into fixed-size jobs and run them on a
//! bounded pool of workers, with output reassembled in job order.
//!
//! Lifecycle: workers pull from a job queue of capacity `workers`; every
//! submitted job holds a permit of the in-flight semaphore until it
//! completes.  Once all jobs are submitted the dispatcher takes back every
//! permit (i.e. waits for completion), closes the queue, joins the workers
//! and finally drops its log sender so the aggregator can drain and exit.

use std::io::Write;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregator::{JobLogger, LogEntry, OrderedLogAggregator};
use crate::config::ChainConfig;
use crate::range::{parse_bundle_base, BlockRange};
use crate::store::{cancellable, ObjectStore};

use super::{check_bundles, JobReport, ScanContext, ScanError, ScanJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Width of every job's range, except the last which takes the remainder.
    pub batch_size: u64,
    pub workers:    usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { batch_size: 100_000, workers: 4 }
    }
}

impl BatchOptions {
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.batch_size == 0 {
            return Err(ScanError::InvalidOptions("batch size must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(ScanError::InvalidOptions("worker count must be greater than zero"));
        }
        Ok(())
    }
}

/// Result of a batch scan: every job's report in job order, plus the sink
/// the aggregated output was written to.
#[derive(Debug)]
pub struct BatchReport<W> {
    pub range:  BlockRange,
    pub jobs:   Vec<JobReport>,
    pub output: W,
}

impl<W> BatchReport<W> {
    pub fn hole_found(&self) -> bool {
        self.jobs.iter().any(|j| j.hole_found)
    }

    pub fn missing(&self) -> impl Iterator<Item = &BlockRange> {
        self.jobs.iter().flat_map(|j| j.missing.iter())
    }
}

/// Split `[start, stop)` into `ceil((stop - start) / batch_size)` jobs.
pub fn partition(start: u64, stop: u64, batch_size: u64) -> Vec<ScanJob> {
    if stop <= start || batch_size == 0 {
        return Vec::new();
    }
    let batch_count = (stop - start).div_ceil(batch_size);
    (0..batch_count)
        .map(|j| {
            let job_start = start + j * batch_size;
            let job_stop  = job_start.saturating_add(batch_size).min(stop);
            ScanJob { job_id: j, range: BlockRange::new(job_start, job_stop) }
        })
        .collect()
}

/// Bounds of everything in the store: lowest bundle base, and one past the
/// highest bundle's last block.
pub async fn find_min_max(
    store:  &dyn ObjectStore,
    chain:  &ChainConfig,
    cancel: &CancellationToken,
) -> Result<(u64, u64), ScanError> {
    let keys = cancellable(cancel, store.list("")).await?;
    let mut bounds: Option<(u64, u64)> = None;
    for base in keys.iter().filter_map(|k| parse_bundle_base(k)) {
        let end = base.saturating_add(chain.bundle_size);
        bounds = Some(match bounds {
            None             => (base, end),
            Some((min, max)) => (min.min(base), max.max(end)),
        });
    }
    bounds.ok_or(ScanError::EmptyStore)
}

type JobQueue = Arc<Mutex<mpsc::Receiver<(ScanJob, OwnedSemaphorePermit)>>>;

/// Scan `range` in parallel.  Report text goes to `out` in job order.
///
/// A failing job does not stop the others; once everything has drained,
/// the last job error seen is returned.
pub async fn check_bundles_batch<W>(
    ctx:     ScanContext,
    range:   BlockRange,
    options: BatchOptions,
    out:     W,
) -> Result<BatchReport<W>, ScanError>
where
    W: Write + Send + 'static,
{
    options.validate()?;
    if range.is_bounded() && range.start > range.stop {
        return Err(ScanError::InvalidRange { start: range.start, stop: range.stop });
    }

    let range = if range.is_unbounded() {
        let (min, max) = find_min_max(ctx.store.as_ref(), &ctx.chain, &ctx.cancel).await?;
        BlockRange::new(min.max(range.start), max)
    } else {
        range
    };
    let jobs = partition(range.start, range.stop, options.batch_size);
    let job_count = jobs.len();
    info!(block_range = %range, jobs = job_count, workers = options.workers, "starting batch scan");

    let workers = options.workers;
    let (log_tx, log_rx) = mpsc::channel::<LogEntry>(workers * 2);
    let aggregator = tokio::spawn(OrderedLogAggregator::new(out).run(log_rx));

    let (job_tx, job_rx) = mpsc::channel(workers);
    let job_rx: JobQueue = Arc::new(Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    let in_flight = Arc::new(Semaphore::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|worker_id| {
            tokio::spawn(worker(worker_id, ctx.clone(), job_rx.clone(), log_tx.clone(), result_tx.clone()))
        })
        .collect();
    drop(result_tx);

    let mut last_error = None;
    for job in jobs {
        if ctx.cancel.is_cancelled() {
            last_error = Some(ScanError::Cancelled);
            break;
        }
        let permit = in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ScanError::Worker(e.to_string()))?;
        if job_tx.send((job, permit)).await.is_err() {
            last_error = Some(ScanError::Worker("all scan workers exited".to_string()));
            break;
        }
    }

    // Waits for every submitted job to give its permit back.
    let all_done = in_flight
        .acquire_many(workers as u32)
        .await
        .map_err(|e| ScanError::Worker(e.to_string()))?;
    drop(all_done);
    drop(job_tx);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "scan worker panicked");
            last_error = Some(ScanError::Worker(e.to_string()));
        }
    }

    let mut reports = Vec::with_capacity(job_count);
    while let Some(res) = result_rx.recv().await {
        match res {
            Ok(report) => reports.push(report),
            Err(e) => last_error = Some(e),
        }
    }
    reports.sort_by_key(|r: &JobReport| r.job_id);

    drop(log_tx);
    let output = aggregator
        .await
        .map_err(|e| ScanError::Worker(e.to_string()))??;

    if let Some(e) = last_error {
        return Err(e);
    }
    info!(jobs = reports.len(), holes = reports.iter().filter(|r| r.hole_found).count(), "batch scan finished");
    Ok(BatchReport { range, jobs: reports, output })
}

async fn worker(
    worker_id: usize,
    ctx:       ScanContext,
    jobs:      JobQueue,
    logs:      mpsc::Sender<LogEntry>,
    results:   mpsc::UnboundedSender<Result<JobReport, ScanError>>,
) {
    loop {
        let next = jobs.lock().await.recv().await;
        let Some((job, permit)) = next else { break };

        let logger = JobLogger::new(job.job_id, logs.clone());
        let res = check_bundles(&ctx, &job, &logger).await;
        if let Err(e) = &res {
            error!(worker_id, job_id = job.job_id, block_range = %job.range, error = %e, "scan job failed");
        }
        let _ = results.send(res);
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_batch_takes_remainder() {
        let jobs = partition(100, 1_050, 300);
        let ranges: Vec<_> = jobs.iter().map(|j| (j.job_id, j.range.start, j.range.stop)).collect();
        assert_eq!(ranges, vec![(0, 100, 400), (1, 400, 700), (2, 700, 1_000), (3, 1_000, 1_050)]);
    }

    #[test]
    fn exact_multiple() {
        assert_eq!(partition(0, 600, 200).len(), 3);
        assert!(partition(10, 10, 5).is_empty());
    }

    #[test]
    fn huge_batch_size_is_one_job() {
        let jobs = partition(1, 100, u64::MAX);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].range, BlockRange::new(1, 100));
    }

    #[test]
    fn rejects_zero_options() {
        assert!(BatchOptions { batch_size: 0, workers: 1 }.validate().is_err());
        assert!(BatchOptions { batch_size: 1, workers: 0 }.validate().is_err());
    }
}
