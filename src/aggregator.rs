//! Ordered log aggregation for concurrent scan jobs.
//!
//! Workers emit [`LogEntry`] values tagged with their job id, in whatever
//! order the scheduler runs them.  [`OrderedLogAggregator`] is a reorder
//! buffer keyed by job id: output for job `k` is written in full, in the
//! order job `k` emitted it, before anything from job `k + 1`.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Write};

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One chunk of report text from a job.  A job's last entry has
/// `is_done = true` (its message may be empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub job_id:  u64,
    pub message: String,
    pub is_done: bool,
}

impl LogEntry {
    pub fn message(job_id: u64, message: impl Into<String>) -> Self {
        Self { job_id, message: message.into(), is_done: false }
    }

    pub fn done(job_id: u64) -> Self {
        Self { job_id, message: String::new(), is_done: true }
    }
}

pub struct OrderedLogAggregator<W: Write> {
    out:            W,
    pending:        BTreeMap<u64, String>,
    done:           HashSet<u64>,
    current_job_id: u64,
    max_job_id:     Option<u64>,
}

impl<W: Write> OrderedLogAggregator<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            pending:        BTreeMap::new(),
            done:           HashSet::new(),
            current_job_id: 0,
            max_job_id:     None,
        }
    }

    /// Job id whose output is currently eligible for flushing.
    pub fn current_job_id(&self) -> u64 {
        self.current_job_id
    }

    /// Number of jobs holding buffered text.
    pub fn buffered_jobs(&self) -> usize {
        self.pending.len()
    }

    /// True once every job seen so far has been flushed and completed.
    pub fn is_drained(&self) -> bool {
        self.max_job_id.map_or(true, |max| self.current_job_id > max)
    }

    pub fn push(&mut self, entry: LogEntry) -> io::Result<()> {
        let LogEntry { job_id, message, is_done } = entry;
        if is_done {
            self.done.insert(job_id);
        }
        self.max_job_id = Some(self.max_job_id.map_or(job_id, |m| m.max(job_id)));

        if job_id == self.current_job_id {
            if let Some(buffered) = self.pending.remove(&job_id) {
                self.out.write_all(buffered.as_bytes())?;
            }
            self.out.write_all(message.as_bytes())?;
            if is_done {
                self.done.remove(&job_id);
                self.current_job_id += 1;
            }
        } else if job_id > self.current_job_id {
            self.pending.entry(job_id).or_default().push_str(&message);
        } else {
            warn!(job_id, current = self.current_job_id, "log entry for a completed job");
            self.out.write_all(message.as_bytes())?;
        }

        while self.done.remove(&self.current_job_id) {
            if let Some(buffered) = self.pending.remove(&self.current_job_id) {
                self.out.write_all(buffered.as_bytes())?;
            }
            self.current_job_id += 1;
        }
        Ok(())
    }

    /// Flush whatever is still buffered (jobs that never completed), in job
    /// order, and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.pending.is_empty() {
            debug!(jobs = self.pending.len(), "flushing output of unfinished jobs");
        }
        for (_, buffered) in std::mem::take(&mut self.pending) {
            self.out.write_all(buffered.as_bytes())?;
        }
        self.out.flush()?;
        Ok(self.out)
    }

    /// Consume entries until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<LogEntry>) -> io::Result<W> {
        while let Some(entry) = rx.recv().await {
            self.push(entry)?;
        }
        self.finish()
    }
}

/// Per-job handle on the shared log channel.
#[derive(Clone, Debug)]
pub struct JobLogger {
    job_id: u64,
    tx:     mpsc::Sender<LogEntry>,
}

impl JobLogger {
    pub fn new(job_id: u64, tx: mpsc::Sender<LogEntry>) -> Self {
        Self { job_id, tx }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Queue report text; waits while the channel is full.
    pub async fn log(&self, message: impl Into<String>) {
        let entry = LogEntry::message(self.job_id, message);
        if self.tx.send(entry).await.is_err() {
            debug!(job_id = self.job_id, "log aggregator is gone, dropping message");
        }
    }

    pub async fn done(&self) {
        if self.tx.send(LogEntry::done(self.job_id)).await.is_err() {
            debug!(job_id = self.job_id, "log aggregator is gone, dropping completion");
        }
    }
}
