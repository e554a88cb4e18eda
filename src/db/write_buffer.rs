// ============================================
// Async Write Buffer for Result Store Writes
// ============================================
//
// Decouples probe execution from store latency. Producers queue records on a
// tokio mpsc channel; a background task writes them in batches (every
// FLUSH_INTERVAL_MS or when BATCH_SIZE is reached). A failed write is retried
// on later flushes, up to MAX_WRITE_ATTEMPTS, and relies on the store ignoring
// duplicate ids. Records dropped on a full channel or after the last attempt
// are counted and reported by the next flush.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, interval};

use super::ResultStore;
use crate::error::{DoctorError, Result};
use crate::models::{Issue, RemediationResult, TestResult, TestSuite};

// ============================================
// Configuration
// ============================================

/// Maximum number of records written per flush
const BATCH_SIZE: usize = 100;

/// How often to flush pending records (milliseconds)
const FLUSH_INTERVAL_MS: u64 = 500;

/// How many records can queue before backpressure
const CHANNEL_BUFFER: usize = 10_000;

/// Attempts per record before it is dropped and counted as lost
const MAX_WRITE_ATTEMPTS: u32 = 3;

// ============================================
// Records
// ============================================

#[derive(Debug, Clone)]
pub enum StoreRecord {
    Result(TestResult),
    Suite(TestSuite),
    Issue(Issue),
    Remediation(RemediationResult),
}

impl StoreRecord {
    fn kind(&self) -> &'static str {
        match self {
            StoreRecord::Result(_) => "result",
            StoreRecord::Suite(_) => "suite",
            StoreRecord::Issue(_) => "issue",
            StoreRecord::Remediation(_) => "remediation",
        }
    }
}

enum Command {
    Record(StoreRecord),
    /// Write everything pending and report how many records were not persisted
    Flush(oneshot::Sender<usize>),
}

// ============================================
// Write Buffer Handle (clone-friendly sender)
// ============================================

#[derive(Clone)]
pub struct WriteBufferHandle {
    tx: mpsc::Sender<Command>,
    lost: Arc<AtomicUsize>,
}

impl WriteBufferHandle {
    /// Queue a record. Returns immediately; a full buffer drops the record.
    pub fn queue(&self, record: StoreRecord) {
        if let Err(e) = self.tx.try_send(Command::Record(record)) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.lost.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        "Store write buffer full ({} capacity). Dropping record.",
                        CHANNEL_BUFFER
                    );
                }
                mpsc::error::TrySendError::Closed(_) => {
                    self.lost.fetch_add(1, Ordering::SeqCst);
                    tracing::error!("Store write buffer channel closed unexpectedly");
                }
            }
        }
    }

    /// Queue a record, waiting while the buffer is full.
    pub async fn queue_blocking(&self, record: StoreRecord) -> Result<()> {
        self.tx
            .send(Command::Record(record))
            .await
            .map_err(|_| DoctorError::Store("write buffer is closed".into()))
    }

    /// Write everything queued so far. Returns the number of records not
    /// persisted: those still queued for retry plus those dropped since the
    /// previous flush.
    pub async fn flush(&self) -> Result<usize> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .await
            .map_err(|_| DoctorError::Store("write buffer is closed".into()))?;
        done.await
            .map_err(|_| DoctorError::Store("write buffer stopped before flushing".into()))
    }
}

// ============================================
// Write Buffer (background flush task)
// ============================================

pub struct WriteBuffer {
    store: Arc<dyn ResultStore>,
    rx: mpsc::Receiver<Command>,
    lost: Arc<AtomicUsize>,
}

impl WriteBuffer {
    /// Spawn the write buffer. Returns a handle for sending records.
    pub fn spawn(store: Arc<dyn ResultStore>) -> WriteBufferHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);

        let lost = Arc::new(AtomicUsize::new(0));
        let buffer = WriteBuffer {
            store,
            rx,
            lost: lost.clone(),
        };

        tokio::spawn(async move {
            buffer.run().await;
        });

        tracing::info!(
            "Store write buffer started (batch_size={}, flush_interval={}ms, channel_buffer={})",
            BATCH_SIZE,
            FLUSH_INTERVAL_MS,
            CHANNEL_BUFFER
        );

        WriteBufferHandle { tx, lost }
    }

    /// Main loop: collect records and flush in batches
    async fn run(mut self) {
        let mut pending: Vec<(StoreRecord, u32)> = Vec::with_capacity(BATCH_SIZE);
        let mut flush_timer = interval(Duration::from_millis(FLUSH_INTERVAL_MS));

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(Command::Record(record)) => {
                            pending.push((record, 0));
                            if pending.len() >= BATCH_SIZE {
                                self.flush_batch(&mut pending).await;
                            }
                        }
                        Some(Command::Flush(ack)) => {
                            self.flush_batch(&mut pending).await;
                            let lost = self.lost.swap(0, Ordering::SeqCst);
                            let _ = ack.send(pending.len() + lost);
                        }
                        None => {
                            // Channel closed: one last attempt, then exit
                            self.flush_batch(&mut pending).await;
                            if !pending.is_empty() {
                                tracing::error!(
                                    "Store write buffer shutting down with {} unwritten records",
                                    pending.len()
                                );
                            }
                            tracing::info!("Store write buffer shutting down");
                            return;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if !pending.is_empty() {
                        self.flush_batch(&mut pending).await;
                    }
                }
            }
        }
    }

    /// Write pending records; failures stay queued until MAX_WRITE_ATTEMPTS.
    async fn flush_batch(&self, pending: &mut Vec<(StoreRecord, u32)>) {
        if pending.is_empty() {
            return;
        }

        let count = pending.len();
        let mut retry = Vec::new();
        for (record, attempts) in pending.drain(..) {
            match self.write(&record).await {
                Ok(()) => {}
                Err(e) if attempts + 1 < MAX_WRITE_ATTEMPTS => {
                    tracing::warn!(
                        "Failed to write {} (attempt {}), will retry: {}",
                        record.kind(),
                        attempts + 1,
                        e
                    );
                    retry.push((record, attempts + 1));
                }
                Err(e) => {
                    self.lost.fetch_add(1, Ordering::SeqCst);
                    tracing::error!(
                        "Dropping {} after {} failed writes: {}",
                        record.kind(),
                        MAX_WRITE_ATTEMPTS,
                        e
                    );
                }
            }
        }
        tracing::debug!(
            "Flushed {} store records ({} queued for retry)",
            count - retry.len(),
            retry.len()
        );
        *pending = retry;
    }

    async fn write(&self, record: &StoreRecord) -> Result<()> {
        match record {
            StoreRecord::Result(result) => self.store.save_result(result).await.map(|_| ()),
            StoreRecord::Suite(suite) => self.store.save_suite(suite).await.map(|_| ()),
            StoreRecord::Issue(issue) => self.store.save_issue(issue).await.map(|_| ()),
            StoreRecord::Remediation(result) => {
                self.store.save_remediation(result).await.map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, StoreStatistics};
    use crate::models::{ProbeCategory, TestStatus};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn result() -> TestResult {
        TestResult {
            id: Uuid::new_v4(),
            suite_id: Uuid::nil(),
            server: "srv".into(),
            probe: "ping".into(),
            category: ProbeCategory::Functional,
            status: TestStatus::Passed,
            confidence: 100,
            duration: Duration::from_millis(3),
            timestamp: Utc::now(),
            message: "ok".into(),
            error_message: None,
            suggestions: Vec::new(),
            finding: None,
        }
    }

    /// Fails the first `failures` result writes, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ResultStore for FlakyStore {
        async fn save_result(&self, result: &TestResult) -> Result<Uuid> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(DoctorError::Store("database is locked".into()));
            }
            self.inner.save_result(result).await
        }
        async fn save_suite(&self, suite: &TestSuite) -> Result<Uuid> {
            self.inner.save_suite(suite).await
        }
        async fn query(&self, server: &str, limit: usize) -> Result<Vec<TestResult>> {
            self.inner.query(server, limit).await
        }
        async fn statistics(&self, server: Option<&str>) -> Result<StoreStatistics> {
            self.inner.statistics(server).await
        }
        async fn purge_older_than(&self, days: u32) -> Result<u64> {
            self.inner.purge_older_than(days).await
        }
        async fn get_suite(&self, id: Uuid) -> Result<Option<TestSuite>> {
            self.inner.get_suite(id).await
        }
        async fn latest_suites(&self, server: &str, limit: usize) -> Result<Vec<TestSuite>> {
            self.inner.latest_suites(server, limit).await
        }
        async fn save_issue(&self, issue: &Issue) -> Result<Uuid> {
            self.inner.save_issue(issue).await
        }
        async fn save_remediation(&self, result: &RemediationResult) -> Result<Uuid> {
            self.inner.save_remediation(result).await
        }
        async fn remediations_for(&self, issue_id: Uuid) -> Result<Vec<RemediationResult>> {
            self.inner.remediations_for(issue_id).await
        }
    }

    #[tokio::test]
    async fn test_flush_writes_queued_records() {
        let store = Arc::new(MemoryStore::new());
        let handle = WriteBuffer::spawn(store.clone());
        for _ in 0..5 {
            handle.queue(StoreRecord::Result(result()));
        }
        assert_eq!(handle.flush().await.unwrap(), 0);
        assert_eq!(store.result_count(), 5);
    }

    #[tokio::test]
    async fn test_duplicate_records_are_stored_once() {
        let store = Arc::new(MemoryStore::new());
        let handle = WriteBuffer::spawn(store.clone());
        let r = result();
        handle.queue_blocking(StoreRecord::Result(r.clone())).await.unwrap();
        handle.queue_blocking(StoreRecord::Result(r)).await.unwrap();
        handle.flush().await.unwrap();
        assert_eq!(store.result_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(1),
        });
        let handle = WriteBuffer::spawn(store.clone());
        handle.queue(StoreRecord::Result(result()));

        assert_eq!(handle.flush().await.unwrap(), 1);
        assert_eq!(handle.flush().await.unwrap(), 0);
        assert_eq!(store.inner.result_count(), 1);
    }

    #[tokio::test]
    async fn test_record_dropped_after_max_attempts() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(MAX_WRITE_ATTEMPTS),
        });
        let handle = WriteBuffer::spawn(store.clone());
        handle.queue(StoreRecord::Result(result()));
        let mut unwritten = Vec::new();
        for _ in 0..MAX_WRITE_ATTEMPTS {
            unwritten.push(handle.flush().await.unwrap());
        }
        // Queued for retry twice, then reported once as dropped
        assert_eq!(unwritten, vec![1; MAX_WRITE_ATTEMPTS as usize]);
        assert_eq!(handle.flush().await.unwrap(), 0);
        assert_eq!(store.inner.result_count(), 0);
    }
}
