//! Per-bucket job serializer.
//!
//! Jobs enqueued under one bucket run strictly in arrival order, each to
//! completion or timeout, while buckets run independently. The primary
//! user is the signal layer: all session IO for one peer address goes
//! through that peer's bucket, so no two operations mutate the same
//! session concurrently.

use futures::future::BoxFuture;
use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{Result, WireError};

/// Default per-job hard timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(15);

/// Drained-item count at which the queue head is spliced off.
const SPLICE_THRESHOLD: usize = 10_000;

type Job = BoxFuture<'static, ()>;

struct Bucket {
    queue: Vec<Option<Job>>,
    head: usize,
    running: bool,
}

impl Bucket {
    fn new() -> Self {
        Self {
            queue: Vec::new(),
            head: 0,
            running: false,
        }
    }
}

struct Shared {
    buckets: Mutex<HashMap<String, Bucket>>,
    timeout: Duration,
    #[cfg(test)]
    splices: std::sync::atomic::AtomicUsize,
}

/// Handle to the queue; clones share the bucket map.
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_TIMEOUT)
    }
}

impl JobQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                buckets: Mutex::new(HashMap::new()),
                timeout,
                #[cfg(test)]
                splices: std::sync::atomic::AtomicUsize::new(0),
            }),
        }
    }

    /// Enqueue `work` under `bucket` and await its result.
    ///
    /// A job that outlives the queue timeout is abandoned and reported as
    /// [`WireError::Timeout`]; the bucket continues with the next job.
    pub async fn enqueue<T, F>(&self, bucket: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let result = work.await;
            let _ = tx.send(result);
        });

        let start_executor = {
            let mut buckets = self.shared.buckets.lock().expect("bucket lock");
            let state = buckets.entry(bucket.to_string()).or_insert_with(Bucket::new);
            state.queue.push(Some(job));
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };

        if start_executor {
            let shared = self.shared.clone();
            let bucket = bucket.to_string();
            tokio::spawn(async move {
                run_bucket(shared, bucket).await;
            });
        }

        match rx.await {
            Ok(result) => result,
            // sender dropped: the job timed out or the queue went away
            Err(_) => Err(WireError::Timeout),
        }
    }

    /// Number of live buckets, for assertions in tests.
    pub fn bucket_count(&self) -> usize {
        self.shared.buckets.lock().expect("bucket lock").len()
    }
}

/// Executor for one bucket: pops in arrival order until the queue drains,
/// then removes the bucket entry atomically.
async fn run_bucket(shared: Arc<Shared>, bucket: String) {
    loop {
        let job = {
            let mut buckets = shared.buckets.lock().expect("bucket lock");
            let state = match buckets.get_mut(&bucket) {
                Some(state) => state,
                None => return,
            };

            if state.head >= state.queue.len() {
                // drained: drop the bucket while still holding the lock
                buckets.remove(&bucket);
                return;
            }

            let job = state.queue[state.head].take();
            state.head += 1;

            // bound memory: periodically splice off the consumed head
            if state.head >= SPLICE_THRESHOLD {
                state.queue.drain(..state.head);
                state.head = 0;
                #[cfg(test)]
                shared
                    .splices
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }

            job
        };

        let Some(job) = job else { continue };
        if tokio::time::timeout(shared.timeout, job).await.is_err() {
            warn!(target: "JobQueue", "job in bucket {bucket} exceeded timeout, continuing");
        }
    }
}
