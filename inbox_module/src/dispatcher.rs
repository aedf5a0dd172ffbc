//! Background processing of accepted messages.
//!
//! Jobs for one conversation always land on the same worker, so replies
//! within a conversation are produced in arrival order. Cross-process
//! exclusion is the pipeline's lease.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::Platform;
use crate::config::DispatchConfig;
use crate::store::StoreError;

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_LEASE_POLL: Duration = Duration::from_millis(500);

/// One accepted inbound message awaiting a reply decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub platform: Platform,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        platform: Platform,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            platform,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("conversation {0} is leased by another worker")]
    LeaseBusy(String),
    #[error("dispatcher stopped")]
    Stopped,
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Store(err) => err.is_retryable(),
            DispatchError::LeaseBusy(_) => true,
            DispatchError::Stopped => false,
        }
    }
}

pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &Job) -> Result<(), DispatchError>;
}

/// Submits jobs to the worker shards. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    shards: Arc<Vec<Sender<Job>>>,
    handler: Arc<dyn JobHandler>,
    settings: DispatchConfig,
}

pub struct DispatcherControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl DispatcherControl {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Signals the workers, lets them drain queued jobs, and waits for them.
    pub fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Dispatcher {
    /// Spawns `settings.workers` shard threads. With zero workers every job
    /// runs on the submitting thread.
    pub fn start(
        settings: &DispatchConfig,
        handler: Arc<dyn JobHandler>,
    ) -> (Dispatcher, DispatcherControl) {
        let stop = Arc::new(AtomicBool::new(false));
        let mut shards = Vec::with_capacity(settings.workers);
        let mut handles = Vec::with_capacity(settings.workers);

        for shard in 0..settings.workers {
            let (sender, receiver) = bounded::<Job>(settings.queue_capacity.max(1));
            let handler = handler.clone();
            let stop = stop.clone();
            let settings = settings.clone();
            let handle = thread::spawn(move || {
                info!("dispatch worker started shard={}", shard);
                run_worker(shard, receiver, handler.as_ref(), &settings, &stop);
                info!("dispatch worker stopped shard={}", shard);
            });
            shards.push(sender);
            handles.push(handle);
        }

        let dispatcher = Dispatcher {
            shards: Arc::new(shards),
            handler,
            settings: settings.clone(),
        };
        (dispatcher, DispatcherControl { stop, handles })
    }

    /// Queues the job on its conversation's shard, blocking while the shard
    /// is full.
    pub fn submit(&self, job: Job) -> Result<(), DispatchError> {
        if self.shards.is_empty() {
            run_with_retry(self.handler.as_ref(), &job, &self.settings);
            return Ok(());
        }
        let shard = shard_for(&job.conversation_id, self.shards.len());
        debug!(
            "job queued job_id={} conversation_id={} shard={}",
            job.id, job.conversation_id, shard
        );
        self.shards[shard]
            .send(job)
            .map_err(|_| DispatchError::Stopped)
    }

    pub fn worker_count(&self) -> usize {
        self.shards.len()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.shards.len())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Stable across runs, unlike `RandomState`.
pub fn shard_for(conversation_id: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    conversation_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

fn run_worker(
    shard: usize,
    receiver: Receiver<Job>,
    handler: &dyn JobHandler,
    settings: &DispatchConfig,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Relaxed) {
        match receiver.recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(job) => {
                run_with_retry(handler, &job, settings);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
    let pending: Vec<Job> = receiver.try_iter().collect();
    if !pending.is_empty() {
        info!("dispatch worker draining shard={} jobs={}", shard, pending.len());
    }
    for job in pending {
        run_with_retry(handler, &job, settings);
    }
}

/// Runs the job, retrying transient failures with exponential backoff.
/// A busy conversation lease does not count as a failed attempt: the job
/// keeps polling until the lease could have expired. Returns whether the
/// job eventually succeeded.
pub(crate) fn run_with_retry(handler: &dyn JobHandler, job: &Job, settings: &DispatchConfig) -> bool {
    let max_attempts = settings.max_attempts.max(1);
    let mut failures = 0u32;
    let mut lease_polls = 0u32;
    let mut lease_deadline: Option<Instant> = None;
    loop {
        let err = match handler.handle(job) {
            Ok(()) => return true,
            Err(err) => err,
        };

        if let DispatchError::LeaseBusy(_) = err {
            let deadline =
                *lease_deadline.get_or_insert_with(|| Instant::now() + lease_wait(settings));
            let now = Instant::now();
            if now < deadline {
                lease_polls += 1;
                let delay = backoff(settings.retry_backoff_ms, lease_polls)
                    .min(MAX_LEASE_POLL)
                    .min(deadline - now);
                debug!(
                    "waiting for conversation lease job_id={} conversation_id={} poll={} retry_in_ms={}",
                    job.id,
                    job.conversation_id,
                    lease_polls,
                    delay.as_millis()
                );
                thread::sleep(delay);
                continue;
            }
            error!(
                "job abandoned job_id={} conversation_id={} message_id={} lease_polls={}: {}",
                job.id, job.conversation_id, job.message_id, lease_polls, err
            );
            return false;
        }

        failures += 1;
        if err.is_retryable() && failures < max_attempts {
            let delay = backoff(settings.retry_backoff_ms, failures);
            warn!(
                "job failed job_id={} conversation_id={} attempt={}/{} retry_in_ms={}: {}",
                job.id,
                job.conversation_id,
                failures,
                max_attempts,
                delay.as_millis(),
                err
            );
            thread::sleep(delay);
            continue;
        }
        error!(
            "job abandoned job_id={} conversation_id={} message_id={} attempts={}: {}",
            job.id, job.conversation_id, job.message_id, failures, err
        );
        return false;
    }
}

/// Long enough for a lease taken with the configured TTL to lapse, plus one
/// poll to pick it up.
fn lease_wait(settings: &DispatchConfig) -> Duration {
    Duration::from_secs(settings.lease_secs.max(1) as u64) + MAX_LEASE_POLL
}

fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << (attempt - 1).min(10));
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    impl JobHandler for Recorder {
        fn handle(&self, job: &Job) -> Result<(), DispatchError> {
            self.seen
                .lock()
                .expect("lock")
                .push((job.conversation_id.clone(), job.message_id.clone()));
            Ok(())
        }
    }

    struct Flaky {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        retryable: bool,
    }

    impl JobHandler for Flaky {
        fn handle(&self, job: &Job) -> Result<(), DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            if self.retryable {
                Err(DispatchError::Store(StoreError::Conflict {
                    entity: "conversation",
                    attempts: 5,
                }))
            } else {
                Err(DispatchError::Store(StoreError::not_found("message", &job.message_id)))
            }
        }
    }

    fn settings(workers: usize) -> DispatchConfig {
        DispatchConfig {
            workers,
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn shard_is_stable_and_in_range() {
        for id in ["conv-a", "conv-b", "conv-c", ""] {
            let shard = shard_for(id, 4);
            assert!(shard < 4);
            assert_eq!(shard, shard_for(id, 4));
        }
        assert_eq!(shard_for("anything", 1), 0);
    }

    #[test]
    fn inline_mode_runs_on_submit() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let (dispatcher, _control) = Dispatcher::start(&settings(0), recorder.clone());
        dispatcher
            .submit(Job::new("conv-1", "msg-1", Platform::Sms))
            .expect("submit");
        assert_eq!(
            recorder.seen.lock().expect("lock").as_slice(),
            &[("conv-1".to_string(), "msg-1".to_string())]
        );
    }

    #[test]
    fn workers_keep_per_conversation_order() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let (dispatcher, mut control) = Dispatcher::start(&settings(3), recorder.clone());
        for i in 0..20 {
            let conversation = format!("conv-{}", i % 4);
            dispatcher
                .submit(Job::new(conversation, format!("msg-{:02}", i), Platform::Telegram))
                .expect("submit");
        }
        control.stop_and_join();

        let seen = recorder.seen.lock().expect("lock");
        assert_eq!(seen.len(), 20);
        for conv in 0..4 {
            let key = format!("conv-{}", conv);
            let order: Vec<_> = seen
                .iter()
                .filter(|(c, _)| *c == key)
                .map(|(_, m)| m.clone())
                .collect();
            let mut sorted = order.clone();
            sorted.sort();
            assert_eq!(order, sorted, "conversation {} out of order", key);
        }
    }

    #[test]
    fn retryable_failures_are_retried() {
        let handler = Flaky {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
            retryable: true,
        };
        let job = Job::new("conv-1", "msg-1", Platform::WhatsApp);
        assert!(run_with_retry(&handler, &job, &settings(0)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let handler = Flaky {
            failures_left: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
            retryable: false,
        };
        let job = Job::new("conv-1", "msg-1", Platform::WhatsApp);
        assert!(!run_with_retry(&handler, &job, &settings(0)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let handler = Flaky {
            failures_left: AtomicUsize::new(100),
            calls: AtomicUsize::new(0),
            retryable: true,
        };
        let config = DispatchConfig {
            max_attempts: 3,
            ..settings(0)
        };
        let job = Job::new("conv-1", "msg-1", Platform::WhatsApp);
        assert!(!run_with_retry(&handler, &job, &config));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn busy_lease_does_not_use_up_attempts() {
        let handler = Flaky {
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            retryable: true,
        };
        let busy = BusyFor {
            remaining: AtomicUsize::new(12),
            inner: handler,
        };
        let config = DispatchConfig {
            max_attempts: 2,
            lease_secs: 30,
            ..settings(0)
        };
        let job = Job::new("conv-1", "msg-1", Platform::WhatsApp);
        assert!(run_with_retry(&busy, &job, &config));
        assert_eq!(busy.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn busy_lease_gives_up_after_lease_ttl() {
        let busy = BusyFor {
            remaining: AtomicUsize::new(usize::MAX),
            inner: Flaky {
                failures_left: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                retryable: true,
            },
        };
        let config = DispatchConfig {
            lease_secs: 1,
            ..settings(0)
        };
        let started = Instant::now();
        let job = Job::new("conv-1", "msg-1", Platform::WhatsApp);
        assert!(!run_with_retry(&busy, &job, &config));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(busy.inner.calls.load(Ordering::SeqCst), 0);
    }

    /// Reports the lease as busy a fixed number of times, then delegates.
    struct BusyFor {
        remaining: AtomicUsize,
        inner: Flaky,
    }

    impl JobHandler for BusyFor {
        fn handle(&self, job: &Job) -> Result<(), DispatchError> {
            let busy = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if busy {
                return Err(DispatchError::LeaseBusy(job.conversation_id.clone()));
            }
            self.inner.handle(job)
        }
    }
}
