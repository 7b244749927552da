//! FIFO admission queue in front of a [`RateLimiter`].
//!
//! Requests wait in a backlog until the limiter admits them and a concurrency
//! slot is free. A drain pass scans the backlog in order, evicts requests whose
//! queue deadline has passed, dispatches everything that fits, and arms a retry
//! timer for the shortest wait among the rest. Drains run on enqueue, on every
//! settlement, and when the retry timer elapses.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::error::{QueueError, RequestError};
use super::types::{Dispatched, ErrorResponseParser, QueueOptions, RequestConfig};
use crate::ratelimit::{BackoffTimer, CallerAliases, MergePolicy, RateLimiter, ResponseInfo};

type Outcome<R, E> = Result<R, RequestError<E>>;

/// Result of running a dispatch function, before it is handed to the caller.
struct Settlement {
    response: ResponseInfo,
    deliver: Box<dyn FnOnce() + Send>,
}

/// Type-erased dispatch function plus the channel back to its caller.
trait PendingJob: Send {
    fn start(
        self: Box<Self>,
        config: RequestConfig,
        parser: ErrorResponseParser,
    ) -> BoxFuture<'static, Settlement>;

    fn reject(self: Box<Self>, error: QueueError);
}

struct Job<F, R, E> {
    dispatch: F,
    tx: oneshot::Sender<Outcome<R, E>>,
}

impl<F, Fut, R, E> PendingJob for Job<F, R, E>
where
    F: FnOnce(RequestConfig) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Dispatched<R>, E>> + Send + 'static,
    R: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn start(
        self: Box<Self>,
        config: RequestConfig,
        parser: ErrorResponseParser,
    ) -> BoxFuture<'static, Settlement> {
        let Job { dispatch, tx } = *self;
        // Calling `dispatch` inside the future keeps its panics within the unwind guard.
        Box::pin(async move {
            match dispatch(config).await {
                Ok(Dispatched { response, data }) => Settlement {
                    response,
                    deliver: Box::new(move || {
                        let _ = tx.send(Ok(data));
                    }),
                },
                Err(err) => Settlement {
                    response: parser(&err),
                    deliver: Box::new(move || {
                        let _ = tx.send(Err(RequestError::Dispatch(err)));
                    }),
                },
            }
        })
    }

    fn reject(self: Box<Self>, error: QueueError) {
        // The caller may have dropped its handle.
        let _ = self.tx.send(Err(RequestError::Queue(error)));
    }
}

struct QueuedRequest {
    config: RequestConfig,
    enqueued_at_ms: u64,
    job: Box<dyn PendingJob>,
}

/// Read-only view of a backlogged request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEntry {
    pub config: RequestConfig,
    pub enqueued_at: DateTime<Utc>,
}

/// Future resolving to the outcome of an enqueued request.
///
/// Dropping it does not withdraw the request; use [`RequestQueue::flush`].
#[must_use = "the request outcome is only observable through this future"]
pub struct ResponseFuture<R, E> {
    rx: oneshot::Receiver<Outcome<R, E>>,
}

impl<R, E> Future for ResponseFuture<R, E> {
    type Output = Outcome<R, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The job was dropped without an answer, e.g. its dispatch panicked.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::Queue(QueueError::Canceled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<QueuedRequest>,
    in_flight: usize,
    draining: bool,
    /// A drain was requested while one was running
    rerun: bool,
}

struct QueueInner {
    limiter: Arc<RateLimiter>,
    options: QueueOptions,
    state: Mutex<QueueState>,
    retry_timer: BackoffTimer,
    aliases: CallerAliases,
}

/// Admission queue handle; clones share the same backlog.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RequestQueue")
            .field("options", &self.inner.options)
            .field("queued", &state.backlog.len())
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

impl RequestQueue {
    pub fn new(limiter: Arc<RateLimiter>, options: QueueOptions) -> Self {
        let retry_timer = BackoffTimer::new(MergePolicy::KeepEarliest, limiter.clock().clone());
        let inner = Arc::new(QueueInner {
            limiter,
            options,
            state: Mutex::new(QueueState::default()),
            retry_timer,
            aliases: CallerAliases::new(),
        });

        let weak: Weak<QueueInner> = Arc::downgrade(&inner);
        inner.retry_timer.on_elapsed(move || {
            if let Some(inner) = weak.upgrade() {
                trace!("Retry timer elapsed");
                inner.drain();
            }
        });

        Self { inner }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    /// Submit a request.
    ///
    /// `dispatch` is called with the request config once the request is
    /// admitted, and must resolve to the server response plus the value to hand
    /// back. Dispatch errors are passed through unchanged as
    /// [`RequestError::Dispatch`]. Must be called within a Tokio runtime.
    pub fn enqueue<F, Fut, R, E>(&self, config: RequestConfig, dispatch: F) -> ResponseFuture<R, E>
    where
        F: FnOnce(RequestConfig) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Dispatched<R>, E>> + Send + 'static,
        R: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = QueuedRequest {
            config: self.inner.assign_caller(config),
            enqueued_at_ms: self.inner.limiter.clock().now_millis(),
            job: Box::new(Job { dispatch, tx }),
        };

        if queued.config.skip_queue {
            self.inner.dispatch_now(queued);
        } else {
            self.inner.push(queued);
        }
        ResponseFuture { rx }
    }

    /// Reject every backlogged request with [`QueueError::Canceled`].
    ///
    /// In-flight requests are not affected.
    pub fn flush(&self) {
        let backlog = std::mem::take(&mut self.inner.state.lock().backlog);
        if !backlog.is_empty() {
            debug!(canceled = backlog.len(), "Flushing request queue");
        }
        for queued in backlog {
            queued.job.reject(QueueError::Canceled);
        }
    }

    /// Snapshot of the backlog in FIFO order.
    pub fn queue(&self) -> Vec<QueuedEntry> {
        self.inner
            .state
            .lock()
            .backlog
            .iter()
            .map(|queued| QueuedEntry {
                config: queued.config.clone(),
                enqueued_at: millis_to_date(queued.enqueued_at_ms),
            })
            .collect()
    }

    /// Number of backlogged requests.
    pub fn len(&self) -> usize {
        self.inner.state.lock().backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dispatched requests that have not settled yet.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    /// Milliseconds until the next scheduled drain, 0 when none is pending.
    pub fn retry_after_ms(&self) -> u64 {
        self.inner.retry_timer.retry_after_ms()
    }
}

impl QueueInner {
    fn saturated(&self, state: &QueueState) -> bool {
        state.in_flight >= self.options.max_concurrent_requests
    }

    /// Fill in the caller id from the API key header when none is set.
    fn assign_caller(&self, mut config: RequestConfig) -> RequestConfig {
        if config.request.caller_id.is_none() {
            if let Some(key) = config.header_value(&self.options.api_key_header) {
                config.request.caller_id = Some(self.aliases.alias(key));
            }
        }
        config
    }

    /// Reject `queued` up front when its weights cannot be resolved.
    fn reject_invalid(&self, queued: QueuedRequest) -> Option<QueuedRequest> {
        match self.limiter.validate(&queued.config.request) {
            Ok(()) => Some(queued),
            Err(err) => {
                let err = QueueError::from(err);
                debug!(
                    error = %err,
                    endpoint = %queued.config.request.endpoint,
                    "Rejecting invalid request"
                );
                queued.job.reject(err);
                None
            }
        }
    }

    fn push(self: &Arc<Self>, queued: QueuedRequest) {
        let Some(queued) = self.reject_invalid(queued) else {
            return;
        };
        {
            let mut state = self.state.lock();
            if let Some(max) = self.options.max_queue_size {
                if state.backlog.len() >= max {
                    drop(state);
                    debug!(max, "Queue full; rejecting request");
                    queued.job.reject(QueueError::QueueFull { max });
                    return;
                }
            }
            state.backlog.push_back(queued);
        }
        self.drain();
    }

    /// Skip-queue path: dispatch now or fail.
    fn dispatch_now(self: &Arc<Self>, queued: QueuedRequest) {
        let Some(queued) = self.reject_invalid(queued) else {
            return;
        };
        let admitted = {
            let mut state = self.state.lock();
            if self.saturated(&state) {
                Err(QueueError::MaxConcurrent { max: self.options.max_concurrent_requests })
            } else {
                match self.limiter.may_dispatch_request(&queued.config.request) {
                    Ok(0) => {
                        state.in_flight += 1;
                        Ok(())
                    }
                    Ok(retry_in_ms) => Err(QueueError::RetryIn { retry_in_ms }),
                    Err(err) => Err(err.into()),
                }
            }
        };

        match admitted {
            Ok(()) => self.launch(queued),
            Err(err) => {
                debug!(
                    error = %err,
                    endpoint = %queued.config.request.endpoint,
                    "Rejecting skip-queue request"
                );
                queued.job.reject(err);
            }
        }
    }

    fn drain(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.draining {
                state.rerun = true;
                return;
            }
            state.draining = true;
        }

        loop {
            self.drain_pass();

            let mut state = self.state.lock();
            let idle = self.retry_timer.is_elapsed()
                && !self.saturated(&state)
                && !state.backlog.is_empty();
            if !state.rerun && !idle {
                state.draining = false;
                return;
            }
            state.rerun = false;
        }
    }

    fn drain_pass(self: &Arc<Self>) {
        let mut launches = Vec::new();
        let mut evicted = Vec::new();
        let mut retry_in: Option<u64> = None;

        {
            let mut state = self.state.lock();
            if state.backlog.is_empty() || self.saturated(&state) {
                return;
            }

            let now = self.limiter.clock().now_millis();
            let mut kept = VecDeque::with_capacity(state.backlog.len());

            while let Some(queued) = state.backlog.pop_front() {
                if self.saturated(&state) {
                    kept.push_back(queued);
                    continue;
                }

                if let Some(deadline) = queued.config.max_queue_until {
                    if now as i64 > deadline.timestamp_millis() {
                        evicted.push((queued, QueueError::TimedOut { deadline }));
                        continue;
                    }
                }

                match self.limiter.may_dispatch_request(&queued.config.request) {
                    Ok(0) => {
                        state.in_flight += 1;
                        launches.push(queued);
                    }
                    Ok(wait) => {
                        retry_in = Some(retry_in.map_or(wait, |current| current.min(wait)));
                        kept.push_back(queued);
                    }
                    Err(err) => evicted.push((queued, err.into())),
                }
            }

            state.backlog = kept;
            trace!(
                dispatched = launches.len(),
                evicted = evicted.len(),
                queued = state.backlog.len(),
                in_flight = state.in_flight,
                "Drained request queue"
            );
        }

        for (queued, err) in evicted {
            debug!(
                error = %err,
                endpoint = %queued.config.request.endpoint,
                "Evicting queued request"
            );
            queued.job.reject(err);
        }
        for queued in launches {
            self.launch(queued);
        }
        if let Some(wait) = retry_in {
            self.retry_timer.backoff(Duration::from_millis(wait));
        }
    }

    /// Run an admitted request; its concurrency slot is already taken.
    fn launch(self: &Arc<Self>, queued: QueuedRequest) {
        let QueuedRequest { config, job, .. } = queued;
        let request = config.request.clone();
        debug!(method = %request.method, endpoint = %request.endpoint, "Dispatching request");

        let inner = self.clone();
        let parser = self.options.error_response_parser.clone();
        let fut = AssertUnwindSafe(job.start(config, parser)).catch_unwind();
        tokio::spawn(async move {
            let (response, deliver) = match fut.await {
                Ok(settlement) => (settlement.response, Some(settlement.deliver)),
                Err(_) => {
                    warn!(endpoint = %request.endpoint, "Dispatch function panicked");
                    (ResponseInfo::empty(), None)
                }
            };

            if let Err(err) = inner.limiter.complete_request(&response, &request) {
                warn!(
                    error = %err,
                    endpoint = %request.endpoint,
                    "Failed to reconcile settled request"
                );
            }
            {
                let mut state = inner.state.lock();
                state.in_flight = state.in_flight.saturating_sub(1);
            }
            if let Some(deliver) = deliver {
                deliver();
            }
            inner.drain();
        });
    }
}

fn millis_to_date(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(i64::try_from(millis).unwrap_or(i64::MAX))
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::queue::types::HttpStatusError;
    use crate::ratelimit::{
        CategoryConfig, IntervalUnit, LimiterConfig, Method, Rule, RuleCategory, TrackingScope,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T0: u64 = 1_700_000_040_000;

    fn limiter(limit: u64) -> Arc<RateLimiter> {
        let config = LimiterConfig::new()
            .rule(Rule::new(RuleCategory::RawRequests, IntervalUnit::Minute, 1, limit))
            .category(
                RuleCategory::RawRequests,
                CategoryConfig::new(TrackingScope::Global).weight("*", "*", 1),
            );
        Arc::new(RateLimiter::with_clock(config, Arc::new(TokioClock::starting_at(T0))))
    }

    async fn ok(config: RequestConfig) -> Result<Dispatched<String>, std::io::Error> {
        Ok(Dispatched::new(ResponseInfo::new(200), config.request.endpoint))
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_and_resolves() {
        let queue = RequestQueue::new(limiter(10), QueueOptions::default());

        let data = queue.enqueue(RequestConfig::new(Method::Get, "/a"), ok).await.unwrap();

        assert_eq!(data, "/a");
        assert_eq!(queue.in_flight(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_next_window() {
        let queue = RequestQueue::new(limiter(1), QueueOptions::default());

        queue.enqueue(RequestConfig::new(Method::Get, "/a"), ok).await.unwrap();
        let start = tokio::time::Instant::now();
        queue.enqueue(RequestConfig::new(Method::Get, "/b"), ok).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full() {
        let queue = RequestQueue::new(limiter(0), QueueOptions::default().max_queue_size(1));

        let _first = queue.enqueue(RequestConfig::new(Method::Get, "/a"), ok);
        let err = queue.enqueue(RequestConfig::new(Method::Get, "/b"), ok).await.unwrap_err();

        assert_eq!(err.as_queue(), Some(&QueueError::QueueFull { max: 1 }));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_queue_retry_in() {
        let queue = RequestQueue::new(limiter(0), QueueOptions::default());

        let err = queue
            .enqueue(RequestConfig::new(Method::Get, "/a").skip_queue(), ok)
            .await
            .unwrap_err();

        assert_eq!(err.as_queue(), Some(&QueueError::RetryIn { retry_in_ms: 60_000 }));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_error_passes_through_and_reconciles() {
        let limiter = limiter(10);
        let queue = RequestQueue::new(limiter.clone(), QueueOptions::default());

        let err = queue
            .enqueue(RequestConfig::new(Method::Get, "/a"), |_| async {
                let err = HttpStatusError::new(429, "slow down").header("retry-after", "2");
                Err::<Dispatched<()>, _>(err)
            })
            .await
            .unwrap_err();

        assert_eq!(err.into_dispatch().unwrap().status, 429);
        assert!(limiter.is_banned());
        assert_eq!(limiter.retry_after_ms(), 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_error_parser() {
        let parsed = Arc::new(AtomicUsize::new(0));
        let counter = parsed.clone();
        let options = QueueOptions::default().error_response_parser(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            ResponseInfo::empty()
        });
        let queue = RequestQueue::new(limiter(10), options);

        let result = queue
            .enqueue(RequestConfig::new(Method::Get, "/a"), |_| async {
                Err::<Dispatched<()>, _>(std::io::Error::new(std::io::ErrorKind::Other, "down"))
            })
            .await;

        assert!(matches!(result, Err(RequestError::Dispatch(_))));
        assert_eq!(parsed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_api_key_header_assigns_caller() {
        let queue = RequestQueue::new(limiter(0), QueueOptions::default());

        let config = RequestConfig::new(Method::Get, "/a").header("X-MBX-APIKEY", "secret");
        let _pending = queue.enqueue(config, ok);

        let entries = queue.queue();
        assert_eq!(entries.len(), 1);
        let caller = entries[0].config.request.caller_id.clone().unwrap();
        assert_eq!(caller.len(), 32);
        assert_ne!(caller, "secret");
        assert_eq!(entries[0].enqueued_at.timestamp_millis(), T0 as i64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_dispatch_frees_slot() {
        let options = QueueOptions::default().max_concurrent_requests(1);
        let queue = RequestQueue::new(limiter(10), options);

        let err = queue
            .enqueue(RequestConfig::new(Method::Get, "/a"), |_| async {
                if true {
                    panic!("dispatch bug");
                }
                Ok::<Dispatched<()>, std::io::Error>(Dispatched::new(ResponseInfo::empty(), ()))
            })
            .await
            .unwrap_err();

        assert_eq!(err.as_queue(), Some(&QueueError::Canceled));
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.enqueue(RequestConfig::new(Method::Get, "/b"), ok).await.unwrap(), "/b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_while_building_dispatch_future_frees_slot() {
        let options = QueueOptions::default().max_concurrent_requests(1);
        let queue = RequestQueue::new(limiter(10), options);

        let err = queue
            .enqueue(
                RequestConfig::new(Method::Get, "/a"),
                |_| -> std::future::Ready<Result<Dispatched<()>, std::io::Error>> {
                    panic!("dispatch bug")
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.as_queue(), Some(&QueueError::Canceled));
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.enqueue(RequestConfig::new(Method::Get, "/b"), ok).await.unwrap(), "/b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_weight_rejected_while_saturated() {
        let config = LimiterConfig::new()
            .rule(Rule::new(RuleCategory::RawRequests, IntervalUnit::Minute, 1, 100))
            .category(
                RuleCategory::RawRequests,
                CategoryConfig::new(TrackingScope::Global)
                    .weight("GET", "*", 1)
                    .with_weight_fn("GET", "/broken", |_| f64::NAN),
            );
        let clock = Arc::new(TokioClock::starting_at(T0));
        let limiter = Arc::new(RateLimiter::with_clock(config, clock));
        let queue = RequestQueue::new(limiter, QueueOptions::default().max_concurrent_requests(1));

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let slow = RequestConfig::new(Method::Get, "/slow");
        let blocker = queue.enqueue(slow, move |config| async move {
            let _ = gate.await;
            ok(config).await
        });
        assert_eq!(queue.in_flight(), 1);

        let expected = QueueError::Config("Invalid endpoint config for 'GET /broken'".to_string());
        let err = queue.enqueue(RequestConfig::new(Method::Get, "/broken"), ok).await.unwrap_err();
        assert_eq!(err.as_queue(), Some(&expected));
        assert!(queue.is_empty());

        let err = queue
            .enqueue(RequestConfig::new(Method::Get, "/broken").skip_queue(), ok)
            .await
            .unwrap_err();
        assert_eq!(err.as_queue(), Some(&expected));

        release.send(()).unwrap();
        assert_eq!(blocker.await.unwrap(), "/slow");
    }
}
