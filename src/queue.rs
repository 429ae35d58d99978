use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::limiter::{LimiterChain, LimiterInfo};
use crate::model::{Request, RequestStatus, Response};

/// Soft cap on the completed-request history. When exceeded, the oldest 10%
/// is evicted — the eviction algorithm is otherwise
/// unobservable but must keep the most recently completed entries.
const COMPLETED_SOFT_CAP: usize = 1000;

/// How often the worker polls its FIFO for a new item when idle, so
/// shutdown can be observed promptly (`<= 1s`).
const DEQUEUE_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub type BoxFuture<'a, O> = Pin<Box<dyn Future<Output = O> + Send + 'a>>;

/// What a [`Processor`] reports back for a completed request: the opaque
/// result, plus any actual token usage it learned about during the call.
///
/// An explicit return value rather than a mutation through a reference,
/// since the request is moved into the processor by value.
pub struct ProcessorOutcome<T> {
    pub result: T,
    pub actual_input_tokens: Option<u64>,
    pub actual_output_tokens: Option<u64>,
}

impl<T> ProcessorOutcome<T> {
    pub fn new(result: T) -> Self {
        Self {
            result,
            actual_input_tokens: None,
            actual_output_tokens: None,
        }
    }

    pub fn with_tokens(result: T, input: u64, output: u64) -> Self {
        Self {
            result,
            actual_input_tokens: Some(input),
            actual_output_tokens: Some(output),
        }
    }
}

impl<T> From<T> for ProcessorOutcome<T> {
    fn from(result: T) -> Self {
        Self::new(result)
    }
}

/// The user-supplied async callback invoked by a [`ModelQueue`]'s worker for
/// each admitted request. Not re-raised to the submitter on failure — a
/// raised/returned error is captured as a string and surfaces only via
/// [`Response::error`] (status `Failed`).
pub trait Processor<P, T>: Send + Sync {
    fn process(&self, request: Request<P>) -> BoxFuture<'static, Result<ProcessorOutcome<T>, String>>;
}

impl<P, T, F, Fut> Processor<P, T> for F
where
    F: Fn(Request<P>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProcessorOutcome<T>, String>> + Send + 'static,
{
    fn process(&self, request: Request<P>) -> BoxFuture<'static, Result<ProcessorOutcome<T>, String>> {
        Box::pin(self(request))
    }
}

/// Bookkeeping snapshot of a [`Request`], kept in the active/completed
/// tables without the opaque `P` payload — the worker channel carries the
/// full `Request<P>`, this carries only what `get_status`/reconciliation
/// need.
#[derive(Debug, Clone)]
struct RequestMeta {
    id: String,
    model_id: String,
    created_at: f64,
    estimated_input_tokens: Option<u64>,
    estimated_output_tokens: Option<u64>,
    actual_input_tokens: Option<u64>,
    actual_output_tokens: Option<u64>,
    status: RequestStatus,
    error: Option<String>,
    processing_time: Option<f64>,
}

impl RequestMeta {
    fn from_request<P>(request: &Request<P>) -> Self {
        Self {
            id: request.id.clone(),
            model_id: request.model_id.clone(),
            created_at: request.created_at,
            estimated_input_tokens: request.estimated_input_tokens,
            estimated_output_tokens: request.estimated_output_tokens,
            actual_input_tokens: request.actual_input_tokens,
            actual_output_tokens: request.actual_output_tokens,
            status: RequestStatus::Pending,
            error: None,
            processing_time: None,
        }
    }

    fn to_response<T>(&self) -> Response<T> {
        Response {
            request_id: self.id.clone(),
            model_id: self.model_id.clone(),
            status: self.status,
            result: None,
            error: self.error.clone(),
            processing_time: self.processing_time,
            created_at: self.created_at,
            input_tokens_used: self.actual_input_tokens,
            output_tokens_used: self.actual_output_tokens,
        }
    }
}

struct QueueItem<P, T> {
    request: Request<P>,
    responder: oneshot::Sender<Response<T>>,
}

struct QueueState {
    active: DashMap<String, RequestMeta>,
    completed: DashMap<String, RequestMeta>,
    completed_order: Mutex<VecDeque<String>>,
    /// Last `(actual_in, actual_out)` reconciled per request id, so a repeat
    /// `update_token_usage` call with identical values is a no-op.
    reconciled: DashMap<String, (u64, u64)>,
    pending_count: AtomicUsize,
}

impl QueueState {
    fn new() -> Self {
        Self {
            active: DashMap::new(),
            completed: DashMap::new(),
            completed_order: Mutex::new(VecDeque::new()),
            reconciled: DashMap::new(),
            pending_count: AtomicUsize::new(0),
        }
    }

    async fn complete(&self, meta: RequestMeta) {
        let id = meta.id.clone();
        self.active.remove(&id);
        self.completed.insert(id.clone(), meta);

        let mut order = self.completed_order.lock().await;
        order.push_back(id);
        if order.len() > COMPLETED_SOFT_CAP {
            let evict_n = (COMPLETED_SOFT_CAP / 10).max(1);
            for _ in 0..evict_n {
                if let Some(old_id) = order.pop_front() {
                    self.completed.remove(&old_id);
                    self.reconciled.remove(&old_id);
                } else {
                    break;
                }
            }
        }
    }

    fn lookup(&self, request_id: &str) -> Option<RequestMeta> {
        self.active
            .get(request_id)
            .map(|r| r.clone())
            .or_else(|| self.completed.get(request_id).map(|r| r.clone()))
    }
}

/// FIFO queue + single worker task for one tenant (`model_id`).
///
/// Drives the admission -> process -> release -> record cycle described in
/// Holds no lock of its own across `.await` points beyond the
/// short-lived `DashMap`/`Mutex` guards taken inside [`QueueState`] methods.
pub struct ModelQueue<P, T> {
    model_id: String,
    chain: Arc<LimiterChain>,
    sender: mpsc::UnboundedSender<QueueItem<P, T>>,
    state: Arc<QueueState>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P, T> ModelQueue<P, T>
where
    P: Send + 'static,
    T: Send + 'static,
{
    pub fn new(model_id: impl Into<String>, chain: LimiterChain, processor: Arc<dyn Processor<P, T>>) -> Self {
        let model_id = model_id.into();
        let chain = Arc::new(chain);
        let state = Arc::new(QueueState::new());
        let running = Arc::new(AtomicBool::new(true));
        let (sender, receiver) = mpsc::unbounded_channel();

        let worker = tokio::spawn(Self::run_worker(
            model_id.clone(),
            chain.clone(),
            state.clone(),
            running.clone(),
            processor,
            receiver,
        ));

        Self {
            model_id,
            chain,
            sender,
            state,
            running,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Insert into the active table and FIFO. If `wait_for_completion` is
    /// true, await the terminal response; otherwise return a `Pending`
    /// response immediately. The worker runs the request to completion
    /// either way.
    pub async fn enqueue(&self, request: Request<P>) -> Response<T> {
        let meta = RequestMeta::from_request(&request);
        let id = request.id.clone();
        let model_id = request.model_id.clone();
        let created_at = request.created_at;
        let wait = request.wait_for_completion;

        self.state.active.insert(id.clone(), meta);
        self.state.pending_count.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("reqwise_queue_depth", "model" => model_id.clone())
            .set(self.state.pending_count.load(Ordering::Relaxed) as f64);

        let (responder, receiver) = oneshot::channel();
        if self
            .sender
            .send(QueueItem { request, responder })
            .is_err()
        {
            self.state.active.remove(&id);
            self.state.pending_count.fetch_sub(1, Ordering::Relaxed);
            metrics::gauge!("reqwise_queue_depth", "model" => model_id.clone())
                .set(self.state.pending_count.load(Ordering::Relaxed) as f64);
            let mut resp = Response::pending(id, model_id, created_at);
            resp.status = RequestStatus::Failed;
            resp.error = Some("queue is shut down".to_string());
            return resp;
        }

        if !wait {
            return Response::pending(id, model_id, created_at);
        }

        match receiver.await {
            Ok(response) => response,
            Err(_) => {
                let mut resp = Response::pending(id, model_id, created_at);
                resp.status = RequestStatus::Failed;
                resp.error = Some("worker dropped without responding".to_string());
                resp
            }
        }
    }

    /// Locate the request in the active or completed table; no-op if absent
    /// (purged or unknown). Idempotent when called twice with the same
    /// `(actual_in, actual_out)` pair.
    pub async fn update_token_usage(&self, request_id: &str, actual_in: u64, actual_out: u64) {
        if let Some(prev) = self.state.reconciled.get(request_id) {
            if *prev == (actual_in, actual_out) {
                return;
            }
        }

        let est = {
            let active = self.state.active.get_mut(request_id);
            match active {
                Some(mut entry) => {
                    entry.actual_input_tokens = Some(actual_in);
                    entry.actual_output_tokens = Some(actual_out);
                    Some((
                        entry.estimated_input_tokens.unwrap_or(0),
                        entry.estimated_output_tokens.unwrap_or(0),
                    ))
                }
                None => match self.state.completed.get_mut(request_id) {
                    Some(mut completed) => {
                        completed.actual_input_tokens = Some(actual_in);
                        completed.actual_output_tokens = Some(actual_out);
                        Some((
                            completed.estimated_input_tokens.unwrap_or(0),
                            completed.estimated_output_tokens.unwrap_or(0),
                        ))
                    }
                    None => None,
                },
            }
        };

        if let Some((est_in, est_out)) = est {
            self.chain.reconcile(est_in, est_out, actual_in, actual_out).await;
            self.state
                .reconciled
                .insert(request_id.to_string(), (actual_in, actual_out));
        }
    }

    /// Snapshot of the request's current fields; `result` is never exposed
    /// via this path (callers who want the result must use the original
    /// `enqueue` future). Returns `None` if unknown (never admitted, or
    /// purged from history).
    pub fn get_status(&self, request_id: &str) -> Option<Response<T>> {
        self.state.lookup(request_id).map(|meta| meta.to_response())
    }

    pub fn queue_size(&self) -> usize {
        self.state.pending_count.load(Ordering::Relaxed)
    }

    pub async fn limiter_snapshot(&self) -> Vec<LimiterInfo> {
        self.chain.snapshot().await
    }

    /// Stop accepting new work's admission guarantee and wait for the
    /// worker to drain the FIFO. Termination invariant: no submitted
    /// request is abandoned — every promise is either resolved, or the
    /// worker is still running when this returns pending work (it never
    /// does, since this awaits the worker's join handle).
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(
                    "queue: {}: worker task panicked during shutdown, error={}",
                    self.model_id,
                    e
                );
            }
        }
    }

    /// Admission is strictly serialized, in enqueue order: this loop never
    /// starts a `wait_all` for item N+1 before item N's has returned. Actual
    /// processor execution is not serialized here — each admitted item's
    /// processor call runs as its own task, so real concurrency of upstream
    /// work is bounded only by the `Concurrent` limiter's permits, not by
    /// this loop.
    async fn run_worker(
        model_id: String,
        chain: Arc<LimiterChain>,
        state: Arc<QueueState>,
        running: Arc<AtomicBool>,
        processor: Arc<dyn Processor<P, T>>,
        mut receiver: mpsc::UnboundedReceiver<QueueItem<P, T>>,
    ) {
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            let next = tokio::time::timeout(DEQUEUE_POLL_INTERVAL, receiver.recv()).await;
            let item = match next {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    continue;
                }
            };

            state.pending_count.fetch_sub(1, Ordering::Relaxed);
            metrics::gauge!("reqwise_queue_depth", "model" => model_id.clone())
                .set(state.pending_count.load(Ordering::Relaxed) as f64);

            chain.wait_all(&item.request).await;
            if let Some(mut entry) = state.active.get_mut(&item.request.id) {
                entry.status = RequestStatus::Processing;
            }
            metrics::counter!("reqwise_requests_admitted_total", "model" => model_id.clone()).increment(1);
            if let Some(usage) = chain.concurrency_usage() {
                metrics::gauge!("reqwise_concurrency_in_use", "model" => model_id.clone()).set(usage as f64);
            }

            in_flight.spawn(Self::run_processing(
                model_id.clone(),
                chain.clone(),
                state.clone(),
                processor.clone(),
                item,
            ));

            // Reap whatever's already finished so the set doesn't grow
            // without bound across a long-lived queue.
            while in_flight.try_join_next().is_some() {}
        }

        // Drain: every admitted-but-still-processing request must resolve
        // its responder before this worker task (and therefore `shutdown`)
        // returns.
        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                tracing::error!("queue: {}: processing task panicked, error={}", model_id, e);
            }
        }

        tracing::info!("queue: {}: worker stopped", model_id);
    }

    /// Runs the processor for one already-admitted item and records the
    /// outcome. Spawned by the worker loop rather than awaited inline, so
    /// multiple items can be mid-flight at once.
    async fn run_processing(
        model_id: String,
        chain: Arc<LimiterChain>,
        state: Arc<QueueState>,
        processor: Arc<dyn Processor<P, T>>,
        item: QueueItem<P, T>,
    ) {
        let model_id = model_id.as_str();
        let chain = &chain;
        let state = &state;
        let processor = &processor;
        let QueueItem { request, responder } = item;
        let id = request.id.clone();

        let start = Instant::now();
        let outcome = processor.process(request).await;
        let processing_time = start.elapsed().as_secs_f64();

        chain.release_all().await;
        if let Some(usage) = chain.concurrency_usage() {
            metrics::gauge!("reqwise_concurrency_in_use", "model" => model_id.to_string()).set(usage as f64);
        }
        metrics::histogram!("reqwise_processing_duration_seconds", "model" => model_id.to_string())
            .record(processing_time);

        let (status, error, result, actual_in, actual_out) = match outcome {
            Ok(ProcessorOutcome {
                result,
                actual_input_tokens,
                actual_output_tokens,
            }) => {
                metrics::counter!(
                    "reqwise_requests_completed_total",
                    "model" => model_id.to_string(), "status" => "completed",
                )
                .increment(1);
                (RequestStatus::Completed, None, Some(result), actual_input_tokens, actual_output_tokens)
            }
            Err(msg) => {
                tracing::warn!("queue: {}: request {} failed, error={}", model_id, id, msg);
                metrics::counter!(
                    "reqwise_requests_completed_total",
                    "model" => model_id.to_string(), "status" => "failed",
                )
                .increment(1);
                (RequestStatus::Failed, Some(msg), None, None, None)
            }
        };

        let mut meta = state
            .active
            .get(&id)
            .map(|r| r.clone())
            .unwrap_or_else(|| RequestMeta {
                id: id.clone(),
                model_id: model_id.to_string(),
                created_at: 0.0,
                estimated_input_tokens: None,
                estimated_output_tokens: None,
                actual_input_tokens: None,
                actual_output_tokens: None,
                status: RequestStatus::Pending,
                error: None,
                processing_time: None,
            });

        meta.status = status;
        meta.error = error.clone();
        meta.processing_time = Some(processing_time);
        if actual_in.is_some() {
            meta.actual_input_tokens = actual_in;
        }
        if actual_out.is_some() {
            meta.actual_output_tokens = actual_out;
        }

        let response = Response {
            request_id: meta.id.clone(),
            model_id: meta.model_id.clone(),
            status: meta.status,
            result,
            error: meta.error.clone(),
            processing_time: meta.processing_time,
            created_at: meta.created_at,
            input_tokens_used: meta.actual_input_tokens,
            output_tokens_used: meta.actual_output_tokens,
        };

        state.complete(meta).await;

        // A dropped receiver (caller abandoned the `submit` future) is
        // deliberate — quota was already spent, so the result is silently
        // discarded rather than un-admitted.
        let _ = responder.send(response);
    }
}
