//! Stateful API callers: one per endpoint, tracking call lifecycle and
//! enforcing a concurrency policy across overlapping invocations.

use super::cache::{CachePolicy, InflightRegistry, ResponseCache};
use super::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::error::ApiError;
use crate::response::ValidationIssue;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{watch, Notify};
use uuid::Uuid;

/// What happens when invoke is called while a request is already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// Reject the new call with [`ApiError::AlreadyPending`].
    #[default]
    Disallow,
    /// Cancel the pending call and run the new one.
    Cancel,
    /// Run now if idle; otherwise hold the latest call until the pending
    /// one settles. Intermediate calls resolve to None unsent.
    Debounce,
    /// Let calls overlap. The last response to arrive wins the state.
    Allow,
}

/// Shared services a caller needs from its client.
#[derive(Clone)]
pub struct CallerEnv {
    pub transport: Arc<dyn HttpTransport>,
    pub cache: Arc<ResponseCache>,
    pub inflight: Arc<InflightRegistry>,
}

/// What a hydrator extracted from a response envelope.
pub struct Hydration<O> {
    pub message: Option<String>,
    pub validation_issues: Vec<ValidationIssue>,
    /// Some when the envelope reported success.
    pub success: Option<O>,
}

/// Result payload of an item endpoint.
#[derive(Debug, Clone)]
pub struct ItemOutcome<R> {
    pub object: Option<R>,
    pub ref_map: Option<HashMap<String, serde_json::Value>>,
}

/// Result payload of a list endpoint.
#[derive(Debug, Clone)]
pub struct ListOutcome<R> {
    pub items: Vec<R>,
    pub page: i64,
    pub page_size: i64,
    pub page_count: i64,
    pub total_count: i64,
}

pub type ItemCaller<A, R> = Caller<A, ItemOutcome<R>>;
pub type ListCaller<A, R> = Caller<A, ListOutcome<R>>;

type RequestBuilder<A> = Box<dyn Fn(&A) -> Result<HttpRequest, ApiError> + Send + Sync>;
type Hydrator<O> = Box<dyn Fn(&serde_json::Value) -> Result<Hydration<O>, ApiError> + Send + Sync>;

struct CoreState<O> {
    is_loading: bool,
    was_successful: Option<bool>,
    message: Option<String>,
    validation_issues: Vec<ValidationIssue>,
    outcome: Option<O>,
    last_response: Option<HttpResponse>,
}

#[derive(Clone)]
struct FlightHandle {
    id: u64,
    cancel: Arc<Notify>,
}

struct Control {
    mode: ConcurrencyMode,
    /// Number of requests currently executing.
    active: u32,
    /// Most recent flight; the target of cancellation.
    current: Option<FlightHandle>,
    /// Ticket of the single held debounce call, if any.
    queued_ticket: Option<u64>,
}

struct CallerInner<A, O> {
    env: CallerEnv,
    build: RequestBuilder<A>,
    hydrate: Hydrator<O>,
    state: RwLock<CoreState<O>>,
    control: Mutex<Control>,
    /// Wakes debounce waiters when a flight settles or the queue changes.
    control_changed: Notify,
    next_id: AtomicU64,
    cache_policy: RwLock<Option<CachePolicy>>,
    share_inflight: AtomicBool,
    on_fulfilled: RwLock<Vec<Arc<dyn Fn(&O) + Send + Sync>>>,
    on_rejected: RwLock<Vec<Arc<dyn Fn(&ApiError) + Send + Sync>>>,
    changed: watch::Sender<u64>,
}

impl<A, O> CallerInner<A, O> {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_read(&self) -> std::sync::RwLockReadGuard<'_, CoreState<O>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_write(&self) -> std::sync::RwLockWriteGuard<'_, CoreState<O>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn begin_flight(&self, ctl: &mut Control) -> FlightHandle {
        let handle = FlightHandle {
            id: self.next_id(),
            cancel: Arc::new(Notify::new()),
        };
        ctl.active += 1;
        ctl.current = Some(handle.clone());
        handle
    }
}

/// Ends the flight when the invocation unwinds, however it unwinds, so a
/// dropped future can never leave the caller stuck loading.
struct FlightGuard<A, O> {
    inner: Arc<CallerInner<A, O>>,
    id: u64,
}

impl<A, O> Drop for FlightGuard<A, O> {
    fn drop(&mut self) {
        let idle = {
            let mut ctl = self.inner.control();
            ctl.active = ctl.active.saturating_sub(1);
            if ctl.current.as_ref().map(|f| f.id) == Some(self.id) {
                ctl.current = None;
            }
            ctl.active == 0
        };
        if idle {
            let mut st = self.inner.state_write();
            if st.is_loading {
                st.is_loading = false;
            }
            drop(st);
            self.inner.bump();
        }
        self.inner.control_changed.notify_waiters();
    }
}

/// Envelope fields every failure body can carry.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailureEnvelope {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    validation_issues: Vec<ValidationIssue>,
}

/// A stateful endpoint invoker. Cloning shares the same state machine.
pub struct Caller<A, O> {
    inner: Arc<CallerInner<A, O>>,
}

impl<A, O> Clone for Caller<A, O> {
    fn clone(&self) -> Self {
        Caller {
            inner: self.inner.clone(),
        }
    }
}

impl<A, O> Caller<A, O>
where
    A: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new(
        env: CallerEnv,
        build: impl Fn(&A) -> Result<HttpRequest, ApiError> + Send + Sync + 'static,
        hydrate: impl Fn(&serde_json::Value) -> Result<Hydration<O>, ApiError> + Send + Sync + 'static,
    ) -> Self {
        let (changed, _) = watch::channel(0);
        Caller {
            inner: Arc::new(CallerInner {
                env,
                build: Box::new(build),
                hydrate: Box::new(hydrate),
                state: RwLock::new(CoreState {
                    is_loading: false,
                    was_successful: None,
                    message: None,
                    validation_issues: Vec::new(),
                    outcome: None,
                    last_response: None,
                }),
                control: Mutex::new(Control {
                    mode: ConcurrencyMode::default(),
                    active: 0,
                    current: None,
                    queued_ticket: None,
                }),
                control_changed: Notify::new(),
                next_id: AtomicU64::new(1),
                cache_policy: RwLock::new(None),
                share_inflight: AtomicBool::new(false),
                on_fulfilled: RwLock::new(Vec::new()),
                on_rejected: RwLock::new(Vec::new()),
                changed,
            }),
        }
    }

    pub fn concurrency_mode(&self) -> ConcurrencyMode {
        self.inner.control().mode
    }

    pub fn set_concurrency_mode(&self, mode: ConcurrencyMode) {
        self.inner.control().mode = mode;
    }

    /// Serve state from cached responses while the network call proceeds,
    /// and refresh the cache from successful responses.
    pub fn use_response_caching(&self, policy: CachePolicy) {
        *self
            .inner
            .cache_policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(policy);
    }

    pub fn clear_response_caching(&self) {
        *self
            .inner
            .cache_policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Share a single transport call among identical simultaneous requests.
    pub fn share_inflight_requests(&self) {
        self.inner.share_inflight.store(true, Ordering::Relaxed);
    }

    pub fn on_fulfilled(&self, f: impl Fn(&O) + Send + Sync + 'static) {
        self.inner
            .on_fulfilled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(f));
    }

    pub fn on_rejected(&self, f: impl Fn(&ApiError) + Send + Sync + 'static) {
        self.inner
            .on_rejected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(f));
    }

    /// Receiver that ticks on every observable state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changed.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state_read().is_loading
    }

    pub fn was_successful(&self) -> Option<bool> {
        self.inner.state_read().was_successful
    }

    pub fn message(&self) -> Option<String> {
        self.inner.state_read().message.clone()
    }

    pub fn validation_issues(&self) -> Vec<ValidationIssue> {
        self.inner.state_read().validation_issues.clone()
    }

    pub fn outcome(&self) -> Option<O> {
        self.inner.state_read().outcome.clone()
    }

    /// Response behind the most recent settled call, successful or not.
    /// None when that call never reached the server.
    pub fn last_response(&self) -> Option<HttpResponse> {
        self.inner.state_read().last_response.clone()
    }

    /// Cancel the pending request, if any. Loading stops; every other
    /// piece of state keeps its last value and no callbacks fire. A held
    /// debounce call is discarded too.
    pub fn cancel(&self) {
        let mut ctl = self.inner.control();
        if let Some(current) = ctl.current.take() {
            current.cancel.notify_one();
        }
        ctl.queued_ticket = None;
        drop(ctl);
        self.inner.control_changed.notify_waiters();
    }

    /// Run the endpoint. Ok(None) means the call never completed: it was
    /// cancelled in flight or superseded while held by debounce.
    pub async fn invoke(&self, args: A) -> Result<Option<O>, ApiError> {
        let inner = self.inner.clone();

        // Admission: apply the concurrency mode against any active flight.
        let mut my_ticket: Option<u64> = None;
        let handle = loop {
            let notified = inner.control_changed.notified();
            let admitted = {
                let mut ctl = inner.control();
                if let Some(ticket) = my_ticket {
                    if ctl.queued_ticket != Some(ticket) {
                        // A newer call took the held slot.
                        return Ok(None);
                    }
                }
                if ctl.active == 0 {
                    if my_ticket.is_some() {
                        ctl.queued_ticket = None;
                    }
                    Some(inner.begin_flight(&mut ctl))
                } else {
                    match ctl.mode {
                        ConcurrencyMode::Disallow => return Err(ApiError::AlreadyPending),
                        ConcurrencyMode::Allow => Some(inner.begin_flight(&mut ctl)),
                        ConcurrencyMode::Cancel => {
                            if let Some(current) = ctl.current.take() {
                                current.cancel.notify_one();
                            }
                            Some(inner.begin_flight(&mut ctl))
                        }
                        ConcurrencyMode::Debounce => {
                            if my_ticket.is_none() {
                                my_ticket = Some(inner.next_id());
                            }
                            if ctl.queued_ticket != my_ticket {
                                ctl.queued_ticket = my_ticket;
                                drop(ctl);
                                // Wake the waiter we just displaced.
                                inner.control_changed.notify_waiters();
                            }
                            None
                        }
                    }
                }
            };
            match admitted {
                Some(handle) => break handle,
                None => notified.await,
            }
        };

        let guard = FlightGuard {
            inner: inner.clone(),
            id: handle.id,
        };
        {
            let mut st = inner.state_write();
            st.is_loading = true;
        }
        inner.bump();

        let request = match (inner.build)(&args) {
            Ok(r) => r,
            Err(e) => return Err(settle_failure(&inner, guard, e, None)),
        };
        let request_id = Uuid::new_v4();
        tracing::debug!(
            request_id = %request_id,
            method = request.method.as_str(),
            uri = %request.uri(),
            "sending api request"
        );

        let policy = inner
            .cache_policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let cache_key = policy.as_ref().and_then(|p| p.cache_key(&request));

        // Stale-while-revalidate: a fresh cached response hydrates state
        // right away, without callbacks, and the network call continues.
        if let Some(key) = &cache_key {
            if let Some(cached) = inner.env.cache.get_fresh(key) {
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(&cached.body) {
                    if let Ok(hydration) = (inner.hydrate)(&json) {
                        if let Some(outcome) = hydration.success {
                            let mut st = inner.state_write();
                            st.was_successful = Some(true);
                            st.message = hydration.message;
                            st.validation_issues = hydration.validation_issues;
                            st.outcome = Some(outcome);
                            drop(st);
                            inner.bump();
                            tracing::debug!(request_id = %request_id, "hydrated from response cache");
                        }
                    }
                }
            }
        }

        let transport = run_transport(&inner, request);
        let outcome = tokio::select! {
            biased;
            _ = handle.cancel.notified() => {
                tracing::debug!(request_id = %request_id, "api request cancelled");
                drop(guard);
                return Ok(None);
            }
            outcome = transport => outcome,
        };

        let response = match outcome {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "api request failed");
                return Err(settle_failure(&inner, guard, e, None));
            }
        };

        if !response.is_success() {
            let (message, validation_issues) = parse_failure(&response);
            let error = ApiError::Server {
                status: response.status,
                message,
                validation_issues,
            };
            tracing::warn!(request_id = %request_id, status = response.status, "api request rejected");
            return Err(settle_failure(&inner, guard, error, Some(response)));
        }

        let json: serde_json::Value = match serde_json::from_str(&response.body) {
            Ok(v) => v,
            Err(_) => {
                let error = ApiError::NonJson {
                    status: response.status,
                };
                return Err(settle_failure(&inner, guard, error, Some(response)));
            }
        };

        let hydration = match (inner.hydrate)(&json) {
            Ok(h) => h,
            Err(e) => return Err(settle_failure(&inner, guard, e, Some(response))),
        };

        match hydration.success {
            Some(result) => {
                if let (Some(policy), Some(key)) = (&policy, &cache_key) {
                    inner.env.cache.store(key, &response, policy.max_age);
                }
                {
                    let mut st = inner.state_write();
                    st.was_successful = Some(true);
                    st.message = hydration.message;
                    st.validation_issues = hydration.validation_issues;
                    st.outcome = Some(result.clone());
                    st.last_response = Some(response);
                }
                drop(guard);
                inner.bump();
                let callbacks = inner
                    .on_fulfilled
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for cb in callbacks {
                    cb(&result);
                }
                Ok(Some(result))
            }
            None => {
                let error = ApiError::Server {
                    status: response.status,
                    message: hydration
                        .message
                        .unwrap_or_else(|| "the request was not successful".to_string()),
                    validation_issues: hydration.validation_issues,
                };
                Err(settle_failure(&inner, guard, error, Some(response)))
            }
        }
    }
}

impl<A, R> Caller<A, ItemOutcome<R>>
where
    A: Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Object from the most recent successful call.
    pub fn result(&self) -> Option<R> {
        self.inner
            .state_read()
            .outcome
            .as_ref()
            .and_then(|o| o.object.clone())
    }
}

impl<A, R> Caller<A, ListOutcome<R>>
where
    A: Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub fn items(&self) -> Vec<R> {
        self.inner
            .state_read()
            .outcome
            .as_ref()
            .map(|o| o.items.clone())
            .unwrap_or_default()
    }

    pub fn page(&self) -> Option<i64> {
        self.inner.state_read().outcome.as_ref().map(|o| o.page)
    }

    pub fn page_size(&self) -> Option<i64> {
        self.inner.state_read().outcome.as_ref().map(|o| o.page_size)
    }

    pub fn page_count(&self) -> Option<i64> {
        self.inner.state_read().outcome.as_ref().map(|o| o.page_count)
    }

    pub fn total_count(&self) -> Option<i64> {
        self.inner.state_read().outcome.as_ref().map(|o| o.total_count)
    }
}

/// Execute the transport call, optionally sharing one call among identical
/// simultaneous requests. If the executing task is cancelled mid-flight, a
/// waiting task takes over execution.
async fn run_transport<A, O>(
    inner: &Arc<CallerInner<A, O>>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    if !inner.share_inflight.load(Ordering::Relaxed) {
        return inner.env.transport.execute(request).await;
    }
    let key = request.identity_key();
    let cell = inner.env.inflight.join(&key).await;
    let result = cell
        .get_or_init(|| async { inner.env.transport.execute(request.clone()).await })
        .await
        .clone();
    inner.env.inflight.settle(&key).await;
    result
}

/// Apply failure state, end the flight, then notify rejection callbacks.
fn settle_failure<A, O>(
    inner: &Arc<CallerInner<A, O>>,
    guard: FlightGuard<A, O>,
    error: ApiError,
    response: Option<HttpResponse>,
) -> ApiError {
    {
        let mut st = inner.state_write();
        st.was_successful = Some(false);
        st.message = Some(match &error {
            ApiError::Server { message, .. } => message.clone(),
            other => other.to_string(),
        });
        st.validation_issues = match &error {
            ApiError::Server {
                validation_issues, ..
            } => validation_issues.clone(),
            _ => Vec::new(),
        };
        st.last_response = response;
    }
    drop(guard);
    inner.bump();
    let callbacks = inner
        .on_rejected
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for cb in &callbacks {
        cb(&error);
    }
    error
}

fn parse_failure(response: &HttpResponse) -> (String, Vec<ValidationIssue>) {
    match serde_json::from_str::<FailureEnvelope>(&response.body) {
        Ok(envelope) => (
            envelope
                .message
                .unwrap_or_else(|| format!("request failed with status {}", response.status)),
            envelope.validation_issues,
        ),
        Err(_) => (
            format!("request failed with status {}", response.status),
            Vec::new(),
        ),
    }
}
