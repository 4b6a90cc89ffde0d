//! Connection state machine.
//!
//! A [`Connection`] owns at most one link to the gateway at a time. All of
//! its state (the link handle, the connect attempt, the request queue and the
//! observation registry) sits behind a single mutex that is never held across
//! an `.await`. The status is derived from that state:
//!
//! | link held | attempt running | status         |
//! |-----------|-----------------|----------------|
//! | yes       | -               | `Connected`    |
//! | no        | yes             | `Connecting`   |
//! | no        | no              | `Disconnected` |
//!
//! Transport failures from requests, subscriptions and keepalives all go
//! through `handle_link_failure`. Each failure report carries
//! the id of the link it was observed on; reports for a link that has already
//! been replaced are ignored.
//!
//! An explicit [`Connection::disconnect`] parks its link instead: requests
//! that were in flight or still waiting in a drain batch go back to the front
//! of the queue and wait for the next [`Connection::connect`]. Status
//! watchers see `Disconnected` only once the channel has been closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::core::{ChannelError, CoapError, ConfigError, ResourcePath};
use crate::transport::{Dialer, Endpoint, Response, SecureChannel};

use super::config::{ConnectionConfig, KeepaliveStrategy, LifecycleCallbacks};
use super::observe::{NotificationHandler, Observation, ObserveTask, SubscriptionState};
use super::queue::{CallMethod, PostAction, QueuedRequest, RequestQueue, ResponseHandler};

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No link and no connect attempt.
    Disconnected,
    /// A connect loop is running.
    Connecting,
    /// A link is held.
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// An established link.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) id: u64,
    pub(crate) channel: Arc<dyn SecureChannel>,
    /// Cancelled when the link is torn down.
    pub(crate) token: CancellationToken,
    /// Subscription tasks running on this link.
    pub(crate) tracker: TaskTracker,
    /// Set when `disconnect` retired the link.
    parked: Arc<AtomicBool>,
}

impl Link {
    fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }
}

/// Where `route` sent a request.
enum Route {
    /// Send now on this link.
    Ready(Link, QueuedRequest),
    /// Issued on a parked link; hold it for the next connect.
    Parked(QueuedRequest),
    /// Started, queued or rejected.
    Done,
}

struct Attempt {
    id: u64,
    cancel: CancellationToken,
}

struct LinkState {
    link: Option<Link>,
    attempt: Option<Attempt>,
    /// The connect loop is replaying the queue; new calls go behind it.
    draining: bool,
    /// Link teardowns still in progress.
    closing: usize,
    /// Set once the last user handle is gone.
    abandoned: bool,
    queue: RequestQueue,
    observations: HashMap<ResourcePath, Observation>,
    last_activity: Instant,
    next_id: u64,
}

impl LinkState {
    fn new() -> Self {
        Self {
            link: None,
            attempt: None,
            draining: false,
            closing: 0,
            abandoned: false,
            queue: RequestQueue::new(),
            observations: HashMap::new(),
            last_activity: Instant::now(),
            next_id: 0,
        }
    }

    fn status(&self) -> ConnectionStatus {
        if self.link.is_some() {
            ConnectionStatus::Connected
        } else if self.attempt.is_some() {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Disconnected
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_current(&self, link: u64) -> bool {
        self.link.as_ref().is_some_and(|held| held.id == link)
    }

    fn observation_mut(&mut self, id: u64) -> Option<(&ResourcePath, &mut Observation)> {
        self.observations
            .iter_mut()
            .find(|(_, observation)| observation.id == id)
    }

    fn remove_observation(&mut self, id: u64) -> Option<Observation> {
        let path = self
            .observations
            .iter()
            .find(|(_, observation)| observation.id == id)
            .map(|(path, _)| path.clone())?;
        let observation = self.observations.remove(&path)?;
        observation.cancel.cancel();
        self.queue.remove_observations(|queued| queued == id);
        Some(observation)
    }
}

struct Inner {
    config: ConnectionConfig,
    callbacks: LifecycleCallbacks,
    dialer: Arc<dyn Dialer>,
    state: Mutex<LinkState>,
    status: watch::Sender<ConnectionStatus>,
    teardown_done: Notify,
}

impl Inner {
    fn publish(&self, state: &LinkState) {
        let status = state.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Tear everything down without waiting. Used when the last handle goes.
    fn abandon(&self) {
        let (link, pending) = {
            let mut state = self.state.lock();
            state.abandoned = true;
            if let Some(attempt) = state.attempt.take() {
                attempt.cancel.cancel();
            }
            for observation in state.observations.values() {
                observation.cancel.cancel();
            }
            state.observations.clear();
            state.draining = false;
            let link = state.link.take();
            self.publish(&state);
            (link, state.queue.take_all())
        };

        for request in pending {
            request.fail(CoapError::ConnectionCancelled);
        }

        if let Some(link) = link {
            link.token.cancel();
            link.tracker.close();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let grace = self.config.grace_timeout;
                runtime.spawn(async move {
                    link.tracker.wait().await;
                    let _ = timeout(grace, link.channel.close()).await;
                });
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .queue
            .fail_all(CoapError::ConnectionCancelled);
    }
}

/// Tears the connection down when the last user handle is dropped.
struct Owner {
    inner: Weak<Inner>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.abandon();
        }
    }
}

/// A resilient connection to one gateway.
///
/// Cheap to clone; clones share the link, queue and observations. When the
/// last clone is dropped the link is torn down in the background and queued
/// requests fail with [`CoapError::ConnectionCancelled`].
///
/// Requests and observations may be issued in any state. While no link is up
/// they are queued (see [`ConnectionConfig::use_queue`]) and a connect is
/// started; they run in order once the link is established.
///
/// All methods that start background work must be called from within a
/// tokio runtime.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    /// `None` for handles held by background tasks.
    owner: Option<Arc<Owner>>,
}

impl Connection {
    /// Create a connection from a configuration.
    pub fn new(config: ConnectionConfig, dialer: impl Dialer) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_callbacks(
            config,
            LifecycleCallbacks::default(),
            dialer,
        ))
    }

    pub(crate) fn with_callbacks(
        config: ConnectionConfig,
        callbacks: LifecycleCallbacks,
        dialer: impl Dialer,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let inner = Arc::new(Inner {
            config,
            callbacks,
            dialer: Arc::new(dialer),
            state: Mutex::new(LinkState::new()),
            status,
            teardown_done: Notify::new(),
        });
        let owner = Arc::new(Owner {
            inner: Arc::downgrade(&inner),
        });
        Self {
            inner,
            owner: Some(owner),
        }
    }

    /// Handle for background tasks; does not keep the connection alive.
    fn detached(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            owner: None,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Gateway address.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.config.endpoint
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status()
    }

    /// Subscribe to status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Number of requests waiting for a link.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Paths with a registered observation, sorted.
    pub fn observed_paths(&self) -> Vec<ResourcePath> {
        let mut paths: Vec<_> = self.inner.state.lock().observations.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// State of the observation registered for `path`.
    pub fn observation_state<P>(&self, path: P) -> Option<SubscriptionState>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
    {
        let path = path.try_into().ok()?;
        self.inner
            .state
            .lock()
            .observations
            .get(&path)
            .map(|observation| observation.state)
    }

    // =========================================================================
    // Connect / disconnect
    // =========================================================================

    /// Connect to the gateway.
    ///
    /// Does nothing if the connection is not `Disconnected`. Otherwise runs
    /// the connect loop until a link is up and the request queue has been
    /// replayed, the loop is cancelled by [`disconnect`](Self::disconnect),
    /// or, with retries disabled, the first handshake fails.
    pub async fn connect(&self) -> Result<(), CoapError> {
        match self.start_connect() {
            Some(handle) => handle.await.unwrap_or(Err(CoapError::ConnectionCancelled)),
            None => Ok(()),
        }
    }

    /// Start the connect loop without waiting for it.
    ///
    /// Returns `None` if the connection is not `Disconnected`.
    pub fn start_connect(&self) -> Option<JoinHandle<Result<(), CoapError>>> {
        let (attempt, cancel) = {
            let mut state = self.inner.state.lock();
            if state.abandoned || state.status() != ConnectionStatus::Disconnected {
                return None;
            }
            let id = state.next_id();
            let cancel = CancellationToken::new();
            state.attempt = Some(Attempt {
                id,
                cancel: cancel.clone(),
            });
            self.inner.publish(&state);
            (id, cancel)
        };

        debug!(endpoint = %self.inner.config.endpoint, attempt, "starting connect loop");
        let conn = self.detached();
        Some(tokio::spawn(async move {
            conn.run_connect(attempt, cancel).await
        }))
    }

    async fn run_connect(&self, attempt: u64, cancel: CancellationToken) -> Result<(), CoapError> {
        let config = &self.inner.config;
        let mut tries = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.connect_cancelled(attempt)),
                _ = self.teardown_finished() => {}
            }

            tries += 1;
            debug!(endpoint = %config.endpoint, tries, "dialing");
            let dialed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.connect_cancelled(attempt)),
                result = timeout(
                    config.handshake_timeout,
                    self.inner.dialer.dial(&config.endpoint, &config.credentials),
                ) => result.unwrap_or_else(|_| {
                    Err(ChannelError::Handshake("handshake timed out".to_string()))
                }),
            };

            match dialed {
                Ok(channel) => return self.establish(attempt, channel).await,
                Err(err) => {
                    warn!(endpoint = %config.endpoint, tries, error = %err, "handshake failed");
                    self.inner.callbacks.connection_failed();
                    if !config.retry_on_failure {
                        self.end_attempt(attempt);
                        return Err(CoapError::HandshakeFailed);
                    }
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.connect_cancelled(attempt)),
                _ = sleep(config.retry_interval) => {}
            }
        }
    }

    async fn establish(
        &self,
        attempt: u64,
        channel: Arc<dyn SecureChannel>,
    ) -> Result<(), CoapError> {
        let link = {
            let mut state = self.inner.state.lock();
            if state.attempt.as_ref().is_some_and(|a| a.id == attempt) {
                state.attempt = None;
                let link = Link {
                    id: state.next_id(),
                    channel: Arc::clone(&channel),
                    token: CancellationToken::new(),
                    tracker: TaskTracker::new(),
                    parked: Arc::new(AtomicBool::new(false)),
                };
                state.link = Some(link.clone());
                state.draining = true;
                state.last_activity = Instant::now();
                self.inner.publish(&state);
                Some(link)
            } else {
                None
            }
        };

        let Some(link) = link else {
            // cancelled while the handshake was completing
            self.close_channel(&channel).await;
            return Err(self.connect_cancelled(attempt));
        };

        info!(endpoint = %self.inner.config.endpoint, link = link.id, "connected");
        self.inner.callbacks.connected();
        self.drain(&link).await;
        self.start_timers(&link);
        Ok(())
    }

    fn end_attempt(&self, attempt: u64) {
        let mut state = self.inner.state.lock();
        if state.attempt.as_ref().is_some_and(|a| a.id == attempt) {
            state.attempt = None;
            self.inner.publish(&state);
        }
    }

    fn connect_cancelled(&self, attempt: u64) -> CoapError {
        self.end_attempt(attempt);
        info!(endpoint = %self.inner.config.endpoint, "connect cancelled");
        self.inner.callbacks.cancelled();
        CoapError::ConnectionCancelled
    }

    /// Disconnect from the gateway.
    ///
    /// Cancels a running connect loop, ends every observation, joins the
    /// subscription tasks and closes the channel. Queued requests are kept
    /// and run after the next connect. Returns once no teardown is pending.
    pub async fn disconnect(&self) -> Result<(), CoapError> {
        self.shutdown(None).await;
        Ok(())
    }

    /// Disconnect and fail every queued request with
    /// [`CoapError::ConnectionCancelled`].
    pub async fn close(&self) -> Result<(), CoapError> {
        self.disconnect().await?;
        let pending = self.inner.state.lock().queue.take_all();
        for request in pending {
            request.fail(CoapError::ConnectionCancelled);
        }
        Ok(())
    }

    /// Explicit teardown. With `only`, does nothing unless that link is
    /// still the current one.
    async fn shutdown(&self, only: Option<u64>) {
        let link = {
            let mut state = self.inner.state.lock();
            if only.is_some_and(|id| !state.is_current(id)) {
                return;
            }
            if let Some(attempt) = state.attempt.take() {
                attempt.cancel.cancel();
            }
            for observation in state.observations.values() {
                observation.cancel.cancel();
            }
            state.observations.clear();
            state.queue.remove_observations(|_| true);
            state.draining = false;
            let link = state.link.take();
            match &link {
                Some(link) => {
                    if only.is_none() {
                        link.parked.store(true, Ordering::Release);
                    }
                    state.closing += 1;
                }
                None => self.inner.publish(&state),
            }
            link
        };

        if let Some(link) = link {
            info!(endpoint = %self.inner.config.endpoint, link = link.id, "disconnecting");
            self.release(link).await;
            self.inner.publish(&self.inner.state.lock());
        }
        self.teardown_finished().await;
        self.inner.callbacks.disconnected();
    }

    /// Cancel the link's subscriptions, join them, then close the channel.
    async fn release(&self, link: Link) {
        link.token.cancel();
        link.tracker.close();
        link.tracker.wait().await;
        self.close_channel(&link.channel).await;

        {
            let mut state = self.inner.state.lock();
            state.closing = state.closing.saturating_sub(1);
        }
        self.inner.teardown_done.notify_waiters();
        debug!(link = link.id, "link released");
    }

    async fn close_channel(&self, channel: &Arc<dyn SecureChannel>) {
        match timeout(self.inner.config.grace_timeout, channel.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "channel close failed"),
            Err(_) => warn!(endpoint = %self.inner.config.endpoint, "channel close timed out"),
        }
    }

    async fn teardown_finished(&self) {
        loop {
            let notified = self.inner.teardown_done.notified();
            let busy = self.inner.state.lock().closing > 0;
            if !busy {
                return;
            }
            notified.await;
        }
    }

    // =========================================================================
    // Queue and routing
    // =========================================================================

    /// Replay the queue on a fresh link, one request at a time.
    async fn drain(&self, link: &Link) {
        loop {
            let batch = {
                let mut state = self.inner.state.lock();
                if !state.is_current(link.id) {
                    return;
                }
                let batch = state.queue.take_all();
                if batch.is_empty() {
                    state.draining = false;
                    return;
                }
                batch
            };

            debug!(link = link.id, queue_len = batch.len(), "draining request queue");
            let mut pending = batch.into_iter();
            while let Some(request) = pending.next() {
                let held = match self.route(request, Some(link)) {
                    Route::Ready(target, request) => self.execute(target, request).await,
                    Route::Parked(request) => Some(request),
                    Route::Done => None,
                };
                if let Some(request) = held {
                    self.park(std::iter::once(request).chain(pending).collect());
                    return;
                }
            }
        }
    }

    /// Hold requests from a parked link until the next connect, ahead of
    /// anything queued since.
    fn park(&self, requests: Vec<QueuedRequest>) {
        let mut state = self.inner.state.lock();
        let error = if state.abandoned {
            Some(CoapError::ConnectionCancelled)
        } else if !self.inner.config.use_queue {
            Some(CoapError::NotConnected)
        } else {
            None
        };
        // observations ended with the link
        let requests: Vec<_> = requests
            .into_iter()
            .filter(|request| {
                request.registration().is_none_or(|id| {
                    state.observations.values().any(|observation| observation.id == id)
                })
            })
            .collect();

        match error {
            Some(error) => {
                drop(state);
                for request in requests {
                    request.fail(error);
                }
            }
            None => {
                debug!(count = requests.len(), "holding requests for the next connect");
                state.queue.restore(requests);
            }
        }
    }

    /// Decide where a request goes. Calls that can be sent now come back
    /// with their link; observations are started here, everything else is
    /// queued or rejected.
    ///
    /// `via` is the link whose drain issued the request.
    fn route(&self, request: QueuedRequest, via: Option<&Link>) -> Route {
        let use_queue = self.inner.config.use_queue;
        let mut state = self.inner.state.lock();
        if state.abandoned {
            drop(state);
            request.fail(CoapError::ConnectionCancelled);
            return Route::Done;
        }
        if via.is_some_and(Link::is_parked) {
            return Route::Parked(request);
        }
        let draining = state.draining;
        let via = via.map(|link| link.id);
        let live = state
            .link
            .as_ref()
            .filter(|link| via == Some(link.id) || !draining || !use_queue)
            .cloned();

        if let Some(link) = live {
            if let Some(id) = request.registration() {
                self.spawn_observation(&mut state, &link, id);
                return Route::Done;
            }
            state.last_activity = Instant::now();
            return Route::Ready(link, request);
        }

        if let Some(id) = request.registration() {
            // stopped while waiting
            if state.observation_mut(id).is_none() {
                return Route::Done;
            }
        }

        if use_queue {
            debug!(method = %request.method(), path = %request.path(), "link down, queueing request");
            state.queue.enqueue(request);
            drop(state);
        } else {
            let observation = request
                .registration()
                .and_then(|id| state.remove_observation(id));
            drop(state);
            debug!(method = %request.method(), path = %request.path(), "link down, rejecting request");
            if let Some(observation) = observation {
                (observation.handler)(Err(CoapError::NotConnected));
            }
            request.fail(CoapError::NotConnected);
        }

        self.start_connect();
        Route::Done
    }

    fn submit(&self, request: QueuedRequest) {
        match self.route(request, None) {
            Route::Ready(link, request) => {
                let conn = self.detached();
                tokio::spawn(async move {
                    if let Some(request) = conn.execute(link, request).await {
                        conn.park(vec![request]);
                    }
                });
            }
            Route::Parked(request) => self.park(vec![request]),
            Route::Done => {}
        }
    }

    /// Run a call to completion. Returns the request if its link was parked
    /// under it.
    async fn execute(&self, link: Link, mut request: QueuedRequest) -> Option<QueuedRequest> {
        loop {
            let Some((path, method)) = request.call_target() else {
                return None;
            };
            match self.perform(&link, &path, &method).await {
                Ok(response) => {
                    self.touch();
                    if request.wants_refresh(response.code) {
                        debug!(path = %path, "resource changed, refreshing");
                        request = request.into_refresh();
                        continue;
                    }
                    debug!(method = %request.method(), path = %path, code = %response.code, "response");
                    request.respond(response);
                }
                Err(err) if !err.is_link_failure() => {
                    debug!(path = %path, error = %err, "unreadable response");
                    request.fail(err.into());
                }
                Err(err) if link.is_parked() => {
                    debug!(path = %path, link = link.id, error = %err, "link parked, holding request");
                    return Some(request);
                }
                Err(err) => {
                    warn!(
                        method = %request.method(),
                        path = %path,
                        link = link.id,
                        error = %err,
                        "request failed on transport"
                    );
                    self.handle_link_failure(link.id, err.into(), Some(request));
                }
            }
            return None;
        }
    }

    async fn perform(
        &self,
        link: &Link,
        path: &ResourcePath,
        method: &CallMethod,
    ) -> Result<Response, ChannelError> {
        let channel = &link.channel;
        let exchange = async {
            match method {
                CallMethod::Get => channel.get(path).await,
                CallMethod::Put(body) => channel.put(path, body).await,
                CallMethod::Post(body) => channel.post(path, body).await,
            }
        };

        timeout(self.inner.config.request_timeout, exchange)
            .await
            .unwrap_or(Err(ChannelError::ReadTimeout))
    }

    fn touch(&self) {
        self.inner.state.lock().last_activity = Instant::now();
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Tear down `link` and reconnect, keeping `orphan` for the next link.
    ///
    /// Does nothing for the link itself if it has already been replaced or
    /// torn down; the orphan is routed again in that case.
    pub(crate) fn handle_link_failure(
        &self,
        link: u64,
        kind: CoapError,
        orphan: Option<QueuedRequest>,
    ) {
        let use_queue = self.inner.config.use_queue;
        let mut state = self.inner.state.lock();

        if !state.is_current(link) {
            drop(state);
            debug!(link, "failure reported for a retired link");
            if let Some(request) = orphan {
                self.submit(request);
            }
            return;
        }

        let mut rejected = Vec::new();
        if let Some(request) = orphan {
            if use_queue {
                state.queue.enqueue(request);
            } else {
                rejected.push(request);
            }
        }

        let Some(failed) = state.link.take() else {
            return;
        };
        state.draining = false;
        state.closing += 1;

        let bound: Vec<(ResourcePath, u64)> = state
            .observations
            .iter_mut()
            .filter(|(_, observation)| observation.is_bound_to(failed.id))
            .map(|(path, observation)| {
                observation.unbind();
                (path.clone(), observation.id)
            })
            .collect();
        let mut lost = Vec::new();
        for (path, id) in bound {
            if use_queue {
                state.queue.enqueue(QueuedRequest::observe(path, id));
            } else if let Some(observation) = state.remove_observation(id) {
                lost.push(observation.handler);
            }
        }
        self.inner.publish(&state);
        drop(state);

        info!(link = failed.id, kind = %kind, "link lost, reconnecting");
        for request in rejected {
            request.fail(kind);
        }
        for handler in lost {
            handler(Err(kind));
        }

        let conn = self.detached();
        tokio::spawn(async move {
            conn.release(failed).await;
            conn.inner.callbacks.disconnected();
        });
        self.start_connect();
    }

    /// A subscription task on `link` failed on the transport.
    pub(crate) fn observation_lost(&self, link: u64, registration: u64, kind: CoapError) {
        let resubmit = {
            let mut state = self.inner.state.lock();
            if state.is_current(link) {
                None
            } else {
                state
                    .observation_mut(registration)
                    .filter(|(_, observation)| observation.is_bound_to(link))
                    .map(|(path, observation)| {
                        observation.unbind();
                        QueuedRequest::observe(path.clone(), registration)
                    })
            }
        };

        match resubmit {
            Some(request) => self.submit(request),
            None => self.handle_link_failure(link, kind, None),
        }
    }

    /// The gateway answered a subscription with something unusable.
    pub(crate) fn observation_rejected(&self, registration: u64, kind: CoapError) {
        let observation = self.inner.state.lock().remove_observation(registration);
        if let Some(observation) = observation {
            (observation.handler)(Err(kind));
        }
    }

    pub(crate) fn set_observation_state(
        &self,
        link: u64,
        registration: u64,
        new_state: SubscriptionState,
    ) {
        let mut state = self.inner.state.lock();
        if let Some((_, observation)) = state.observation_mut(registration) {
            if observation.is_bound_to(link) {
                observation.state = new_state;
            }
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn start_timers(&self, link: &Link) {
        if let Some(idle) = self.inner.config.idle_timeout {
            let conn = self.detached();
            let (id, token) = (link.id, link.token.clone());
            tokio::spawn(async move { conn.watch_idle(id, token, idle).await });
        }

        if let KeepaliveStrategy::Reconnect { interval } = self.inner.config.keepalive {
            let conn = self.detached();
            let (id, token) = (link.id, link.token.clone());
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = sleep(interval) => {
                        debug!(link = id, "keepalive: recycling link");
                        conn.handle_link_failure(id, CoapError::NotConnected, None);
                    }
                }
            });
        }
    }

    async fn watch_idle(&self, link: u64, token: CancellationToken, idle: Duration) {
        loop {
            let deadline = {
                let state = self.inner.state.lock();
                if !state.is_current(link) {
                    return;
                }
                if state.observations.is_empty() && state.queue.is_empty() {
                    state.last_activity + idle
                } else {
                    Instant::now() + idle
                }
            };
            if deadline <= Instant::now() {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep_until(deadline) => {}
            }
        }

        info!(endpoint = %self.inner.config.endpoint, link, "idle, disconnecting");
        self.shutdown(Some(link)).await;
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// GET `path`; the handler receives the payload or the error.
    ///
    /// Fails synchronously only for a malformed path.
    pub fn get_with<P, F>(&self, path: P, handler: F) -> Result<(), CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
        F: FnOnce(Result<Vec<u8>, CoapError>) + Send + 'static,
    {
        let path = path.try_into()?;
        self.submit(QueuedRequest::call(
            path,
            CallMethod::Get,
            PostAction::None,
            Box::new(handler),
        ));
        Ok(())
    }

    /// PUT `payload` to `path`.
    ///
    /// Fails synchronously for a malformed path or an empty payload.
    pub fn put_with<P, B, F>(&self, path: P, payload: B, handler: F) -> Result<(), CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
        B: Into<Vec<u8>>,
        F: FnOnce(Result<Vec<u8>, CoapError>) + Send + 'static,
    {
        self.send_body(path, payload, PostAction::None, Box::new(handler), CallMethod::Put)
    }

    /// PUT `payload` to `path`, then GET the resource if it reports
    /// `2.04 Changed`. The handler receives the refreshed value.
    pub fn put_and_refresh_with<P, B, F>(
        &self,
        path: P,
        payload: B,
        handler: F,
    ) -> Result<(), CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
        B: Into<Vec<u8>>,
        F: FnOnce(Result<Vec<u8>, CoapError>) + Send + 'static,
    {
        self.send_body(path, payload, PostAction::Refresh, Box::new(handler), CallMethod::Put)
    }

    /// POST `payload` to `path`.
    ///
    /// Fails synchronously for a malformed path or an empty payload.
    pub fn post_with<P, B, F>(&self, path: P, payload: B, handler: F) -> Result<(), CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
        B: Into<Vec<u8>>,
        F: FnOnce(Result<Vec<u8>, CoapError>) + Send + 'static,
    {
        self.send_body(path, payload, PostAction::None, Box::new(handler), CallMethod::Post)
    }

    fn send_body<P, B>(
        &self,
        path: P,
        payload: B,
        post_action: PostAction,
        handler: ResponseHandler,
        method: fn(Vec<u8>) -> CallMethod,
    ) -> Result<(), CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
        B: Into<Vec<u8>>,
    {
        let path = path.try_into()?;
        let payload = payload.into();
        if payload.is_empty() {
            return Err(CoapError::NoPayload);
        }
        self.submit(QueuedRequest::call(path, method(payload), post_action, handler));
        Ok(())
    }

    /// GET `path` and wait for the result.
    pub async fn get<P>(&self, path: P) -> Result<Vec<u8>, CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
    {
        let (tx, rx) = oneshot::channel();
        self.get_with(path, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(CoapError::ConnectionCancelled))
    }

    /// PUT `payload` to `path` and wait for the result.
    pub async fn put<P, B>(&self, path: P, payload: B) -> Result<Vec<u8>, CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
        B: Into<Vec<u8>>,
    {
        let (tx, rx) = oneshot::channel();
        self.put_with(path, payload, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(CoapError::ConnectionCancelled))
    }

    /// PUT `payload` to `path`, refresh on `2.04 Changed`, and wait.
    pub async fn put_and_refresh<P, B>(&self, path: P, payload: B) -> Result<Vec<u8>, CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
        B: Into<Vec<u8>>,
    {
        let (tx, rx) = oneshot::channel();
        self.put_and_refresh_with(path, payload, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(CoapError::ConnectionCancelled))
    }

    /// POST `payload` to `path` and wait for the result.
    pub async fn post<P, B>(&self, path: P, payload: B) -> Result<Vec<u8>, CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
        B: Into<Vec<u8>>,
    {
        let (tx, rx) = oneshot::channel();
        self.post_with(path, payload, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(CoapError::ConnectionCancelled))
    }

    // =========================================================================
    // Observations
    // =========================================================================

    /// Observe `path`. The handler runs for every notification until
    /// [`stop_observing`](Self::stop_observing) or
    /// [`disconnect`](Self::disconnect).
    ///
    /// Observing a path twice replaces the first registration. Link failures
    /// are survived: the observation is re-established on the next link.
    pub fn observe<P, F>(&self, path: P, handler: F) -> Result<(), CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
        F: Fn(Result<Vec<u8>, CoapError>) + Send + Sync + 'static,
    {
        let path = path.try_into()?;
        self.register_observation(path, Arc::new(handler));
        Ok(())
    }

    /// Observe `path` and receive notifications on a channel.
    pub fn observe_stream<P>(
        &self,
        path: P,
    ) -> Result<mpsc::UnboundedReceiver<Result<Vec<u8>, CoapError>>, CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observe(path, move |notification| {
            let _ = tx.send(notification);
        })?;
        Ok(rx)
    }

    fn register_observation(&self, path: ResourcePath, handler: NotificationHandler) {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id();
            if let Some(previous) = state
                .observations
                .insert(path.clone(), Observation::new(id, handler))
            {
                debug!(path = %path, "replacing observation");
                previous.cancel.cancel();
                state.queue.remove_observations(|queued| queued == previous.id);
            }
            id
        };
        self.submit(QueuedRequest::observe(path, id));
    }

    /// Stop observing `path`.
    ///
    /// The subscription is cancelled in the background.
    pub fn stop_observing<P>(&self, path: P) -> Result<(), CoapError>
    where
        P: TryInto<ResourcePath, Error = CoapError>,
    {
        let path = path.try_into()?;
        let mut state = self.inner.state.lock();
        let id = state
            .observations
            .get(&path)
            .map(|observation| observation.id)
            .ok_or(CoapError::NotObserving)?;
        state.remove_observation(id);
        debug!(path = %path, "stopped observing");
        Ok(())
    }

    /// Spawn the subscription task for an observation on `link`.
    fn spawn_observation(&self, state: &mut LinkState, link: &Link, registration: u64) {
        let conn = self.detached();
        let Some((path, observation)) = state.observation_mut(registration) else {
            return;
        };
        if observation.link.is_some() {
            return;
        }
        observation.bind(link.id);
        let task = ObserveTask::new(conn, link.clone(), path.clone(), observation);
        link.tracker.spawn(task.run());
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.config.endpoint)
            .field("status", &state.status())
            .field("queue_len", &state.queue.len())
            .field("observations", &state.observations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rand::Rng;
    use tokio::time::timeout;

    use super::*;
    use crate::client::ConnectionBuilder;
    use crate::core::ResponseCode;
    use crate::transport::{MemoryGateway, Method};

    const WAIT: Duration = Duration::from_secs(5);
    const BULB: &str = "/15001/65537";

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn path(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    fn gateway() -> MemoryGateway {
        init_tracing();
        let gateway = MemoryGateway::new();
        gateway.set_resource(path(BULB), "on");
        gateway
    }

    fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
            .host("gateway.local")
            .identity("gatelink")
            .key("secret")
            .retry_interval(Duration::from_millis(20))
            .handshake_timeout(Duration::from_millis(500))
            .request_timeout(Duration::from_millis(500))
            .grace_timeout(Duration::from_millis(200))
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let bump = {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, bump)
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_status(conn: &Connection, status: ConnectionStatus) {
        let mut rx = conn.watch_status();
        timeout(WAIT, rx.wait_for(|current| *current == status))
            .await
            .expect("status not reached")
            .expect("status channel closed");
    }

    fn current_link(conn: &Connection) -> Option<u64> {
        conn.inner.state.lock().link.as_ref().map(|link| link.id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_and_get() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);

        conn.connect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Connected);
        assert_eq!(gateway.open_channels(), 1);

        assert_eq!(conn.get(BULB).await, Ok(b"on".to_vec()));

        // connecting again is a no-op
        conn.connect().await.unwrap();
        assert_eq!(gateway.stats().dials, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_connected_iff_channel_held() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();

        for round in 0..5 {
            gateway.fail_next_dials(round % 3);
            conn.connect().await.unwrap();
            assert_eq!(conn.status(), ConnectionStatus::Connected);
            assert!(current_link(&conn).is_some());
            eventually("stale channels closed", || gateway.open_channels() == 1).await;

            if round % 2 == 0 {
                // lose the link under a request and recover
                gateway.sever_links();
                assert_eq!(conn.get(BULB).await, Ok(b"on".to_vec()));
                assert_eq!(conn.status(), ConnectionStatus::Connected);
                eventually("severed channel closed", || gateway.open_channels() == 1).await;
            }

            conn.disconnect().await.unwrap();
            assert_eq!(conn.status(), ConnectionStatus::Disconnected);
            assert!(current_link(&conn).is_none());
            assert_eq!(gateway.open_channels(), 0);
        }
        assert_eq!(gateway.stats().close_violations, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_drains_in_fifo_order() {
        let gateway = gateway();
        for name in ["a", "b", "c"] {
            gateway.set_resource(path(name), name);
        }
        gateway.set_offline(true);
        let conn = builder().build(gateway.clone()).unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            conn.get_with(name, move |result| order.lock().push(result.unwrap()))
                .unwrap();
        }
        assert_eq!(conn.queue_len(), 3);
        assert!(order.lock().is_empty());

        gateway.set_offline(false);
        eventually("all handlers", || order.lock().len() == 3).await;

        assert_eq!(*order.lock(), [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(gateway.paths_for(Method::Get), [path("a"), path("b"), path("c")]);
        assert_eq!(conn.queue_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enqueue_returns_immediately_and_fires_after_reconnect() {
        let gateway = gateway();
        gateway.set_offline(true);
        gateway.set_latency(Duration::from_millis(50));
        let conn = builder().build(gateway.clone()).unwrap();

        let (tx, mut rx) = oneshot::channel();
        let started = Instant::now();
        conn.get_with(BULB, move |result| {
            let _ = tx.send(result);
        })
        .unwrap();
        assert!(started.elapsed() < Duration::from_millis(20));
        assert_eq!(conn.queue_len(), 1);

        sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
        assert_ne!(conn.status(), ConnectionStatus::Connected);

        gateway.set_offline(false);
        let result = timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(result, Ok(b"on".to_vec()));
        assert_eq!(conn.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disconnect_joins_subscriptions_before_close() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();
        let mut rng = rand::thread_rng();

        for round in 0..20 {
            gateway.set_latency(Duration::from_millis(rng.gen_range(0..4)));
            let observed = rng.gen_range(1..5);
            for i in 0..observed {
                let resource = format!("/15001/{}", 65537 + i);
                gateway.set_resource(path(&resource), "on");
                conn.observe(resource.as_str(), |_| {}).unwrap();
            }

            conn.connect().await.unwrap();
            sleep(Duration::from_millis(rng.gen_range(0..6))).await;
            conn.disconnect().await.unwrap();

            let stats = gateway.stats();
            assert_eq!(stats.close_violations, 0, "round {round}");
            assert_eq!(gateway.active_subscriptions(), 0, "round {round}");
            assert_eq!(gateway.open_channels(), 0, "round {round}");
            assert!(conn.observed_paths().is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_after_disconnect_waits_for_connect() {
        let gateway = gateway();
        let conn = builder()
            .retry_on_failure(false)
            .build(gateway.clone())
            .unwrap();

        conn.connect().await.unwrap();
        assert_eq!(conn.get(BULB).await, Ok(b"on".to_vec()));
        conn.disconnect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);

        gateway.set_offline(true);
        let (tx, mut rx) = oneshot::channel();
        conn.get_with(BULB, move |result| {
            let _ = tx.send(result);
        })
        .unwrap();
        assert_eq!(conn.queue_len(), 1);

        // the connect started by the request gives up
        eventually("automatic connect to fail", || {
            gateway.stats().failed_dials == 1 && conn.status() == ConnectionStatus::Disconnected
        })
        .await;
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.queue_len(), 1);

        gateway.set_offline(false);
        conn.connect().await.unwrap();
        assert_eq!(rx.try_recv(), Ok(Ok(b"on".to_vec())));
        assert_eq!(conn.queue_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_during_drain_holds_the_rest() {
        let gateway = gateway();
        let names = ["a", "b", "c", "d"];
        for name in names {
            gateway.set_resource(path(name), name);
        }
        gateway.set_offline(true);
        let conn = builder().build(gateway.clone()).unwrap();

        let served = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for name in names {
            let served = Arc::clone(&served);
            conn.get_with(name, move |result| served.lock().push(result.unwrap()))
                .unwrap();
        }

        gateway.set_latency(Duration::from_millis(60));
        gateway.set_offline(false);
        wait_for_status(&conn, ConnectionStatus::Connected).await;
        sleep(Duration::from_millis(70)).await;
        conn.disconnect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);

        // nothing reconnects on its own
        sleep(Duration::from_millis(300)).await;
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert_eq!(gateway.stats().dials, 1);
        let held = conn.queue_len();
        assert!(held >= 1);
        assert_eq!(served.lock().len() + held, names.len());

        gateway.set_latency(Duration::ZERO);
        conn.connect().await.unwrap();
        let expected: Vec<Vec<u8>> = names.iter().map(|name| name.as_bytes().to_vec()).collect();
        assert_eq!(*served.lock(), expected);
        assert_eq!(conn.queue_len(), 0);
        assert_eq!(gateway.stats().dials, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_in_flight_at_disconnect_waits_for_connect() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();
        conn.connect().await.unwrap();

        gateway.set_latency(Duration::from_millis(100));
        let (tx, mut rx) = oneshot::channel();
        conn.get_with(BULB, move |result| {
            let _ = tx.send(result);
        })
        .unwrap();
        sleep(Duration::from_millis(30)).await;
        conn.disconnect().await.unwrap();

        eventually("request held", || conn.queue_len() == 1).await;
        sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert_eq!(gateway.stats().dials, 1);

        gateway.set_latency(Duration::ZERO);
        conn.connect().await.unwrap();
        assert_eq!(rx.try_recv(), Ok(Ok(b"on".to_vec())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnected_published_after_channel_closed() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();
        conn.connect().await.unwrap();
        conn.observe(BULB, |_| {}).unwrap();
        eventually("subscribed", || gateway.active_subscriptions() == 1).await;

        let mut rx = conn.watch_status();
        let watched = gateway.clone();
        let watcher = tokio::spawn(async move {
            rx.wait_for(|status| *status == ConnectionStatus::Disconnected)
                .await
                .map(|_| ())
                .unwrap();
            watched.open_channels()
        });

        conn.disconnect().await.unwrap();
        let open_when_published = timeout(WAIT, watcher).await.unwrap().unwrap();
        assert_eq!(open_when_published, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handshake_failure_without_retry() {
        let gateway = gateway();
        gateway.set_offline(true);
        let (failed, on_failed) = counter();
        let conn = builder()
            .retry_on_failure(false)
            .on_connection_failed(on_failed)
            .build(gateway.clone())
            .unwrap();

        assert_eq!(conn.connect().await, Err(CoapError::HandshakeFailed));
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retries_until_gateway_accepts() {
        let gateway = gateway();
        gateway.fail_next_dials(3);
        let (failed, on_failed) = counter();
        let (connected, on_connect) = counter();
        let conn = builder()
            .on_connection_failed(on_failed)
            .on_connect(on_connect)
            .build(gateway.clone())
            .unwrap();

        conn.connect().await.unwrap();
        assert_eq!(failed.load(Ordering::SeqCst), 3);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.stats().dials, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wrong_key_is_a_handshake_failure() {
        let gateway = gateway();
        gateway.require_credentials(crate::transport::PskCredentials::new("gatelink", "other"));
        let conn = builder()
            .retry_on_failure(false)
            .build(gateway.clone())
            .unwrap();
        assert_eq!(conn.connect().await, Err(CoapError::HandshakeFailed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_cancels_retry_loop() {
        let gateway = gateway();
        gateway.set_offline(true);
        let (cancelled, on_cancel) = counter();
        let (disconnected, on_disconnect) = counter();
        let conn = builder()
            .on_cancel(on_cancel)
            .on_disconnect(on_disconnect)
            .build(gateway.clone())
            .unwrap();

        let handle = conn.start_connect().unwrap();
        assert!(conn.start_connect().is_none());
        assert_eq!(conn.status(), ConnectionStatus::Connecting);
        eventually("a failed dial", || gateway.stats().failed_dials >= 1).await;

        conn.disconnect().await.unwrap();
        let outcome = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(outcome, Err(CoapError::ConnectionCancelled));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_protocol_errors_are_final() {
        let gateway = gateway();
        gateway.force_code(path("15001/locked"), ResponseCode::UNAUTHORIZED);
        gateway.force_code(path("15001/broken"), ResponseCode::INTERNAL_SERVER_ERROR);
        let conn = builder().build(gateway.clone()).unwrap();
        conn.connect().await.unwrap();

        assert_eq!(conn.get("/15001/missing").await, Err(CoapError::UriNotFound));
        assert_eq!(conn.get("/15001/locked").await, Err(CoapError::Unauthorized));
        assert_eq!(conn.get("/15001/broken").await, Err(CoapError::UnknownStatus));
        assert_eq!(conn.put("/15001/missing", "1").await, Err(CoapError::UriNotFound));

        assert_eq!(conn.status(), ConnectionStatus::Connected);
        assert_eq!(gateway.stats().dials, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejects_bad_input_synchronously() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();

        assert_eq!(conn.put_with(BULB, "", |_| {}), Err(CoapError::NoPayload));
        assert_eq!(conn.post(BULB, Vec::new()).await, Err(CoapError::NoPayload));
        assert_eq!(conn.get_with("/15001//1", |_| {}), Err(CoapError::InvalidPath));
        assert_eq!(conn.get("").await, Err(CoapError::InvalidPath));

        assert_eq!(conn.queue_len(), 0);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transport_failure_requeues_and_reconnects() {
        let gateway = gateway();
        let (disconnected, on_disconnect) = counter();
        let (connected, on_connect) = counter();
        let conn = builder()
            .on_disconnect(on_disconnect)
            .on_connect(on_connect)
            .build(gateway.clone())
            .unwrap();
        conn.connect().await.unwrap();

        gateway.fail_next_requests(1);
        assert_eq!(conn.get(BULB).await, Ok(b"on".to_vec()));

        assert_eq!(gateway.stats().dials, 2);
        assert_eq!(connected.load(Ordering::SeqCst), 2);
        eventually("old link released", || disconnected.load(Ordering::SeqCst) == 1).await;
        eventually("old channel closed", || gateway.open_channels() == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreadable_response_is_final() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();
        conn.connect().await.unwrap();

        gateway.fail_next_request_with(ChannelError::BadResponseData("truncated".into()));
        assert_eq!(conn.get(BULB).await, Err(CoapError::BadResponseData));

        assert_eq!(conn.status(), ConnectionStatus::Connected);
        assert_eq!(conn.queue_len(), 0);
        assert_eq!(gateway.stats().dials, 1);
        assert_eq!(conn.get(BULB).await, Ok(b"on".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hung_request_times_out_and_recovers() {
        let gateway = gateway();
        let conn = builder()
            .request_timeout(Duration::from_millis(100))
            .build(gateway.clone())
            .unwrap();
        conn.connect().await.unwrap();
        let first = current_link(&conn).unwrap();

        gateway.hang_next_requests(1);
        let started = Instant::now();
        assert_eq!(conn.get(BULB).await, Ok(b"on".to_vec()));
        assert!(started.elapsed() >= Duration::from_millis(100));

        assert_eq!(gateway.stats().dials, 2);
        assert!(current_link(&conn).is_some_and(|id| id != first));
        eventually("hung channel closed", || gateway.open_channels() == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_failure_reports_are_ignored() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();
        conn.connect().await.unwrap();
        let first = current_link(&conn).unwrap();

        conn.handle_link_failure(first, CoapError::ReadTimeout, None);
        eventually("new link", || current_link(&conn).is_some_and(|id| id != first)).await;
        let second = current_link(&conn).unwrap();

        // a late detector reports the old link again
        conn.handle_link_failure(first, CoapError::ReadTimeout, None);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(current_link(&conn), Some(second));
        assert_eq!(gateway.stats().dials, 2);
        assert_eq!(gateway.open_channels(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_without_queue_requests_fail_fast() {
        let gateway = gateway();
        gateway.set_offline(true);
        let conn = builder()
            .use_queue(false)
            .build(gateway.clone())
            .unwrap();

        assert_eq!(conn.get(BULB).await, Err(CoapError::NotConnected));
        assert_eq!(conn.queue_len(), 0);
        assert_eq!(conn.status(), ConnectionStatus::Connecting);

        gateway.set_offline(false);
        wait_for_status(&conn, ConnectionStatus::Connected).await;
        assert_eq!(conn.get(BULB).await, Ok(b"on".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_put_and_refresh() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();
        conn.connect().await.unwrap();

        assert_eq!(conn.put(BULB, "off").await, Ok(Vec::new()));
        assert_eq!(conn.put_and_refresh(BULB, "dim").await, Ok(b"dim".to_vec()));

        let methods: Vec<_> = gateway.exchanges().iter().map(|e| e.method).collect();
        assert_eq!(methods, [Method::Put, Method::Put, Method::Get]);
        assert_eq!(gateway.resource(&path(BULB)), Some(b"dim".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_post_creates_resource() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();

        assert_eq!(conn.post("/15004/131073", "scene").await, Ok(Vec::new()));
        assert_eq!(gateway.resource(&path("15004/131073")), Some(b"scene".to_vec()));
        assert_eq!(conn.get("/15004/131073").await, Ok(b"scene".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_timeout_disconnects_and_next_request_reconnects() {
        let gateway = gateway();
        let (disconnected, on_disconnect) = counter();
        let conn = builder()
            .idle_timeout(Duration::from_millis(100))
            .on_disconnect(on_disconnect)
            .build(gateway.clone())
            .unwrap();

        conn.connect().await.unwrap();
        assert_eq!(conn.get(BULB).await, Ok(b"on".to_vec()));
        wait_for_status(&conn, ConnectionStatus::Disconnected).await;
        eventually("idle teardown", || disconnected.load(Ordering::SeqCst) == 1).await;
        assert_eq!(gateway.open_channels(), 0);

        assert_eq!(conn.get(BULB).await, Ok(b"on".to_vec()));
        assert_eq!(gateway.stats().dials, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_timeout_spares_observed_links() {
        let gateway = gateway();
        let conn = builder()
            .idle_timeout(Duration::from_millis(50))
            .build(gateway.clone())
            .unwrap();

        conn.observe(BULB, |_| {}).unwrap();
        conn.connect().await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.status(), ConnectionStatus::Connected);

        conn.stop_observing(BULB).unwrap();
        wait_for_status(&conn, ConnectionStatus::Disconnected).await;
        assert_eq!(gateway.stats().close_violations, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconnect_keepalive_recycles_link() {
        let gateway = gateway();
        let conn = builder()
            .keepalive(KeepaliveStrategy::Reconnect {
                interval: Duration::from_millis(50),
            })
            .build(gateway.clone())
            .unwrap();

        let mut notifications = conn.observe_stream(BULB).unwrap();
        conn.connect().await.unwrap();
        eventually("two recycles", || gateway.stats().dials >= 3).await;

        wait_for_status(&conn, ConnectionStatus::Connected).await;
        eventually("resubscribed", || gateway.active_subscriptions_for(&path(BULB)) == 1).await;
        gateway.notify(&path(BULB), "off");

        let deadline = Instant::now() + WAIT;
        loop {
            let next = timeout(deadline - Instant::now(), notifications.recv())
                .await
                .unwrap()
                .unwrap();
            if next == Ok(b"off".to_vec()) {
                break;
            }
        }
        assert_eq!(gateway.stats().close_violations, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_fails_queued_requests() {
        let gateway = gateway();
        gateway.set_offline(true);
        let conn = builder().build(gateway.clone()).unwrap();

        let (tx, rx) = oneshot::channel();
        conn.get_with(BULB, move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

        conn.close().await.unwrap();
        assert_eq!(rx.await, Ok(Err(CoapError::ConnectionCancelled)));
        assert_eq!(conn.queue_len(), 0);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_last_handle_cancels_everything() {
        let gateway = gateway();
        let conn = builder().build(gateway.clone()).unwrap();
        conn.connect().await.unwrap();
        conn.observe(BULB, |_| {}).unwrap();
        eventually("subscribed", || gateway.active_subscriptions() == 1).await;

        gateway.set_offline(true);
        gateway.sever_links();
        let (tx, rx) = oneshot::channel();
        conn.get_with("/15001/65538", move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

        drop(conn);
        let result = timeout(WAIT, rx).await.unwrap();
        assert_eq!(result, Ok(Err(CoapError::ConnectionCancelled)));
        eventually("channel closed", || gateway.open_channels() == 0).await;
        assert_eq!(gateway.active_subscriptions(), 0);
    }
}
