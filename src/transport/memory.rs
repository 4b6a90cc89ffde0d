//! In-memory gateway.
//!
//! Implements [`Dialer`] and [`SecureChannel`] without any I/O. Resources are
//! kept in a map, notifications are pushed with [`MemoryGateway::notify`],
//! and the failure modes a connection has to survive can be injected:
//! refused handshakes, failing or hanging requests, failing observes, added
//! latency, and links that die silently.
//!
//! The gateway also checks the teardown order of its clients: closing a
//! channel while one of its subscriptions has not been cancelled is counted
//! in [`GatewayStats::close_violations`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::channel::{
    Dialer, Endpoint, Method, NotificationSink, PskCredentials, Response, SecureChannel,
    Subscription,
};
use crate::core::{ChannelError, ResourcePath, ResponseCode};

/// One request as seen by the gateway, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Channel the request arrived on.
    pub channel: u64,
    /// Request method.
    pub method: Method,
    /// Target resource.
    pub path: ResourcePath,
}

/// Counters kept by the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// Handshakes attempted.
    pub dials: usize,
    /// Handshakes refused.
    pub failed_dials: usize,
    /// Channels closed by the client.
    pub closes: usize,
    /// Channels closed while they still had uncancelled subscriptions.
    pub close_violations: usize,
    /// Subscriptions registered.
    pub subscriptions_opened: usize,
    /// Subscriptions cancelled by the client.
    pub subscriptions_cancelled: usize,
}

type SharedSink = Arc<dyn Fn(Response) + Send + Sync>;

struct ActiveSubscription {
    channel: u64,
    path: ResourcePath,
    sink: SharedSink,
}

#[derive(Default)]
struct GatewayState {
    resources: HashMap<ResourcePath, Vec<u8>>,
    forced: HashMap<ResourcePath, ResponseCode>,
    credentials: Option<PskCredentials>,
    offline: bool,
    fail_dials: usize,
    fail_requests: VecDeque<ChannelError>,
    fail_observes: VecDeque<ChannelError>,
    hang_requests: usize,
    latency: Duration,
    next_id: u64,
    open_channels: HashSet<u64>,
    severed: HashSet<u64>,
    subscriptions: HashMap<u64, ActiveSubscription>,
    log: Vec<Exchange>,
    stats: GatewayStats,
}

impl GatewayState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_link(&self, channel: u64) -> Result<(), ChannelError> {
        if !self.open_channels.contains(&channel) {
            return Err(ChannelError::Closed);
        }
        if self.severed.contains(&channel) {
            return Err(ChannelError::ReadTimeout);
        }
        Ok(())
    }

    fn accepts(&self, credentials: &PskCredentials) -> bool {
        match &self.credentials {
            Some(expected) => {
                expected.identity() == credentials.identity() && expected.key() == credentials.key()
            }
            None => true,
        }
    }

    fn sinks_for(&self, path: &ResourcePath) -> Vec<SharedSink> {
        self.subscriptions
            .values()
            .filter(|sub| &sub.path == path && !self.severed.contains(&sub.channel))
            .map(|sub| Arc::clone(&sub.sink))
            .collect()
    }
}

/// An in-process gateway.
///
/// Cheap to clone; all clones share the same resources and counters.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl MemoryGateway {
    /// Create an empty gateway that accepts any credentials.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept handshakes with these credentials.
    pub fn require_credentials(&self, credentials: PskCredentials) {
        self.state.lock().credentials = Some(credentials);
    }

    /// Create or replace a resource without notifying observers.
    pub fn set_resource(&self, path: ResourcePath, payload: impl Into<Vec<u8>>) {
        self.state.lock().resources.insert(path, payload.into());
    }

    /// Current value of a resource.
    pub fn resource(&self, path: &ResourcePath) -> Option<Vec<u8>> {
        self.state.lock().resources.get(path).cloned()
    }

    /// Answer every request for `path` with `code` and an empty body.
    pub fn force_code(&self, path: ResourcePath, code: ResponseCode) {
        self.state.lock().forced.insert(path, code);
    }

    /// Refuse (or accept again) all handshakes.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Refuse the next `n` handshakes.
    pub fn fail_next_dials(&self, n: usize) {
        self.state.lock().fail_dials = n;
    }

    /// Fail the next `n` GET/PUT/POST exchanges with a read timeout.
    pub fn fail_next_requests(&self, n: usize) {
        let mut state = self.state.lock();
        state.fail_requests.clear();
        state
            .fail_requests
            .extend(std::iter::repeat_with(|| ChannelError::ReadTimeout).take(n));
    }

    /// Fail the next GET/PUT/POST exchange with `error`, after any failures
    /// already scheduled.
    pub fn fail_next_request_with(&self, error: ChannelError) {
        self.state.lock().fail_requests.push_back(error);
    }

    /// Never answer the next `n` GET/PUT/POST exchanges.
    pub fn hang_next_requests(&self, n: usize) {
        self.state.lock().hang_requests = n;
    }

    /// Fail the next `n` observe registrations with a read timeout.
    pub fn fail_next_observes(&self, n: usize) {
        let mut state = self.state.lock();
        state.fail_observes.clear();
        state
            .fail_observes
            .extend(std::iter::repeat_with(|| ChannelError::ReadTimeout).take(n));
    }

    /// Fail the next observe registration with `error`, after any failures
    /// already scheduled.
    pub fn fail_next_observe_with(&self, error: ChannelError) {
        self.state.lock().fail_observes.push_back(error);
    }

    /// Delay every handshake and exchange by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Make every open channel fail from now on, without telling the client.
    pub fn sever_links(&self) {
        let mut state = self.state.lock();
        let open: Vec<u64> = state.open_channels.iter().copied().collect();
        state.severed.extend(open);
    }

    /// Update a resource and push the new value to its observers.
    ///
    /// Returns the number of subscriptions notified.
    pub fn notify(&self, path: &ResourcePath, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let sinks = {
            let mut state = self.state.lock();
            state.resources.insert(path.clone(), payload.clone());
            state.sinks_for(path)
        };
        for sink in &sinks {
            sink(Response::new(ResponseCode::CONTENT, payload.clone()));
        }
        sinks.len()
    }

    /// Number of subscriptions not yet cancelled.
    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Number of subscriptions not yet cancelled for `path`.
    pub fn active_subscriptions_for(&self, path: &ResourcePath) -> usize {
        self.state
            .lock()
            .subscriptions
            .values()
            .filter(|sub| &sub.path == path)
            .count()
    }

    /// Number of channels not yet closed.
    pub fn open_channels(&self) -> usize {
        self.state.lock().open_channels.len()
    }

    /// Every exchange seen so far, in arrival order.
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.state.lock().log.clone()
    }

    /// Paths of all exchanges with `method`, in arrival order.
    pub fn paths_for(&self, method: Method) -> Vec<ResourcePath> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|exchange| exchange.method == method)
            .map(|exchange| exchange.path.clone())
            .collect()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> GatewayStats {
        self.state.lock().stats
    }

    fn latency(&self) -> Duration {
        self.state.lock().latency
    }
}

impl std::fmt::Debug for MemoryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryGateway")
            .field("resources", &state.resources.len())
            .field("open_channels", &state.open_channels.len())
            .field("subscriptions", &state.subscriptions.len())
            .field("stats", &state.stats)
            .finish()
    }
}

#[async_trait]
impl Dialer for MemoryGateway {
    async fn dial(
        &self,
        _endpoint: &Endpoint,
        credentials: &PskCredentials,
    ) -> Result<Arc<dyn SecureChannel>, ChannelError> {
        delay(self.latency()).await;

        let mut state = self.state.lock();
        state.stats.dials += 1;

        let refusal = if state.offline {
            Some("gateway unreachable")
        } else if state.fail_dials > 0 {
            state.fail_dials -= 1;
            Some("handshake refused")
        } else if !state.accepts(credentials) {
            Some("psk mismatch")
        } else {
            None
        };
        if let Some(reason) = refusal {
            state.stats.failed_dials += 1;
            return Err(ChannelError::Handshake(reason.into()));
        }

        let id = state.next_id();
        state.open_channels.insert(id);
        Ok(Arc::new(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<GatewayState>>,
}

impl MemoryChannel {
    async fn exchange(
        &self,
        method: Method,
        path: &ResourcePath,
        payload: Option<&[u8]>,
    ) -> Result<Response, ChannelError> {
        let latency = {
            let state = self.state.lock();
            state.check_link(self.id)?;
            state.latency
        };
        delay(latency).await;

        let hang = {
            let mut state = self.state.lock();
            state.check_link(self.id)?;
            if let Some(error) = state.fail_requests.pop_front() {
                return Err(error);
            }
            if state.hang_requests > 0 {
                state.hang_requests -= 1;
                true
            } else {
                false
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let (response, sinks) = {
            let mut state = self.state.lock();
            state.check_link(self.id)?;
            state.log.push(Exchange {
                channel: self.id,
                method,
                path: path.clone(),
            });
            if let Some(code) = state.forced.get(path) {
                return Ok(Response::new(*code, Vec::new()));
            }

            match (method, payload) {
                (Method::Get, _) => match state.resources.get(path) {
                    Some(value) => (Response::new(ResponseCode::CONTENT, value.clone()), Vec::new()),
                    None => (Response::new(ResponseCode::NOT_FOUND, Vec::new()), Vec::new()),
                },
                (Method::Put, Some(body)) => {
                    if state.resources.contains_key(path) {
                        state.resources.insert(path.clone(), body.to_vec());
                        (Response::new(ResponseCode::CHANGED, Vec::new()), state.sinks_for(path))
                    } else {
                        (Response::new(ResponseCode::NOT_FOUND, Vec::new()), Vec::new())
                    }
                }
                (Method::Post, Some(body)) => {
                    let code = if state.resources.contains_key(path) {
                        ResponseCode::CHANGED
                    } else {
                        ResponseCode::CREATED
                    };
                    state.resources.insert(path.clone(), body.to_vec());
                    (Response::new(code, Vec::new()), state.sinks_for(path))
                }
                _ => (
                    Response::new(ResponseCode::METHOD_NOT_ALLOWED, Vec::new()),
                    Vec::new(),
                ),
            }
        };

        if let Some(body) = payload {
            for sink in &sinks {
                sink(Response::new(ResponseCode::CONTENT, body.to_vec()));
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl SecureChannel for MemoryChannel {
    async fn get(&self, path: &ResourcePath) -> Result<Response, ChannelError> {
        self.exchange(Method::Get, path, None).await
    }

    async fn put(&self, path: &ResourcePath, payload: &[u8]) -> Result<Response, ChannelError> {
        self.exchange(Method::Put, path, Some(payload)).await
    }

    async fn post(&self, path: &ResourcePath, payload: &[u8]) -> Result<Response, ChannelError> {
        self.exchange(Method::Post, path, Some(payload)).await
    }

    async fn observe(
        &self,
        path: &ResourcePath,
        sink: NotificationSink,
    ) -> Result<Box<dyn Subscription>, ChannelError> {
        let latency = {
            let state = self.state.lock();
            state.check_link(self.id)?;
            state.latency
        };
        delay(latency).await;

        let sink: SharedSink = Arc::from(sink);
        let (id, initial) = {
            let mut state = self.state.lock();
            state.check_link(self.id)?;
            if let Some(error) = state.fail_observes.pop_front() {
                return Err(error);
            }
            state.log.push(Exchange {
                channel: self.id,
                method: Method::Observe,
                path: path.clone(),
            });

            let id = state.next_id();
            state.subscriptions.insert(
                id,
                ActiveSubscription {
                    channel: self.id,
                    path: path.clone(),
                    sink: Arc::clone(&sink),
                },
            );
            state.stats.subscriptions_opened += 1;

            let initial = match state.forced.get(path) {
                Some(code) => Response::new(*code, Vec::new()),
                None => match state.resources.get(path) {
                    Some(value) => Response::new(ResponseCode::CONTENT, value.clone()),
                    None => Response::new(ResponseCode::NOT_FOUND, Vec::new()),
                },
            };
            (id, initial)
        };

        // The registration response doubles as the first notification.
        sink(initial);

        Ok(Box::new(MemorySubscription {
            id,
            channel: self.id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if !state.open_channels.remove(&self.id) {
            return Err(ChannelError::Closed);
        }
        state.severed.remove(&self.id);
        state.stats.closes += 1;

        let id = self.id;
        let before = state.subscriptions.len();
        state.subscriptions.retain(|_, sub| sub.channel != id);
        if state.subscriptions.len() != before {
            state.stats.close_violations += 1;
        }
        Ok(())
    }
}

struct MemorySubscription {
    id: u64,
    channel: u64,
    state: Arc<Mutex<GatewayState>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn cancel(self: Box<Self>) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        // The client has released the handle even if the deregistration
        // cannot reach the gateway.
        if state.subscriptions.remove(&self.id).is_some() {
            state.stats.subscriptions_cancelled += 1;
        }
        state.check_link(self.channel)
    }
}

async fn delay(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}
