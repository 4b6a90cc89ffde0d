//! Requests buffered while the link is down.
//!
//! The queue itself is not synchronized. It lives inside the connection
//! state and is only touched under the connection lock, so enqueueing never
//! waits on I/O and a drain sees a consistent snapshot.

use std::collections::VecDeque;
use std::fmt;

use tokio::time::Instant;

use crate::core::{CoapError, ResourcePath, ResponseCode, classify};
use crate::transport::{Method, Response};

/// Completion handler for a single request.
///
/// Receives the payload on success or the classified error. Called exactly
/// once, unless the request is dropped together with its connection.
pub type ResponseHandler = Box<dyn FnOnce(Result<Vec<u8>, CoapError>) + Send>;

/// What to do after a successful POST or PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostAction {
    /// Deliver the response payload as is.
    #[default]
    None,
    /// After a `2.04 Changed`, GET the resource and deliver its new value.
    Refresh,
}

/// Body-carrying request methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallMethod {
    Get,
    Put(Vec<u8>),
    Post(Vec<u8>),
}

/// A request/response exchange waiting for its handler.
pub(crate) struct Call {
    pub(crate) method: CallMethod,
    pub(crate) handler: ResponseHandler,
    pub(crate) post_action: PostAction,
}

pub(crate) enum Operation {
    Call(Call),
    /// (Re-)register the observation with this registration id.
    Observe(u64),
}

/// A request that could not be sent yet.
pub struct QueuedRequest {
    path: ResourcePath,
    pub(crate) operation: Operation,
    enqueued_at: Instant,
}

impl QueuedRequest {
    pub(crate) fn call(
        path: ResourcePath,
        method: CallMethod,
        post_action: PostAction,
        handler: ResponseHandler,
    ) -> Self {
        Self {
            path,
            operation: Operation::Call(Call {
                method,
                handler,
                post_action,
            }),
            enqueued_at: Instant::now(),
        }
    }

    pub(crate) fn observe(path: ResourcePath, registration: u64) -> Self {
        Self {
            path,
            operation: Operation::Observe(registration),
            enqueued_at: Instant::now(),
        }
    }

    /// Request method.
    pub fn method(&self) -> Method {
        match &self.operation {
            Operation::Call(call) => match call.method {
                CallMethod::Get => Method::Get,
                CallMethod::Put(_) => Method::Put,
                CallMethod::Post(_) => Method::Post,
            },
            Operation::Observe(_) => Method::Observe,
        }
    }

    /// Target resource.
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Request body, for PUT and POST.
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.operation {
            Operation::Call(Call {
                method: CallMethod::Put(body) | CallMethod::Post(body),
                ..
            }) => Some(body),
            _ => None,
        }
    }

    /// When the request was created.
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Registration id, for observe requests.
    pub(crate) fn registration(&self) -> Option<u64> {
        match self.operation {
            Operation::Observe(id) => Some(id),
            Operation::Call(_) => None,
        }
    }

    /// Target and method of a call, detached from its handler.
    pub(crate) fn call_target(&self) -> Option<(ResourcePath, CallMethod)> {
        match &self.operation {
            Operation::Call(call) => Some((self.path.clone(), call.method.clone())),
            Operation::Observe(_) => None,
        }
    }

    /// A response arrived and the caller asked for a refresh of the resource.
    pub(crate) fn wants_refresh(&self, code: ResponseCode) -> bool {
        matches!(
            &self.operation,
            Operation::Call(Call { post_action: PostAction::Refresh, .. }) if code == ResponseCode::CHANGED
        )
    }

    /// Turn a PUT/POST into the GET that refreshes its target.
    pub(crate) fn into_refresh(self) -> Self {
        let Self {
            path,
            operation,
            enqueued_at,
        } = self;
        let operation = match operation {
            Operation::Call(call) => Operation::Call(Call {
                method: CallMethod::Get,
                handler: call.handler,
                post_action: PostAction::None,
            }),
            observe => observe,
        };
        Self {
            path,
            operation,
            enqueued_at,
        }
    }

    /// Classify the response and hand the outcome to the handler.
    pub(crate) fn respond(self, response: Response) {
        self.complete(classify(response.code).map(|()| response.payload));
    }

    /// Fail the request. Observe requests have no handler here.
    pub(crate) fn fail(self, error: CoapError) {
        self.complete(Err(error));
    }

    fn complete(self, outcome: Result<Vec<u8>, CoapError>) {
        if let Operation::Call(call) = self.operation {
            (call.handler)(outcome);
        }
    }
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("method", &self.method())
            .field("path", &self.path)
            .field("payload_len", &self.payload().map(<[u8]>::len))
            .finish()
    }
}

/// FIFO of requests waiting for a link.
#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<QueuedRequest>,
}

impl RequestQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request.
    pub fn enqueue(&mut self, request: QueuedRequest) {
        self.items.push_back(request);
    }

    /// Remove and return every queued request, oldest first.
    pub fn take_all(&mut self) -> VecDeque<QueuedRequest> {
        std::mem::take(&mut self.items)
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queued requests, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedRequest> {
        self.items.iter()
    }

    /// Put requests back at the front, keeping their order.
    pub(crate) fn restore(&mut self, requests: Vec<QueuedRequest>) {
        for request in requests.into_iter().rev() {
            self.items.push_front(request);
        }
    }

    /// Drop queued observe requests matching the predicate.
    pub(crate) fn remove_observations(&mut self, mut matches: impl FnMut(u64) -> bool) {
        self.items
            .retain(|request| !request.registration().is_some_and(&mut matches));
    }

    /// Fail every queued request with `error`.
    pub fn fail_all(&mut self, error: CoapError) {
        for request in self.take_all() {
            request.fail(error);
        }
    }
}
