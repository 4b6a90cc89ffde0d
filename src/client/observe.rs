//! Observe subsystem.
//!
//! Every observed resource has a registration in the connection state and,
//! while a link is up, one subscription task running on that link's
//! [`TaskTracker`](tokio_util::task::TaskTracker). Teardown cancels the link
//! token and joins the tracker before the channel is closed, so no
//! subscription outlives its channel.
//!
//! ```text
//! Idle ─► Subscribing ─► Active ─┬─► Renewing ─► Active
//!                                └─► Cancelling ─► Terminated
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::{ChannelError, CoapError, ResourcePath, classify};
use crate::transport::{NotificationSink, Response, Subscription};

use super::config::KeepaliveStrategy;
use super::connection::{Connection, Link};

/// Handler invoked for every notification of an observed resource.
pub type NotificationHandler = Arc<dyn Fn(Result<Vec<u8>, CoapError>) + Send + Sync>;

type Notification = Result<Vec<u8>, CoapError>;

/// Lifecycle of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Registered, waiting for a link.
    Idle,
    /// Registration request in flight.
    Subscribing,
    /// Receiving notifications.
    Active,
    /// Keepalive: re-registering.
    Renewing,
    /// Releasing the subscription.
    Cancelling,
    /// Task finished.
    Terminated,
}

/// Registry entry for an observed path.
pub(crate) struct Observation {
    pub(crate) id: u64,
    pub(crate) handler: NotificationHandler,
    pub(crate) cancel: CancellationToken,
    /// Link the subscription task runs on, if any.
    pub(crate) link: Option<u64>,
    pub(crate) state: SubscriptionState,
}

impl Observation {
    pub(crate) fn new(id: u64, handler: NotificationHandler) -> Self {
        Self {
            id,
            handler,
            cancel: CancellationToken::new(),
            link: None,
            state: SubscriptionState::Idle,
        }
    }

    pub(crate) fn bind(&mut self, link: u64) {
        self.link = Some(link);
        self.state = SubscriptionState::Subscribing;
    }

    pub(crate) fn unbind(&mut self) {
        self.link = None;
        self.state = SubscriptionState::Idle;
    }

    pub(crate) fn is_bound_to(&self, link: u64) -> bool {
        self.link == Some(link)
    }
}

/// Subscription task for one observation on one link.
pub(crate) struct ObserveTask {
    conn: Connection,
    link: Link,
    path: ResourcePath,
    registration: u64,
    handler: NotificationHandler,
    cancel: CancellationToken,
}

impl ObserveTask {
    pub(crate) fn new(
        conn: Connection,
        link: Link,
        path: ResourcePath,
        observation: &Observation,
    ) -> Self {
        Self {
            conn,
            link,
            path,
            registration: observation.id,
            handler: Arc::clone(&observation.handler),
            cancel: observation.cancel.clone(),
        }
    }

    pub(crate) async fn run(self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop_delivery = CancellationToken::new();
        self.link.tracker.spawn(deliver(
            rx,
            Arc::clone(&self.handler),
            stop_delivery.clone(),
        ));
        let _stop_delivery = stop_delivery.drop_guard();

        let mut subscription = match self.subscribe(&tx).await {
            Ok(subscription) => subscription,
            Err(err) => return self.fail(err),
        };
        self.set_state(SubscriptionState::Active);
        debug!(path = %self.path, link = self.link.id, "observing");

        let mut renew = match self.conn.config().keepalive {
            KeepaliveStrategy::Resubscribe { interval } => {
                let mut ticker = interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(ticker)
            }
            _ => None,
        };

        loop {
            tokio::select! {
                biased;
                _ = self.link.token.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                _ = next_tick(&mut renew) => {
                    self.set_state(SubscriptionState::Renewing);
                    debug!(path = %self.path, "renewing subscription");
                    // the old handle goes before a new one is requested
                    self.release(subscription).await;
                    subscription = match self.subscribe(&tx).await {
                        Ok(subscription) => subscription,
                        Err(err) => return self.fail(err),
                    };
                    self.set_state(SubscriptionState::Active);
                }
            }
        }

        self.set_state(SubscriptionState::Cancelling);
        self.release(subscription).await;
        self.set_state(SubscriptionState::Terminated);
        debug!(path = %self.path, link = self.link.id, "observation ended");
    }

    async fn subscribe(
        &self,
        tx: &mpsc::UnboundedSender<Notification>,
    ) -> Result<Box<dyn Subscription>, ChannelError> {
        let tx = tx.clone();
        let sink: NotificationSink = Box::new(move |response: Response| {
            let _ = tx.send(classify(response.code).map(|()| response.payload));
        });

        let request_timeout = self.conn.config().request_timeout;
        timeout(request_timeout, self.link.channel.observe(&self.path, sink))
            .await
            .unwrap_or(Err(ChannelError::ReadTimeout))
    }

    async fn release(&self, subscription: Box<dyn Subscription>) {
        let grace = self.conn.config().grace_timeout;
        match timeout(grace, subscription.cancel()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(path = %self.path, error = %err, "cancel not acknowledged"),
            Err(_) => warn!(path = %self.path, "cancel timed out"),
        }
    }

    fn fail(&self, err: ChannelError) {
        if err.is_link_failure() {
            warn!(path = %self.path, link = self.link.id, error = %err, "subscription failed");
            self.conn
                .observation_lost(self.link.id, self.registration, err.into());
        } else {
            warn!(path = %self.path, error = %err, "subscription rejected");
            self.conn
                .observation_rejected(self.registration, err.into());
        }
    }

    fn set_state(&self, state: SubscriptionState) {
        self.conn
            .set_observation_state(self.link.id, self.registration, state);
    }
}

/// Hands notifications to the handler off the channel's read path.
async fn deliver(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    handler: NotificationHandler,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            notification = rx.recv() => match notification {
                Some(notification) => handler(notification),
                None => break,
            },
            _ = stop.cancelled() => break,
        }
    }
}

async fn next_tick(renew: &mut Option<Interval>) {
    match renew {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
