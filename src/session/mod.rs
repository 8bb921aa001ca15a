//! Session layer: the duplex-stream and long-poll client flavors, plus the
//! pieces they share.

pub mod polling;
pub mod transport;

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::descriptor::ConfigIdentity;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Stream is open, setup/probe handshake in flight.
    Registering,
    Connected,
    Reconnecting,
    Closed,
}

type UnsubscribeFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Handle for one callback registration. Dropping it does nothing; call
/// [`Subscription::unsubscribe`] to remove the registration.
pub struct Subscription {
    identity: ConfigIdentity,
    unsubscribe: Option<UnsubscribeFn>,
}

impl Subscription {
    pub(crate) fn new(identity: ConfigIdentity, unsubscribe: UnsubscribeFn) -> Self {
        Self {
            identity,
            unsubscribe: Some(unsubscribe),
        }
    }

    pub fn identity(&self) -> &ConfigIdentity {
        &self.identity
    }

    /// Removes this registration. When it was the entry's last callback the
    /// session also stops watching the entry on the wire.
    pub async fn unsubscribe(mut self) {
        if let Some(run) = self.unsubscribe.take() {
            run().await;
        }
    }
}

/// Cancellable sleep. Returns `false` when `cancel` fired first.
pub(crate) async fn sleep_unless_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
