//! Facade over the two session flavors.

use crate::config::ClientOptions;
use crate::descriptor::ConfigDescriptor;
use crate::error::ClientError;
use crate::middleware::MiddlewarePipeline;
use crate::pool::ServerAddressPool;
use crate::session::polling::PollingSession;
use crate::session::transport::TransportSession;
use crate::session::Subscription;
use crate::subscription::ChangeCallback;

enum Inner {
    Transport(TransportSession),
    Polling(PollingSession),
}

/// One client, either flavor. Construct, `init()`, then fetch and subscribe.
pub struct ConfigurationClient {
    inner: Inner,
}

impl ConfigurationClient {
    /// Client over the duplex stream surface: server pushes changes.
    pub fn transport(options: ClientOptions, pool: ServerAddressPool) -> Result<Self, ClientError> {
        Self::transport_with_middleware(options, pool, MiddlewarePipeline::new())
    }

    /// Stream client with an interceptor chain around every fetch, including
    /// the re-fetch triggered by a change push.
    pub fn transport_with_middleware(
        options: ClientOptions,
        pool: ServerAddressPool,
        pipeline: MiddlewarePipeline,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            inner: Inner::Transport(TransportSession::new(options, pool, pipeline)?),
        })
    }

    /// Client over the HTTP surface: changes are discovered by long-polling.
    pub fn polling(options: ClientOptions, pool: ServerAddressPool) -> Result<Self, ClientError> {
        Self::polling_with_middleware(options, pool, MiddlewarePipeline::new())
    }

    /// Long-poll client with an interceptor chain around every fetch.
    pub fn polling_with_middleware(
        options: ClientOptions,
        pool: ServerAddressPool,
        pipeline: MiddlewarePipeline,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            inner: Inner::Polling(PollingSession::new(options, pool, pipeline)?),
        })
    }

    /// Must complete before anything else is called.
    pub async fn init(&self) -> Result<(), ClientError> {
        match &self.inner {
            Inner::Transport(session) => session.init().await,
            Inner::Polling(session) => session.init().await,
        }
    }

    /// Fetches the current content of `descriptor`. Missing entries are an
    /// error; see [`ConfigurationClient::try_get_configuration`].
    pub async fn get_configuration(
        &self,
        descriptor: &ConfigDescriptor,
    ) -> Result<ConfigDescriptor, ClientError> {
        match &self.inner {
            Inner::Transport(session) => session.get_configuration(descriptor).await,
            Inner::Polling(session) => session.get_configuration(descriptor).await,
        }
    }

    /// Like `get_configuration`, but a missing entry is `Ok(None)`.
    pub async fn try_get_configuration(
        &self,
        descriptor: &ConfigDescriptor,
    ) -> Result<Option<ConfigDescriptor>, ClientError> {
        match self.get_configuration(descriptor).await {
            Ok(found) => Ok(Some(found)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Registers a change callback for `descriptor`.
    pub async fn subscribe(
        &self,
        descriptor: &ConfigDescriptor,
        callback: ChangeCallback,
    ) -> Result<Subscription, ClientError> {
        match &self.inner {
            Inner::Transport(session) => session.subscribe(descriptor, callback).await,
            Inner::Polling(session) => session.subscribe(descriptor, callback).await,
        }
    }

    /// Idempotent teardown.
    pub fn shutdown(&self) {
        match &self.inner {
            Inner::Transport(session) => session.shutdown(),
            Inner::Polling(session) => session.shutdown(),
        }
    }
}
