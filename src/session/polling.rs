//! HTTP long-poll session.
//!
//! Each watched entry gets its own poll loop: one listener request parks on
//! the server for up to the wait budget and returns early when the entry's
//! digest no longer matches. A reported change triggers a re-fetch through
//! the middleware pipeline, a fan-out to the callbacks, and a digest update
//! for the next round.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth::AccessTokenManager;
use crate::backoff::RetryScaler;
use crate::config::ClientOptions;
use crate::descriptor::{md5_hex, ConfigDescriptor, ConfigIdentity};
use crate::error::ClientError;
use crate::http::{HttpApi, RecyclingClientFactory};
use crate::middleware::{FetchFn, MiddlewarePipeline};
use crate::pool::ServerAddressPool;
use crate::session::{sleep_unless_cancelled, Subscription};
use crate::subscription::{fan_out, CallbackId, ChangeCallback, SubscriptionRegistry};

struct PollingShared {
    api: HttpApi,
    token: Arc<AccessTokenManager>,
    factory: Arc<RecyclingClientFactory>,
    pool: Arc<ServerAddressPool>,
    registry: Arc<SubscriptionRegistry>,
    pipeline: MiddlewarePipeline,
    /// One cancellation token per running poll loop, keyed like the registry.
    pollers: Mutex<HashMap<String, CancellationToken>>,
    running: CancellationToken,
    initiated: AtomicBool,
    init_timeout: std::time::Duration,
}

/// Client session over the HTTP surface.
pub struct PollingSession {
    shared: Arc<PollingShared>,
}

impl PollingSession {
    pub fn new(
        options: ClientOptions,
        pool: ServerAddressPool,
        pipeline: MiddlewarePipeline,
    ) -> Result<Self, ClientError> {
        let options = options.sanitize();
        let pool = Arc::new(pool);
        let factory = RecyclingClientFactory::new()?;
        let token = Arc::new(match options.credentials.clone() {
            Some(credentials) => {
                AccessTokenManager::new(credentials, Arc::clone(&pool), Arc::clone(&factory))
            }
            None => AccessTokenManager::anonymous(),
        });
        let api = HttpApi::new(
            Arc::clone(&pool),
            Arc::clone(&token),
            Arc::clone(&factory),
            options.request_timeout,
            options.long_poll_timeout,
        );
        Ok(Self {
            shared: Arc::new(PollingShared {
                api,
                token,
                factory,
                pool,
                registry: Arc::new(SubscriptionRegistry::new()),
                pipeline,
                pollers: Mutex::new(HashMap::new()),
                running: CancellationToken::new(),
                initiated: AtomicBool::new(false),
                init_timeout: options.init_timeout,
            }),
        })
    }

    /// Resolves the address pool and logs in, under the same hard ceiling as
    /// the stream session.
    pub async fn init(&self) -> Result<(), ClientError> {
        let shared = &self.shared;
        if shared.running.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        if shared.initiated.load(Ordering::SeqCst) {
            return Ok(());
        }
        let startup = async {
            shared.pool.init().await?;
            shared.token.init().await
        };
        match tokio::time::timeout(shared.init_timeout, startup).await {
            Ok(Ok(())) => {
                shared.initiated.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(err)) => {
                self.shutdown();
                Err(err)
            }
            Err(_) => {
                self.shutdown();
                Err(ClientError::InitTimeout(shared.init_timeout))
            }
        }
    }

    /// Fetches the current content of `descriptor` through the middleware
    /// pipeline.
    pub async fn get_configuration(
        &self,
        descriptor: &ConfigDescriptor,
    ) -> Result<ConfigDescriptor, ClientError> {
        self.shared.ensure_ready()?;
        self.shared.fetch_through_pipeline(descriptor.clone()).await
    }

    /// Registers a change callback. The first callback for an entry starts
    /// its poll loop; further callbacks share it.
    pub async fn subscribe(
        &self,
        descriptor: &ConfigDescriptor,
        callback: ChangeCallback,
    ) -> Result<Subscription, ClientError> {
        self.shared.ensure_ready()?;
        let (id, first) = self.shared.registry.add(descriptor, callback);
        if first {
            self.shared.start_poller(descriptor.clone());
        }
        Ok(self
            .shared
            .subscription_handle(descriptor.identity().clone(), id))
    }

    /// Idempotent teardown: stops every poll loop and background task.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.running.is_cancelled() {
            return;
        }
        info!("shutting down polling session");
        shared.running.cancel();
        for (_, cancel) in shared.pollers.lock().unwrap().drain() {
            cancel.cancel();
        }
        shared.registry.clear();
        shared.token.shutdown();
        shared.factory.shutdown();
        shared.pool.shutdown();
    }
}

impl PollingShared {
    fn ensure_ready(&self) -> Result<(), ClientError> {
        if self.running.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        if !self.initiated.load(Ordering::SeqCst) {
            return Err(ClientError::NotInitialized);
        }
        Ok(())
    }

    async fn fetch_through_pipeline(
        self: &Arc<Self>,
        descriptor: ConfigDescriptor,
    ) -> Result<ConfigDescriptor, ClientError> {
        let shared = Arc::clone(self);
        let terminal: FetchFn = Box::new(move |descriptor| {
            let shared = Arc::clone(&shared);
            Box::pin(async move { shared.fetch(descriptor).await })
        });
        self.pipeline.execute(descriptor, &terminal).await
    }

    async fn fetch(&self, descriptor: ConfigDescriptor) -> Result<ConfigDescriptor, ClientError> {
        let content = self.api.fetch_configuration(descriptor.identity()).await?;
        let hash = md5_hex(&content);
        Ok(descriptor.with_content(content, hash))
    }

    fn start_poller(self: &Arc<Self>, descriptor: ConfigDescriptor) {
        let cancel = self.running.child_token();
        self.pollers
            .lock()
            .unwrap()
            .insert(descriptor.unique_key(), cancel.clone());
        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.run_poll_loop(descriptor, cancel).await });
    }

    fn subscription_handle(self: &Arc<Self>, identity: ConfigIdentity, id: CallbackId) -> Subscription {
        let shared = Arc::clone(self);
        let handle_identity = identity.clone();
        Subscription::new(
            handle_identity,
            Box::new(move || -> BoxFuture<'static, ()> {
                Box::pin(async move {
                    shared.unsubscribe(&identity, id);
                })
            }),
        )
    }

    fn unsubscribe(&self, identity: &ConfigIdentity, id: CallbackId) {
        if self.registry.remove(identity, id) {
            // last callback gone: stop the poll loop
            if let Some(cancel) = self.pollers.lock().unwrap().remove(&identity.unique_key()) {
                cancel.cancel();
            }
        }
    }

    /// Long-poll loop for one entry. Failures back off by ten seconds per
    /// consecutive failure, capped at one minute.
    async fn run_poll_loop(self: Arc<Self>, mut descriptor: ConfigDescriptor, cancel: CancellationToken) {
        let key = descriptor.unique_key();
        debug!(key = %key, "poll loop started");
        let mut scaler = RetryScaler::new(0, 10, 60);
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.api.poll_listening(&descriptor) => outcome,
            };
            match outcome {
                // wait budget elapsed, nothing new
                Ok(false) => scaler.reset(),
                Ok(true) => {
                    let Some((_, callbacks)) = self.registry.callbacks_for(descriptor.identity())
                    else {
                        debug!(key = %key, "entry no longer watched, poll loop exiting");
                        break;
                    };
                    match self.fetch_through_pipeline(descriptor.clone()).await {
                        Ok(refreshed) => {
                            if descriptor.is_synced() {
                                fan_out(&callbacks, &refreshed).await;
                            } else {
                                // first round for a never-synced entry only
                                // primes local state; subscribers hear about
                                // the next change
                                debug!(key = %key, "initial sync, notification suppressed");
                            }
                            self.registry.update_descriptor(&refreshed);
                            descriptor = refreshed;
                            scaler.reset();
                        }
                        Err(err) => {
                            scaler.advance();
                            error!(
                                %err,
                                key = %key,
                                retry_in = scaler.value(),
                                "failed to fetch changed configuration"
                            );
                            if !sleep_unless_cancelled(&cancel, scaler.delay()).await {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    scaler.advance();
                    error!(%err, key = %key, retry_in = scaler.value(), "long poll failed");
                    if !sleep_unless_cancelled(&cancel, scaler.delay()).await {
                        break;
                    }
                }
            }
        }
        debug!(key = %key, "poll loop stopped");
    }
}
