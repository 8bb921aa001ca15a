//! Duplex-stream session.
//!
//! One websocket carries JSON envelopes in both directions. Unary requests
//! are correlated to their responses through the `requestId` echoed in the
//! payload; server pushes (change notifications, liveness probes) arrive on
//! the same stream and are dispatched by type tag.
//!
//! Each established connection gets its own epoch token, a child of the
//! session-wide running token. Tearing down a connection cancels only its
//! epoch; shutting the session down cancels everything. Recovery is driven
//! by a single supervisor task: a short grace period, then connect attempts
//! whose spacing grows by ten seconds per failure up to one minute, and
//! finally a re-listen of every watched entry on the fresh stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::{join_all, BoxFuture};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AccessTokenManager;
use crate::backoff::RetryScaler;
use crate::config::ClientOptions;
use crate::descriptor::{md5_hex, ConfigDescriptor, ConfigIdentity};
use crate::endpoint::ServerEndpoint;
use crate::error::ClientError;
use crate::http::RecyclingClientFactory;
use crate::middleware::{FetchFn, MiddlewarePipeline};
use crate::pool::ServerAddressPool;
use crate::session::{sleep_unless_cancelled, SessionState, Subscription};
use crate::subscription::{fan_out, CallbackId, ChangeCallback, SubscriptionRegistry};
use crate::wire::{
    header, new_request_id, tag, ClientAbilities, ConfigBatchListenRequest, ConfigChangeNotifyRequest,
    ConfigListenContext, ConfigQueryRequest, ConfigQueryResponse, ConnectionSetupRequest, Envelope,
    ErrorCode, HealthCheckRequest, ResponseHead,
};

/// Path of the duplex endpoint on the stream port.
pub const STREAM_PATH: &str = "/rpc";
/// Readiness probes sent after connection setup before giving up.
const PROBE_ATTEMPTS: u32 = 6;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// One established stream. Dies with its epoch token.
struct Connection {
    endpoint: ServerEndpoint,
    sink: tokio::sync::Mutex<WsSink>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    epoch: CancellationToken,
}

impl Connection {
    fn register_pending(&self, request_id: String) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id, tx);
        rx
    }

    fn take_pending(&self, request_id: &str) -> Option<oneshot::Sender<Envelope>> {
        self.pending.lock().unwrap().remove(request_id)
    }

    /// Drops every waiter; their receivers resolve to a closed-channel error.
    fn fail_pending(&self) {
        self.pending.lock().unwrap().clear();
    }
}

struct TransportShared {
    options: ClientOptions,
    client_ip: String,
    pool: Arc<ServerAddressPool>,
    token: Arc<AccessTokenManager>,
    factory: Arc<RecyclingClientFactory>,
    registry: Arc<SubscriptionRegistry>,
    pipeline: MiddlewarePipeline,
    conn: RwLock<Option<Arc<Connection>>>,
    state: Mutex<SessionState>,
    running: CancellationToken,
    reconnecting: AtomicBool,
    initiated: AtomicBool,
}

/// Client session over the duplex stream surface.
pub struct TransportSession {
    shared: Arc<TransportShared>,
}

impl TransportSession {
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
        let client_ip = options.resolved_client_ip();
        Ok(Self {
            shared: Arc::new(TransportShared {
                options,
                client_ip,
                pool,
                token,
                factory,
                registry: Arc::new(SubscriptionRegistry::new()),
                pipeline,
                conn: RwLock::new(None),
                state: Mutex::new(SessionState::Disconnected),
                running: CancellationToken::new(),
                reconnecting: AtomicBool::new(false),
                initiated: AtomicBool::new(false),
            }),
        })
    }

    /// Resolves the address pool, logs in, and establishes the first stream.
    /// The whole sequence runs under a hard ceiling; on timeout or failure
    /// the session is shut down and unusable.
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
            shared.token.init().await?;
            shared.try_connect().await
        };
        match tokio::time::timeout(shared.options.init_timeout, startup).await {
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
                Err(ClientError::InitTimeout(shared.options.init_timeout))
            }
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    /// Fetches the current content of `descriptor` over the stream, through
    /// the middleware pipeline.
    pub async fn get_configuration(
        &self,
        descriptor: &ConfigDescriptor,
    ) -> Result<ConfigDescriptor, ClientError> {
        self.shared.ensure_ready()?;
        let conn = self.shared.current_connection()?;
        self.shared
            .fetch_through_pipeline(&conn, descriptor.clone())
            .await
    }

    /// Registers a change callback. The first callback for an entry also
    /// starts a server-side listen; if that fails the registration is rolled
    /// back and the error surfaces.
    pub async fn subscribe(
        &self,
        descriptor: &ConfigDescriptor,
        callback: ChangeCallback,
    ) -> Result<Subscription, ClientError> {
        self.shared.ensure_ready()?;
        let (id, first) = self.shared.registry.add(descriptor, callback);
        if first {
            if let Err(err) = self.shared.listen_current(descriptor, true).await {
                self.shared.registry.remove(descriptor.identity(), id);
                return Err(err);
            }
        }
        Ok(self.shared.subscription_handle(descriptor.identity().clone(), id))
    }

    /// Idempotent teardown: stops every background task and closes the
    /// stream.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.running.is_cancelled() {
            return;
        }
        info!("shutting down stream session");
        shared.running.cancel();
        shared.teardown_connection();
        shared.registry.clear();
        shared.token.shutdown();
        shared.factory.shutdown();
        shared.pool.shutdown();
        shared.set_state(SessionState::Closed);
    }
}

impl TransportShared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    fn ensure_ready(&self) -> Result<(), ClientError> {
        if self.running.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        if !self.initiated.load(Ordering::SeqCst) {
            return Err(ClientError::NotInitialized);
        }
        Ok(())
    }

    fn current_connection(&self) -> Result<Arc<Connection>, ClientError> {
        self.conn
            .read()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(ClientError::NotConnected)
    }

    /// One pass over the pool: at least three attempts, or one per member.
    async fn try_connect(self: &Arc<Self>) -> Result<(), ClientError> {
        self.set_state(SessionState::Connecting);
        let attempts = self.pool.len()?.max(3);
        for _ in 0..attempts {
            if self.running.is_cancelled() {
                return Err(ClientError::Shutdown);
            }
            let endpoint = self.pool.current()?;
            match self.connect_endpoint(&endpoint).await {
                Ok(conn) => {
                    info!(server = %endpoint, "stream connected");
                    self.install_connection(conn);
                    self.set_state(SessionState::Connected);
                    return Ok(());
                }
                Err(err) => {
                    warn!(%err, server = %endpoint, "stream connect failed, moving to next server");
                    self.pool.next()?;
                }
            }
        }
        self.set_state(SessionState::Disconnected);
        Err(ClientError::EndpointsExhausted)
    }

    /// Dials one endpoint and runs the setup/probe handshake. The read loop
    /// starts before the handshake because its responses arrive on the
    /// stream itself.
    async fn connect_endpoint(
        self: &Arc<Self>,
        endpoint: &ServerEndpoint,
    ) -> Result<Arc<Connection>, ClientError> {
        let url = endpoint.stream_url(STREAM_PATH);
        debug!(%url, "dialing stream endpoint");
        let (socket, _response) = connect_async(url.as_str()).await?;
        let (sink, stream) = socket.split();
        let conn = Arc::new(Connection {
            endpoint: endpoint.clone(),
            sink: tokio::sync::Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
            epoch: self.running.child_token(),
        });
        tokio::spawn(read_loop(Arc::clone(self), Arc::clone(&conn), stream));

        self.set_state(SessionState::Registering);
        match self.register(&conn).await {
            Ok(()) => Ok(conn),
            Err(err) => {
                conn.epoch.cancel();
                Err(err)
            }
        }
    }

    /// Announces the client, then probes with health checks until the server
    /// has registered the stream. "Connection unregistered" is expected
    /// while the server catches up and is tolerated on all but the last
    /// probe.
    async fn register(&self, conn: &Arc<Connection>) -> Result<(), ClientError> {
        let setup = ConnectionSetupRequest {
            request_id: new_request_id(),
            client_ip: self.client_ip.clone(),
            client_name: self.options.client_name.clone(),
            client_version: self.options.client_version.clone(),
            namespace: self.options.namespace.clone(),
            abilities: ClientAbilities::default(),
        };
        // setup is not answered; readiness is confirmed by the probes
        let envelope = self.build_envelope(tag::CONNECTION_SETUP, &setup, &[])?;
        self.send_envelope(conn, &envelope).await?;

        for attempt in 1..=PROBE_ATTEMPTS {
            tokio::time::sleep(self.options.probe_delay).await;
            let probe = HealthCheckRequest {
                request_id: new_request_id(),
            };
            match self
                .request(conn, tag::HEALTH_CHECK_REQUEST, &probe.request_id.clone(), &probe, &[])
                .await
            {
                Ok(_) => {
                    debug!(attempt, server = %conn.endpoint, "stream registered");
                    return Ok(());
                }
                Err(ClientError::ConnectionUnregistered(msg)) if attempt < PROBE_ATTEMPTS => {
                    debug!(attempt, %msg, "server has not registered the stream yet");
                }
                Err(err) => return Err(err),
            }
        }
        Err(ClientError::ConnectionUnregistered(
            "registration probes exhausted".to_string(),
        ))
    }

    fn install_connection(self: &Arc<Self>, conn: Arc<Connection>) {
        let old = self.conn.write().unwrap().replace(Arc::clone(&conn));
        if let Some(old) = old {
            old.epoch.cancel();
            old.fail_pending();
        }
        tokio::spawn(health_loop(Arc::clone(self), conn));
    }

    fn teardown_connection(&self) {
        if let Some(conn) = self.conn.write().unwrap().take() {
            conn.epoch.cancel();
            conn.fail_pending();
        }
    }

    fn build_envelope<T: Serialize>(
        &self,
        type_name: &str,
        payload: &T,
        extra_headers: &[(&str, &str)],
    ) -> Result<Envelope, ClientError> {
        let mut envelope = Envelope::new(type_name, serde_json::to_value(payload)?);
        envelope.client_ip = self.client_ip.clone();
        if let Some(token) = self.token.access_token() {
            envelope.headers.insert(header::ACCESS_TOKEN.to_string(), token);
        }
        for (key, value) in extra_headers {
            envelope.headers.insert((*key).to_string(), (*value).to_string());
        }
        Ok(envelope)
    }

    async fn send_envelope(&self, conn: &Connection, envelope: &Envelope) -> Result<(), ClientError> {
        let text = serde_json::to_string(envelope)?;
        let mut sink = conn.sink.lock().await;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Sends one unary request and waits for its correlated response, under
    /// the per-request timeout. Server error codes become typed errors.
    async fn request<T: Serialize>(
        &self,
        conn: &Arc<Connection>,
        type_name: &str,
        request_id: &str,
        payload: &T,
        extra_headers: &[(&str, &str)],
    ) -> Result<Envelope, ClientError> {
        let envelope = self.build_envelope(type_name, payload, extra_headers)?;
        let rx = conn.register_pending(request_id.to_string());
        if let Err(err) = self.send_envelope(conn, &envelope).await {
            conn.take_pending(request_id);
            return Err(err);
        }
        let reply = match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(envelope)) => envelope,
            // sender dropped: the connection died under us
            Ok(Err(_)) => return Err(ClientError::NotConnected),
            Err(_) => {
                conn.take_pending(request_id);
                return Err(ClientError::RequestTimeout(type_name.to_string()));
            }
        };
        let head: ResponseHead = serde_json::from_value(reply.body.clone())?;
        classify_response(&head)?;
        Ok(reply)
    }

    async fn fetch_through_pipeline(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        descriptor: ConfigDescriptor,
    ) -> Result<ConfigDescriptor, ClientError> {
        let shared = Arc::clone(self);
        let conn = Arc::clone(conn);
        let terminal: FetchFn = Box::new(move |descriptor| {
            let shared = Arc::clone(&shared);
            let conn = Arc::clone(&conn);
            Box::pin(async move { shared.query_config(&conn, &descriptor).await })
        });
        self.pipeline.execute(descriptor, &terminal).await
    }

    async fn query_config(
        &self,
        conn: &Arc<Connection>,
        descriptor: &ConfigDescriptor,
    ) -> Result<ConfigDescriptor, ClientError> {
        let payload = ConfigQueryRequest {
            request_id: new_request_id(),
            namespace: descriptor.namespace().to_string(),
            group: descriptor.group().to_string(),
            data_id: descriptor.data_id().to_string(),
        };
        let reply = self
            .request(
                conn,
                tag::CONFIG_QUERY_REQUEST,
                &payload.request_id.clone(),
                &payload,
                &[(header::NOTIFY, "false")],
            )
            .await?;
        let response: ConfigQueryResponse = serde_json::from_value(reply.body)?;
        if response.head.error_code == ErrorCode::NotFound {
            return Err(ClientError::NotFound(descriptor.unique_key()));
        }
        let content = response.content.unwrap_or_default();
        let hash = response.md5.unwrap_or_else(|| md5_hex(&content));
        Ok(descriptor.with_content(content, hash))
    }

    /// Starts (`listen = true`) or stops watching one entry on the wire.
    async fn send_listen(
        &self,
        conn: &Arc<Connection>,
        descriptor: &ConfigDescriptor,
        listen: bool,
    ) -> Result<(), ClientError> {
        let payload = ConfigBatchListenRequest {
            request_id: new_request_id(),
            listen,
            config_listen_contexts: vec![ConfigListenContext {
                namespace: descriptor.namespace().to_string(),
                group: descriptor.group().to_string(),
                data_id: descriptor.data_id().to_string(),
                md5: descriptor.hash().unwrap_or_default().to_string(),
            }],
        };
        self.request(
            conn,
            tag::CONFIG_BATCH_LISTEN_REQUEST,
            &payload.request_id.clone(),
            &payload,
            &[],
        )
        .await?;
        Ok(())
    }

    async fn listen_current(
        &self,
        descriptor: &ConfigDescriptor,
        listen: bool,
    ) -> Result<(), ClientError> {
        let conn = self.current_connection()?;
        self.send_listen(&conn, descriptor, listen).await
    }

    fn subscription_handle(self: &Arc<Self>, identity: ConfigIdentity, id: CallbackId) -> Subscription {
        let shared = Arc::clone(self);
        let handle_identity = identity.clone();
        Subscription::new(
            handle_identity,
            Box::new(move || -> BoxFuture<'static, ()> {
                Box::pin(async move {
                    shared.unsubscribe(identity, id).await;
                })
            }),
        )
    }

    async fn unsubscribe(&self, identity: ConfigIdentity, id: CallbackId) {
        let Some(descriptor) = self.registry.descriptor(&identity) else {
            return;
        };
        if self.registry.remove(&identity, id) {
            // last callback gone: stop the wire listen, best effort
            if let Err(err) = self.listen_current(&descriptor, false).await {
                warn!(%err, key = %identity.unique_key(), "failed to stop listening");
            }
        }
    }

    /// Routes one inbound frame: responses to their waiters, pushes to their
    /// handlers. Malformed frames are logged and dropped.
    async fn dispatch_frame(self: &Arc<Self>, conn: &Arc<Connection>, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, "dropping malformed frame");
                return;
            }
        };
        if envelope.is_response() {
            let request_id = envelope
                .body
                .get("requestId")
                .and_then(Value::as_str)
                .map(str::to_string);
            match request_id {
                Some(id) => match conn.take_pending(&id) {
                    Some(tx) => {
                        let _ = tx.send(envelope);
                    }
                    None => debug!(request_id = %id, "response for unknown request"),
                },
                None => warn!(type_name = %envelope.type_name, "response without request id"),
            }
            return;
        }
        match envelope.type_name.as_str() {
            tag::CLIENT_DETECTION_REQUEST => self.answer_detection(conn, &envelope).await,
            tag::CONFIG_CHANGE_NOTIFY_REQUEST => {
                // the handler issues unary requests whose responses arrive on
                // this very stream; run it off the read loop or those
                // requests can never complete
                let shared = Arc::clone(self);
                let conn = Arc::clone(conn);
                tokio::spawn(async move { shared.handle_change_notify(&conn, envelope).await });
            }
            other => warn!(type_name = %other, "unhandled server push"),
        }
    }

    /// Liveness probe from the server; answered inline.
    async fn answer_detection(&self, conn: &Arc<Connection>, envelope: &Envelope) {
        let request_id = envelope
            .body
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let head = ResponseHead::success(request_id);
        let reply = match self.build_envelope(tag::CLIENT_DETECTION_RESPONSE, &head, &[]) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, "failed to encode detection response");
                return;
            }
        };
        if let Err(err) = self.send_envelope(conn, &reply).await {
            warn!(%err, "failed to answer detection probe");
        }
    }

    /// Change push: re-query the entry, fan out to the callbacks, renew the
    /// listen with the new digest, and store the snapshot. A failing
    /// callback never rolls the snapshot back.
    async fn handle_change_notify(self: &Arc<Self>, conn: &Arc<Connection>, envelope: Envelope) {
        let notify: ConfigChangeNotifyRequest = match serde_json::from_value(envelope.body) {
            Ok(notify) => notify,
            Err(err) => {
                warn!(%err, "dropping malformed change notify");
                return;
            }
        };
        let namespace = if notify.namespace.is_empty() {
            self.options.namespace.clone()
        } else {
            notify.namespace
        };
        let identity = match ConfigIdentity::with_group(namespace, notify.group, notify.data_id) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(%err, "change notify without a usable identity");
                return;
            }
        };
        let Some((descriptor, callbacks)) = self.registry.callbacks_for(&identity) else {
            debug!(key = %identity.unique_key(), "change notify for unwatched entry");
            return;
        };
        info!(key = %identity.unique_key(), "configuration change notified");
        let result: Result<(), ClientError> = async {
            let refreshed = self.fetch_through_pipeline(conn, descriptor).await?;
            fan_out(&callbacks, &refreshed).await;
            self.send_listen(conn, &refreshed, true).await?;
            self.registry.update_descriptor(&refreshed);
            Ok(())
        }
        .await;
        if let Err(err) = result {
            error!(%err, key = %identity.unique_key(), "failed to apply configuration change");
        }
    }

    /// Kicks off the reconnect supervisor, at most one at a time. The
    /// current connection is torn down immediately so requests fail fast
    /// instead of queueing on a dead stream.
    fn start_reconnect(self: &Arc<Self>) {
        if self.running.is_cancelled() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Reconnecting);
        self.teardown_connection();
        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.run_reconnect().await });
    }

    async fn run_reconnect(self: Arc<Self>) {
        info!(grace = ?self.options.reconnect_grace, "stream lost, starting recovery");
        if !sleep_unless_cancelled(&self.running, self.options.reconnect_grace).await {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        let mut scaler = RetryScaler::new(0, 10, 60);
        loop {
            if self.running.is_cancelled() {
                break;
            }
            match self.try_connect().await {
                Ok(()) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    self.resubscribe_all().await;
                    return;
                }
                Err(err) => {
                    scaler.advance();
                    error!(%err, retry_in = scaler.value(), "reconnect attempt failed");
                    if !sleep_unless_cancelled(&self.running, scaler.delay()).await {
                        break;
                    }
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Re-listens every watched entry on the fresh stream with the digests
    /// recorded before the outage, so missed changes are reported.
    async fn resubscribe_all(&self) {
        let descriptors = self.registry.descriptors();
        if descriptors.is_empty() {
            return;
        }
        info!(count = descriptors.len(), "restoring subscriptions");
        let tasks = descriptors.iter().map(|descriptor| async move {
            if let Err(err) = self.listen_current(descriptor, true).await {
                error!(%err, key = %descriptor.unique_key(), "failed to restore subscription");
            }
        });
        join_all(tasks).await;
    }
}

/// Maps server error codes to typed errors; a success code with no error
/// passes through.
fn classify_response(head: &ResponseHead) -> Result<(), ClientError> {
    let message = || head.message.clone().unwrap_or_default();
    match head.error_code {
        ErrorCode::Forbidden => Err(ClientError::Forbidden(message())),
        ErrorCode::ConnectionUnregistered => Err(ClientError::ConnectionUnregistered(message())),
        ErrorCode::Other(code) => Err(ClientError::Protocol(format!(
            "server error {code}: {}",
            message()
        ))),
        // not-found is a payload-level outcome, left to the caller
        ErrorCode::None | ErrorCode::NotFound => {
            if head.error_code == ErrorCode::None && !head.is_success() {
                return Err(ClientError::Protocol(format!(
                    "unexpected result code {}: {}",
                    head.result_code,
                    message()
                )));
            }
            Ok(())
        }
    }
}

/// Pumps inbound frames until the epoch dies or the stream ends. A server
/// close or end-of-stream is fatal and hands off to the reconnect
/// supervisor; transient read errors pause briefly and continue.
async fn read_loop(
    shared: Arc<TransportShared>,
    conn: Arc<Connection>,
    mut stream: SplitStream<WsStream>,
) {
    let fatal = loop {
        let frame = tokio::select! {
            _ = conn.epoch.cancelled() => break false,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => shared.dispatch_frame(&conn, &text).await,
            Some(Ok(Message::Ping(payload))) => {
                let mut sink = conn.sink.lock().await;
                if let Err(err) = sink.send(Message::Pong(payload)).await {
                    debug!(%err, "pong failed");
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!(server = %conn.endpoint, "stream closed");
                break true;
            }
            // binary and pong frames are not part of the protocol
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(%err, server = %conn.endpoint, "stream read error");
                if !sleep_unless_cancelled(&conn.epoch, shared.options.read_retry_delay).await {
                    break false;
                }
            }
        }
    };
    conn.fail_pending();
    if fatal {
        shared.start_reconnect();
    }
}

/// Periodic keep-alive on an established stream. The first failed probe
/// hands off to the reconnect supervisor.
async fn health_loop(shared: Arc<TransportShared>, conn: Arc<Connection>) {
    loop {
        if !sleep_unless_cancelled(&conn.epoch, shared.options.health_check_interval).await {
            return;
        }
        let probe = HealthCheckRequest {
            request_id: new_request_id(),
        };
        match shared
            .request(&conn, tag::HEALTH_CHECK_REQUEST, &probe.request_id.clone(), &probe, &[])
            .await
        {
            Ok(_) => {}
            Err(err) => {
                if conn.epoch.is_cancelled() {
                    return;
                }
                warn!(%err, server = %conn.endpoint, "health check failed");
                break;
            }
        }
    }
    shared.start_reconnect();
}
