//! Duplex-stream session scenarios against an in-process websocket server
//! that speaks the JSON envelope protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use async_trait::async_trait;
use remote_config_client::{
    callback, md5_hex, ClientError, ClientOptions, ConfigDescriptor, ConfigIdentity,
    ConfigurationClient, Middleware, MiddlewarePipeline, Next, ServerAddressPool, ServerEndpoint,
};

/// Protocol server for tests: answers health checks and queries, records
/// listen requests, and can push change notifications or drop the
/// connection.
struct FakeServer {
    port: u16,
    state: Arc<ServerState>,
}

struct ServerState {
    /// unique key -> content
    configs: Mutex<HashMap<String, String>>,
    /// (unique key, digest, listen flag) in arrival order
    listens: Mutex<Vec<(String, String, bool)>>,
    /// health checks left to answer with "connection unregistered"
    unregistered_probes: AtomicUsize,
    connections: AtomicUsize,
    /// health checks received, per connection
    health_counts: Mutex<Vec<usize>>,
    /// outbound channel of the most recent connection
    conn_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl FakeServer {
    async fn start(unregistered_probes: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState {
            configs: Mutex::new(HashMap::new()),
            listens: Mutex::new(Vec::new()),
            unregistered_probes: AtomicUsize::new(unregistered_probes),
            connections: AtomicUsize::new(0),
            health_counts: Mutex::new(Vec::new()),
            conn_tx: Mutex::new(None),
        });
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(handle_connection(Arc::clone(&accept_state), stream));
            }
        });
        Self { port, state }
    }

    fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint {
            host: "127.0.0.1".to_string(),
            http_port: self.port,
            stream_port: self.port,
            secure: false,
        }
    }

    fn set_config(&self, key: &str, content: &str) {
        self.state
            .configs
            .lock()
            .unwrap()
            .insert(key.to_string(), content.to_string());
    }

    fn listens(&self) -> Vec<(String, String, bool)> {
        self.state.listens.lock().unwrap().clone()
    }

    fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    fn health_checks(&self, connection: usize) -> usize {
        self.state
            .health_counts
            .lock()
            .unwrap()
            .get(connection)
            .copied()
            .unwrap_or(0)
    }

    fn push_change(&self, namespace: &str, group: &str, data_id: &str) {
        let frame = json!({
            "type": "ConfigChangeNotifyRequest",
            "headers": {},
            "body": {
                "requestId": "push-1",
                "tenant": namespace,
                "group": group,
                "dataId": data_id,
            },
        });
        self.send(Message::Text(frame.to_string()));
    }

    fn drop_connection(&self) {
        self.send(Message::Close(None));
    }

    fn send(&self, message: Message) {
        if let Some(tx) = self.state.conn_tx.lock().unwrap().as_ref() {
            let _ = tx.send(message);
        }
    }
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(_) => return,
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let conn_index = {
        let mut counts = state.health_counts.lock().unwrap();
        counts.push(0);
        counts.len() - 1
    };
    let (mut sink, mut reader) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *state.conn_tx.lock().unwrap() = Some(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                return;
            }
        }
    });

    while let Some(Ok(message)) = reader.next().await {
        let Message::Text(text) = message else { continue };
        let frame: Value = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        let type_name = frame["type"].as_str().unwrap_or_default().to_string();
        let body = frame["body"].clone();
        let request_id = body["requestId"].as_str().unwrap_or_default().to_string();

        let reply = match type_name.as_str() {
            // setup is not answered
            "ConnectionSetupRequest" => None,
            "HealthCheckRequest" => {
                state.health_counts.lock().unwrap()[conn_index] += 1;
                let remaining = &state.unregistered_probes;
                let unregistered = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if unregistered {
                    Some((
                        "HealthCheckResponse",
                        json!({
                            "requestId": request_id,
                            "resultCode": 500,
                            "errorCode": 301,
                            "message": "connection unregistered",
                        }),
                    ))
                } else {
                    Some((
                        "HealthCheckResponse",
                        json!({ "requestId": request_id, "resultCode": 200, "errorCode": 0 }),
                    ))
                }
            }
            "ConfigQueryRequest" => {
                let key = format!(
                    "{}@{}@{}",
                    body["tenant"].as_str().unwrap_or_default(),
                    body["group"].as_str().unwrap_or_default(),
                    body["dataId"].as_str().unwrap_or_default(),
                );
                let content = state.configs.lock().unwrap().get(&key).cloned();
                match content {
                    Some(content) => Some((
                        "ConfigQueryResponse",
                        json!({
                            "requestId": request_id,
                            "resultCode": 200,
                            "errorCode": 0,
                            "content": content,
                            "md5": md5_hex(&content),
                        }),
                    )),
                    None => Some((
                        "ConfigQueryResponse",
                        json!({
                            "requestId": request_id,
                            "resultCode": 500,
                            "errorCode": 300,
                            "message": "config not found",
                        }),
                    )),
                }
            }
            "ConfigBatchListenRequest" => {
                let listen = body["listen"].as_bool().unwrap_or_default();
                if let Some(contexts) = body["configListenContexts"].as_array() {
                    let mut listens = state.listens.lock().unwrap();
                    for ctx in contexts {
                        let key = format!(
                            "{}@{}@{}",
                            ctx["tenant"].as_str().unwrap_or_default(),
                            ctx["group"].as_str().unwrap_or_default(),
                            ctx["dataId"].as_str().unwrap_or_default(),
                        );
                        let digest = ctx["md5"].as_str().unwrap_or_default().to_string();
                        listens.push((key, digest, listen));
                    }
                }
                Some((
                    "ConfigChangeBatchListenResponse",
                    json!({ "requestId": request_id, "resultCode": 200, "errorCode": 0 }),
                ))
            }
            _ => None,
        };
        if let Some((tag, body)) = reply {
            let frame = json!({ "type": tag, "headers": {}, "body": body });
            if tx.send(Message::Text(frame.to_string())).is_err() {
                break;
            }
        }
    }
    writer.abort();
}

fn options() -> ClientOptions {
    ClientOptions {
        probe_delay: Duration::from_millis(10),
        health_check_interval: Duration::from_secs(1),
        reconnect_grace: Duration::from_millis(50),
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn client_for(server: &FakeServer) -> ConfigurationClient {
    let pool = ServerAddressPool::fixed(vec![server.endpoint()]).unwrap();
    ConfigurationClient::transport(options(), pool).unwrap()
}

fn descriptor() -> ConfigDescriptor {
    ConfigDescriptor::new(ConfigIdentity::with_group("ns", "grp", "app").unwrap())
}

const KEY: &str = "ns@grp@app";

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn fetch_subscribe_and_change_push_round_trip() {
    let server = FakeServer::start(0).await;
    server.set_config(KEY, "v1");

    let client = client_for(&server);
    client.init().await.unwrap();

    let current = client.get_configuration(&descriptor()).await.unwrap();
    assert_eq!(current.content(), Some("v1"));
    assert_eq!(current.hash(), Some(md5_hex("v1").as_str()));

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscription = client
        .subscribe(
            &current,
            callback(move |changed| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(changed.content().unwrap_or_default().to_string());
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    // subscribing sent a listen with the synced digest
    wait_for("initial listen", || {
        server
            .listens()
            .iter()
            .any(|(key, digest, listen)| key == KEY && digest == &md5_hex("v1") && *listen)
    })
    .await;

    server.set_config(KEY, "v2");
    server.push_change("ns", "grp", "app");

    let notified = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no change notification arrived")
        .unwrap();
    assert_eq!(notified, "v2");

    // the listen was renewed with the new digest
    wait_for("renewed listen", || {
        server
            .listens()
            .iter()
            .any(|(key, digest, listen)| key == KEY && digest == &md5_hex("v2") && *listen)
    })
    .await;

    subscription.unsubscribe().await;
    wait_for("unlisten", || {
        server.listens().iter().any(|(key, _, listen)| key == KEY && !listen)
    })
    .await;

    client.shutdown();
}

#[tokio::test]
async fn registration_tolerates_unregistered_probes() {
    // the first two readiness probes are rejected as unregistered; the
    // handshake must keep probing and succeed
    let server = FakeServer::start(2).await;
    server.set_config(KEY, "v1");

    let client = client_for(&server);
    client.init().await.unwrap();
    let current = client.get_configuration(&descriptor()).await.unwrap();
    assert_eq!(current.content(), Some("v1"));
    client.shutdown();
}

#[tokio::test]
async fn reconnect_restores_subscriptions() {
    let server = FakeServer::start(0).await;
    server.set_config(KEY, "v1");

    let client = client_for(&server);
    client.init().await.unwrap();

    let synced = client.get_configuration(&descriptor()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let _subscription = client
        .subscribe(
            &synced,
            callback(move |changed| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(changed.content().unwrap_or_default().to_string());
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();
    assert_eq!(server.connections(), 1);

    server.drop_connection();

    // the session dials again and re-listens with the pre-outage digest
    wait_for("second connection", || server.connections() == 2).await;
    wait_for("restored listen", || {
        server
            .listens()
            .iter()
            .filter(|(key, digest, listen)| key == KEY && digest == &md5_hex("v1") && *listen)
            .count()
            >= 2
    })
    .await;

    // pushes keep flowing on the new stream
    server.set_config(KEY, "v2");
    server.push_change("ns", "grp", "app");
    let notified = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no change notification after reconnect")
        .unwrap();
    assert_eq!(notified, "v2");

    // the old epoch's loops are gone: the first connection stops health
    // checking while the second keeps going
    let stale = server.health_checks(0);
    let live = server.health_checks(1);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(server.health_checks(0), stale);
    assert!(server.health_checks(1) > live);

    client.shutdown();
}

/// Rewrites fetched content, standing in for a decrypt-on-read interceptor.
/// The digest is left as the server reported it so listen contexts stay
/// valid.
struct Decoder;

#[async_trait]
impl Middleware for Decoder {
    async fn handle(
        &self,
        descriptor: ConfigDescriptor,
        next: Next<'_>,
    ) -> Result<ConfigDescriptor, ClientError> {
        let fetched = next.run(descriptor).await?;
        let decoded = format!("decoded:{}", fetched.content().unwrap_or_default());
        let hash = fetched.hash().unwrap_or_default().to_string();
        Ok(fetched.with_content(decoded, hash))
    }
}

#[tokio::test]
async fn middleware_wraps_fetches_and_change_pushes() {
    let server = FakeServer::start(0).await;
    server.set_config(KEY, "v1");

    let pool = ServerAddressPool::fixed(vec![server.endpoint()]).unwrap();
    let pipeline = MiddlewarePipeline::new().with(Arc::new(Decoder));
    let client =
        ConfigurationClient::transport_with_middleware(options(), pool, pipeline).unwrap();
    client.init().await.unwrap();

    let current = client.get_configuration(&descriptor()).await.unwrap();
    assert_eq!(current.content(), Some("decoded:v1"));
    assert_eq!(current.hash(), Some(md5_hex("v1").as_str()));

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let _subscription = client
        .subscribe(
            &current,
            callback(move |changed| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(changed.content().unwrap_or_default().to_string());
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    // the re-fetch triggered by the push runs through the same chain
    server.set_config(KEY, "v2");
    server.push_change("ns", "grp", "app");
    let notified = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no change notification arrived")
        .unwrap();
    assert_eq!(notified, "decoded:v2");

    client.shutdown();
}
