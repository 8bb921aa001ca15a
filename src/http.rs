//! HTTP surface: recycled client, failover request loop, and the
//! configuration endpoints used by the long-poll session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::AccessTokenManager;
use crate::descriptor::ConfigDescriptor;
use crate::descriptor::ConfigIdentity;
use crate::endpoint::ServerEndpoint;
use crate::error::ClientError;
use crate::pool::ServerAddressPool;

/// Lifetime of one underlying HTTP client before it is swapped for a fresh
/// one, bounding how long pooled sockets to a dead server survive.
pub const CLIENT_RECYCLE_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Extra slack on top of the server-side long-poll wait budget.
const LONG_POLL_SLACK: Duration = Duration::from_secs(10);

pub const CONFIG_PATH: &str = "/v1/cs/configs";
pub const LISTENER_PATH: &str = "/v1/cs/configs/listener";
pub const LOGIN_PATH: &str = "/v1/auth/login";

/// Header carrying the long-poll wait budget in milliseconds.
pub const LONG_POLL_TIMEOUT_HEADER: &str = "Long-Pulling-Timeout";
/// Form field carrying the separator-encoded listening contexts.
pub const LISTENING_CONFIGS_FIELD: &str = "Listening-Configs";

const FIELD_SEPARATOR: char = '\u{2}';
const ENTRY_SEPARATOR: char = '\u{1}';

/// Hands out a shared `reqwest::Client` and silently replaces it on a fixed
/// interval. Borrowers keep their `Arc` until done; the old client dies when
/// the last borrower drops it.
pub struct RecyclingClientFactory {
    current: Mutex<Arc<reqwest::Client>>,
    cancel: CancellationToken,
}

impl RecyclingClientFactory {
    pub fn new() -> Result<Arc<Self>, ClientError> {
        let factory = Arc::new(Self {
            current: Mutex::new(Arc::new(build_client()?)),
            cancel: CancellationToken::new(),
        });
        let swapper = Arc::clone(&factory);
        tokio::spawn(async move { swapper.run_swapper().await });
        Ok(factory)
    }

    /// Current client. Hold the `Arc` for the duration of one request only.
    pub fn client(&self) -> Arc<reqwest::Client> {
        Arc::clone(&self.current.lock().unwrap())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn run_swapper(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(CLIENT_RECYCLE_INTERVAL) => {}
            }
            match build_client() {
                Ok(fresh) => {
                    *self.current.lock().unwrap() = Arc::new(fresh);
                    debug!("http client recycled");
                }
                // keep the old client; it still works
                Err(err) => warn!(%err, "failed to build replacement http client"),
            }
        }
    }
}

fn build_client() -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder()
        .use_rustls_tls()
        .build()?)
}

/// The configuration REST endpoints with endpoint failover.
pub struct HttpApi {
    pool: Arc<ServerAddressPool>,
    token: Arc<AccessTokenManager>,
    factory: Arc<RecyclingClientFactory>,
    request_timeout: Duration,
    long_poll_timeout: Duration,
}

impl HttpApi {
    pub fn new(
        pool: Arc<ServerAddressPool>,
        token: Arc<AccessTokenManager>,
        factory: Arc<RecyclingClientFactory>,
        request_timeout: Duration,
        long_poll_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            token,
            factory,
            request_timeout,
            long_poll_timeout,
        }
    }

    /// Fetches the current content of one configuration entry.
    pub async fn fetch_configuration(&self, identity: &ConfigIdentity) -> Result<String, ClientError> {
        self.execute(&RequestSpec::Fetch(identity))
            .await
            .map_err(|err| match err {
                ClientError::NotFound(_) => ClientError::NotFound(identity.unique_key()),
                other => other,
            })
    }

    /// One long-poll round for `descriptor`. Returns `Ok(true)` when the
    /// server reported a change, `Ok(false)` when the wait budget elapsed
    /// with nothing new.
    pub async fn poll_listening(&self, descriptor: &ConfigDescriptor) -> Result<bool, ClientError> {
        let body = self.execute(&RequestSpec::Listen(descriptor)).await?;
        Ok(!body.trim().is_empty())
    }

    /// Runs one request with failover: at least three attempts, or one per
    /// pool member when the pool is larger. Server verdicts (not found,
    /// forbidden) surface immediately; connectivity failures advance the
    /// rotation and try the next server.
    async fn execute(&self, spec: &RequestSpec<'_>) -> Result<String, ClientError> {
        let attempts = self.pool.len()?.max(3);
        for _ in 0..attempts {
            let endpoint = self.pool.current()?;
            let client = self.factory.client();
            match self.send_once(&endpoint, &client, spec).await {
                Ok(body) => return Ok(body),
                Err(err @ (ClientError::NotFound(_) | ClientError::Forbidden(_))) => {
                    return Err(err)
                }
                Err(err) => {
                    warn!(%err, server = %endpoint, "request failed, moving to next server");
                    self.pool.next()?;
                }
            }
        }
        Err(ClientError::EndpointsExhausted)
    }

    async fn send_once(
        &self,
        endpoint: &ServerEndpoint,
        client: &reqwest::Client,
        spec: &RequestSpec<'_>,
    ) -> Result<String, ClientError> {
        let builder = match spec {
            RequestSpec::Fetch(identity) => client
                .get(endpoint.http_url(CONFIG_PATH))
                .query(&[
                    ("tenant", identity.namespace()),
                    ("group", identity.group()),
                    ("dataId", identity.data_id()),
                ])
                .timeout(self.request_timeout),
            RequestSpec::Listen(descriptor) => client
                .post(endpoint.http_url(LISTENER_PATH))
                .header(
                    LONG_POLL_TIMEOUT_HEADER,
                    self.long_poll_timeout.as_millis().to_string(),
                )
                .form(&[(LISTENING_CONFIGS_FIELD, encode_listening_configs(descriptor))])
                .timeout(self.long_poll_timeout + LONG_POLL_SLACK),
        };
        let builder = match self.token.access_token() {
            Some(token) => builder.query(&[("accessToken", token)]),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        debug!(server = %endpoint, %status, "request completed");
        match status {
            reqwest::StatusCode::OK => Ok(response.text().await?),
            reqwest::StatusCode::FORBIDDEN => Err(ClientError::Forbidden(format!(
                "server {endpoint} rejected the request"
            ))),
            reqwest::StatusCode::NOT_FOUND => {
                Err(ClientError::NotFound(format!("server {endpoint}")))
            }
            other => Err(ClientError::Protocol(format!(
                "unexpected status {other} from {endpoint}"
            ))),
        }
    }
}

enum RequestSpec<'a> {
    Fetch(&'a ConfigIdentity),
    Listen(&'a ConfigDescriptor),
}

/// Encodes one watched entry in the listener form format: fields separated
/// by U+0002, the entry terminated by U+0001. The digest field is empty for
/// a never-synced descriptor, which asks the server to report the entry as
/// changed right away.
pub fn encode_listening_configs(descriptor: &ConfigDescriptor) -> String {
    let hash = descriptor.hash().unwrap_or_default();
    format!(
        "{data_id}{fs}{group}{fs}{hash}{fs}{tenant}{es}",
        data_id = descriptor.data_id(),
        group = descriptor.group(),
        tenant = descriptor.namespace(),
        fs = FIELD_SEPARATOR,
        es = ENTRY_SEPARATOR,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::descriptor::md5_hex;
    use httptest::{matchers::*, responders::status_code, Expectation, Server};

    fn descriptor() -> ConfigDescriptor {
        ConfigDescriptor::new(ConfigIdentity::with_group("ns", "grp", "app").unwrap())
    }

    fn api_for(server: &Server) -> HttpApi {
        let options = ClientOptions::default();
        let pool = Arc::new(
            ServerAddressPool::fixed(vec![ServerEndpoint::parse(&server.url_str("")).unwrap()])
                .unwrap(),
        );
        HttpApi::new(
            pool,
            Arc::new(AccessTokenManager::anonymous()),
            RecyclingClientFactory::new().unwrap(),
            options.request_timeout,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn listening_configs_encoding_uses_separators() {
        let synced = descriptor().with_content("body", md5_hex("body"));
        let encoded = encode_listening_configs(&synced);
        assert_eq!(
            encoded,
            format!("app\u{2}grp\u{2}{}\u{2}ns\u{1}", md5_hex("body"))
        );

        let fresh = descriptor();
        assert_eq!(encode_listening_configs(&fresh), "app\u{2}grp\u{2}\u{2}ns\u{1}");
    }

    #[tokio::test]
    async fn fetch_returns_body_on_ok() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", CONFIG_PATH),
                request::query(url_decoded(contains(("dataId", "app")))),
                request::query(url_decoded(contains(("tenant", "ns")))),
            ])
            .respond_with(status_code(200).body("the-content")),
        );
        let api = api_for(&server);
        let body = api
            .fetch_configuration(descriptor().identity())
            .await
            .unwrap();
        assert_eq!(body, "the-content");
    }

    #[tokio::test]
    async fn fetch_maps_404_to_not_found_with_key() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", CONFIG_PATH))
                .respond_with(status_code(404)),
        );
        let api = api_for(&server);
        let err = api
            .fetch_configuration(descriptor().identity())
            .await
            .unwrap_err();
        match err {
            ClientError::NotFound(key) => assert_eq!(key, "ns@grp@app"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forbidden_is_not_retried() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", CONFIG_PATH))
                .times(1)
                .respond_with(status_code(403)),
        );
        let api = api_for(&server);
        let err = api
            .fetch_configuration(descriptor().identity())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Forbidden(_)));
    }

    #[tokio::test]
    async fn server_errors_fail_over_until_exhausted() {
        let server = Server::run();
        // single-member pool still gets three attempts
        server.expect(
            Expectation::matching(request::method_path("GET", CONFIG_PATH))
                .times(3)
                .respond_with(status_code(500)),
        );
        let api = api_for(&server);
        let err = api
            .fetch_configuration(descriptor().identity())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::EndpointsExhausted));
    }

    #[tokio::test]
    async fn poll_reports_change_only_for_nonempty_body() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", LISTENER_PATH),
                request::headers(contains(("long-pulling-timeout", "1000"))),
            ])
            .times(2)
            .respond_with(status_code(200).body("app\u{2}grp\u{2}ns\u{1}")),
        );
        let api = api_for(&server);
        assert!(api.poll_listening(&descriptor()).await.unwrap());
        assert!(api.poll_listening(&descriptor()).await.unwrap());

        let quiet = Server::run();
        quiet.expect(
            Expectation::matching(request::method_path("POST", LISTENER_PATH))
                .respond_with(status_code(200).body("")),
        );
        let api = api_for(&quiet);
        assert!(!api.poll_listening(&descriptor()).await.unwrap());
    }
}
