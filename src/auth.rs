//! Access token acquisition and proactive refresh.
//!
//! Tokens are treated as expired at 90% of their server-reported lifetime so
//! a token observed as valid stays valid for the request it is attached to.
//! A background task re-logs-in at roughly two-thirds of the lifetime,
//! keeping the slot warm well before expiry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Credentials;
use crate::error::ClientError;
use crate::http::{RecyclingClientFactory, LOGIN_PATH};
use crate::pool::ServerAddressPool;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRY_DELAY_SECS: u64 = 120;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    token_ttl: u64,
}

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: Instant,
}

impl AccessToken {
    fn new(token: String, ttl_secs: u64) -> Self {
        Self::issued_at(token, ttl_secs, Instant::now())
    }

    fn issued_at(token: String, ttl_secs: u64, now: Instant) -> Self {
        let usable = ttl_secs.saturating_sub(ttl_secs / 10);
        Self {
            token,
            expires_at: now + Duration::from_secs(usable),
        }
    }

    fn value_at(&self, now: Instant) -> Option<&str> {
        (now < self.expires_at).then_some(self.token.as_str())
    }
}

struct AuthState {
    credentials: Credentials,
    pool: Arc<ServerAddressPool>,
    factory: Arc<RecyclingClientFactory>,
    slot: RwLock<Option<AccessToken>>,
    refresher_started: AtomicBool,
    cancel: CancellationToken,
}

/// Owns the current access token, if the client is configured with
/// credentials at all.
pub struct AccessTokenManager {
    state: Option<Arc<AuthState>>,
}

impl AccessTokenManager {
    /// Manager for servers without authentication: never yields a token.
    pub fn anonymous() -> Self {
        Self { state: None }
    }

    pub fn new(
        credentials: Credentials,
        pool: Arc<ServerAddressPool>,
        factory: Arc<RecyclingClientFactory>,
    ) -> Self {
        Self {
            state: Some(Arc::new(AuthState {
                credentials,
                pool,
                factory,
                slot: RwLock::new(None),
                refresher_started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            })),
        }
    }

    /// Performs the first login and starts the refresh task. A no-op for the
    /// anonymous manager.
    pub async fn init(&self) -> Result<(), ClientError> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let ttl = login(state).await?;
        if !state.refresher_started.swap(true, Ordering::SeqCst) {
            let state = Arc::clone(state);
            tokio::spawn(async move { run_refresher(state, ttl).await });
        }
        Ok(())
    }

    /// Forces a fresh login right now. A no-op for the anonymous manager.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        match &self.state {
            None => Ok(()),
            Some(state) => login(state).await.map(|_| ()),
        }
    }

    /// The current unexpired token, or `None` for anonymous clients and
    /// expired slots.
    pub fn access_token(&self) -> Option<String> {
        let state = self.state.as_ref()?;
        let slot = state.slot.read().unwrap();
        slot.as_ref()
            .and_then(|t| t.value_at(Instant::now()))
            .map(str::to_string)
    }

    pub fn shutdown(&self) {
        if let Some(state) = &self.state {
            state.cancel.cancel();
        }
    }
}

/// One login round with endpoint failover. A forbidden verdict is permanent;
/// connectivity failures advance the pool. Returns the token lifetime.
async fn login(state: &AuthState) -> Result<u64, ClientError> {
    let attempts = state.pool.len()?.max(3);
    for _ in 0..attempts {
        let endpoint = state.pool.current()?;
        let client = state.factory.client();
        let result = client
            .post(endpoint.http_url(LOGIN_PATH))
            .form(&[
                ("username", state.credentials.username.as_str()),
                ("password", state.credentials.password.as_str()),
            ])
            .timeout(LOGIN_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                let login: LoginResponse = response.json().await?;
                let ttl = login.token_ttl;
                *state.slot.write().unwrap() = Some(AccessToken::new(login.access_token, ttl));
                debug!(server = %endpoint, ttl, "login succeeded");
                return Ok(ttl);
            }
            Ok(response) if response.status() == reqwest::StatusCode::FORBIDDEN => {
                return Err(ClientError::Login(format!(
                    "server {endpoint} rejected the credentials"
                )));
            }
            Ok(response) => {
                warn!(server = %endpoint, status = %response.status(), "login failed, moving to next server");
                state.pool.next()?;
            }
            Err(err) => {
                warn!(%err, server = %endpoint, "login request failed, moving to next server");
                state.pool.next()?;
            }
        }
    }
    Err(ClientError::Login("all server endpoints failed".to_string()))
}

/// Re-logs-in at ~66% of the token lifetime; on failure retries with a delay
/// that grows by 10s per consecutive failure, capped at two minutes.
async fn run_refresher(state: Arc<AuthState>, initial_ttl: u64) {
    let mut ttl = initial_ttl;
    loop {
        let renew_in = Duration::from_secs_f64(ttl as f64 * 0.66);
        tokio::select! {
            _ = state.cancel.cancelled() => return,
            _ = tokio::time::sleep(renew_in) => {}
        }
        let mut fail_count: u64 = 0;
        loop {
            match login(&state).await {
                Ok(new_ttl) => {
                    ttl = new_ttl;
                    break;
                }
                Err(err) => {
                    fail_count += 1;
                    let delay = (fail_count * 10).min(MAX_RETRY_DELAY_SECS);
                    error!(%err, fail_count, retry_in = delay, "access token refresh failed");
                    tokio::select! {
                        _ = state.cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ServerEndpoint;
    use httptest::{cycle, matchers::*, responders::*, Expectation, Server};

    #[test]
    fn token_expires_at_ninety_percent_of_lifetime() {
        let now = Instant::now();
        let token = AccessToken::issued_at("tok".to_string(), 100, now);
        assert_eq!(token.value_at(now + Duration::from_secs(89)), Some("tok"));
        assert_eq!(token.value_at(now + Duration::from_secs(90)), None);
    }

    #[test]
    fn anonymous_manager_never_yields_a_token() {
        let manager = AccessTokenManager::anonymous();
        assert_eq!(manager.access_token(), None);
    }

    fn pool_for(server: &Server) -> Arc<ServerAddressPool> {
        Arc::new(
            ServerAddressPool::fixed(vec![ServerEndpoint::parse(&server.url_str("")).unwrap()])
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn init_logs_in_and_exposes_the_token() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", LOGIN_PATH),
                request::body(url_decoded(contains(("username", "admin")))),
            ])
            .respond_with(json_encoded(serde_json::json!({
                "accessToken": "tok-1",
                "tokenTtl": 18000,
            }))),
        );
        let manager = AccessTokenManager::new(
            Credentials {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
            pool_for(&server),
            RecyclingClientFactory::new().unwrap(),
        );
        manager.init().await.unwrap();
        assert_eq!(manager.access_token().as_deref(), Some("tok-1"));
        manager.shutdown();
    }

    #[tokio::test]
    async fn forbidden_login_is_permanent() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", LOGIN_PATH))
                .times(1)
                .respond_with(status_code(403)),
        );
        let manager = AccessTokenManager::new(
            Credentials {
                username: "admin".to_string(),
                password: "wrong".to_string(),
            },
            pool_for(&server),
            RecyclingClientFactory::new().unwrap(),
        );
        let err = manager.init().await.unwrap_err();
        assert!(matches!(err, ClientError::Login(_)));
        assert_eq!(manager.access_token(), None);
    }

    #[tokio::test]
    async fn transient_login_failures_retry_other_attempts() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", LOGIN_PATH))
                .times(2)
                .respond_with(cycle![
                    status_code(500),
                    json_encoded(serde_json::json!({
                        "accessToken": "tok-2",
                        "tokenTtl": 18000,
                    })),
                ]),
        );
        let manager = AccessTokenManager::new(
            Credentials {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
            pool_for(&server),
            RecyclingClientFactory::new().unwrap(),
        );
        manager.init().await.unwrap();
        assert_eq!(manager.access_token().as_deref(), Some("tok-2"));
        manager.shutdown();
    }
}
