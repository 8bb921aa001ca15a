//! Server address pools.
//!
//! A pool owns the ordered list of candidate servers and a rotation cursor.
//! The fixed pool is handed its list up front; the remote pool bootstraps the
//! list from a discovery URL and keeps it fresh in the background.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryScaler;
use crate::endpoint::ServerEndpoint;
use crate::error::ClientError;

/// How often the remote pool re-reads the discovery URL.
pub const REMOTE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const DISCOVERY_ATTEMPTS: u32 = 3;
const DISCOVERY_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Rotation {
    addresses: Vec<ServerEndpoint>,
    index: usize,
}

impl Rotation {
    /// Cursor starts at a random slot so a fleet of clients spreads its
    /// first requests across the servers.
    fn new(addresses: Vec<ServerEndpoint>) -> Self {
        let index = rand::thread_rng().gen_range(0..addresses.len());
        Self { addresses, index }
    }

    fn current(&self) -> ServerEndpoint {
        self.addresses[self.index].clone()
    }

    fn advance(&mut self) -> ServerEndpoint {
        self.index = (self.index + 1) % self.addresses.len();
        self.current()
    }

    fn random(&self) -> ServerEndpoint {
        let i = rand::thread_rng().gen_range(0..self.addresses.len());
        self.addresses[i].clone()
    }
}

/// Pool over a caller-supplied, never-changing address list.
#[derive(Debug)]
pub struct FixedAddressPool {
    rotation: Mutex<Rotation>,
    len: usize,
}

impl FixedAddressPool {
    pub fn new(addresses: Vec<ServerEndpoint>) -> Result<Self, ClientError> {
        if addresses.is_empty() {
            return Err(ClientError::InvalidEndpoint("address list is empty".to_string()));
        }
        let len = addresses.len();
        Ok(Self {
            rotation: Mutex::new(Rotation::new(addresses)),
            len,
        })
    }

    /// Convenience constructor from raw endpoint strings.
    pub fn from_strings<S: AsRef<str>>(addresses: &[S]) -> Result<Self, ClientError> {
        let parsed = addresses
            .iter()
            .map(|s| ServerEndpoint::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(parsed)
    }

    fn current(&self) -> ServerEndpoint {
        self.rotation.lock().unwrap().current()
    }

    fn next(&self) -> ServerEndpoint {
        self.rotation.lock().unwrap().advance()
    }

    fn random(&self) -> ServerEndpoint {
        self.rotation.lock().unwrap().random()
    }
}

/// Pool whose address list is fetched from a discovery URL and refreshed
/// every [`REMOTE_REFRESH_INTERVAL`].
///
/// All accessors fail with [`ClientError::PoolNotInitialized`] until the
/// first fetch succeeds.
pub struct RemoteAddressPool {
    discovery_url: String,
    http: reqwest::Client,
    state: Mutex<Option<Rotation>>,
    refresher_started: AtomicBool,
    cancel: CancellationToken,
}

impl RemoteAddressPool {
    pub fn new(discovery_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            discovery_url: discovery_url.into(),
            http: reqwest::Client::new(),
            state: Mutex::new(None),
            refresher_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Performs the initial fetch (a few quick attempts) and starts the
    /// background refresher.
    pub async fn init(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut last_err = None;
        for attempt in 1..=DISCOVERY_ATTEMPTS {
            match self.fetch_addresses().await {
                Ok(addresses) => {
                    self.store(addresses);
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!(%err, attempt, url = %self.discovery_url, "address discovery failed");
                    last_err = Some(err);
                    if attempt < DISCOVERY_ATTEMPTS {
                        tokio::time::sleep(DISCOVERY_RETRY_DELAY).await;
                    }
                }
            }
        }
        if let Some(err) = last_err {
            return Err(err);
        }
        if !self.refresher_started.swap(true, Ordering::SeqCst) {
            let pool = Arc::clone(self);
            tokio::spawn(async move { pool.run_refresher().await });
        }
        Ok(())
    }

    async fn run_refresher(self: Arc<Self>) {
        let mut scaler = RetryScaler::new(10, 10, 60);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("address pool refresher stopping");
                    return;
                }
                _ = tokio::time::sleep(REMOTE_REFRESH_INTERVAL) => {}
            }
            match self.fetch_addresses().await {
                Ok(addresses) => {
                    self.store(addresses);
                    scaler.reset();
                }
                Err(err) => {
                    scaler.advance();
                    error!(
                        %err,
                        retry_in = scaler.value(),
                        url = %self.discovery_url,
                        "address list refresh failed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(scaler.delay()) => {}
                    }
                }
            }
        }
    }

    /// Reads the discovery URL: one server address per line.
    async fn fetch_addresses(&self) -> Result<Vec<ServerEndpoint>, ClientError> {
        let response = self
            .http
            .get(&self.discovery_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        let addresses = body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ServerEndpoint::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if addresses.is_empty() {
            return Err(ClientError::InvalidEndpoint(format!(
                "discovery response from {} held no addresses",
                self.discovery_url
            )));
        }
        Ok(addresses)
    }

    /// Swaps the whole list in one shot. The cursor restarts at a random
    /// slot; callers mid-rotation simply continue on the new list.
    fn store(&self, addresses: Vec<ServerEndpoint>) {
        let count = addresses.len();
        *self.state.lock().unwrap() = Some(Rotation::new(addresses));
        info!(count, url = %self.discovery_url, "server address list updated");
    }

    fn with_rotation<T>(
        &self,
        f: impl FnOnce(&mut Rotation) -> T,
    ) -> Result<T, ClientError> {
        let mut state = self.state.lock().unwrap();
        match state.as_mut() {
            Some(rotation) => Ok(f(rotation)),
            None => Err(ClientError::PoolNotInitialized),
        }
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// The two pool flavors behind one call surface.
pub enum ServerAddressPool {
    Fixed(FixedAddressPool),
    Remote(Arc<RemoteAddressPool>),
}

impl ServerAddressPool {
    pub fn fixed(addresses: Vec<ServerEndpoint>) -> Result<Self, ClientError> {
        Ok(Self::Fixed(FixedAddressPool::new(addresses)?))
    }

    pub fn remote(discovery_url: impl Into<String>) -> Self {
        Self::Remote(RemoteAddressPool::new(discovery_url))
    }

    pub async fn init(&self) -> Result<(), ClientError> {
        match self {
            Self::Fixed(_) => Ok(()),
            Self::Remote(pool) => pool.init().await,
        }
    }

    /// Address the rotation cursor points at.
    pub fn current(&self) -> Result<ServerEndpoint, ClientError> {
        match self {
            Self::Fixed(pool) => Ok(pool.current()),
            Self::Remote(pool) => pool.with_rotation(|r| r.current()),
        }
    }

    /// Advances the cursor (wrapping) and returns the new address.
    pub fn next(&self) -> Result<ServerEndpoint, ClientError> {
        match self {
            Self::Fixed(pool) => Ok(pool.next()),
            Self::Remote(pool) => pool.with_rotation(|r| r.advance()),
        }
    }

    /// Uniformly random member, independent of the cursor.
    pub fn random(&self) -> Result<ServerEndpoint, ClientError> {
        match self {
            Self::Fixed(pool) => Ok(pool.random()),
            Self::Remote(pool) => pool.with_rotation(|r| r.random()),
        }
    }

    /// Snapshot of every member, in list order.
    pub fn all(&self) -> Result<Vec<ServerEndpoint>, ClientError> {
        match self {
            Self::Fixed(pool) => Ok(pool.rotation.lock().unwrap().addresses.clone()),
            Self::Remote(pool) => pool.with_rotation(|r| r.addresses.clone()),
        }
    }

    pub fn len(&self) -> Result<usize, ClientError> {
        match self {
            Self::Fixed(pool) => Ok(pool.len),
            Self::Remote(pool) => pool.with_rotation(|r| r.addresses.len()),
        }
    }

    pub fn is_empty(&self) -> Result<bool, ClientError> {
        Ok(self.len()? == 0)
    }

    pub fn shutdown(&self) {
        if let Self::Remote(pool) = self {
            pool.shutdown();
        }
    }
}
