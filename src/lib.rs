//! Client runtime for a remote configuration service.
//!
//! Two session flavors share one model:
//!
//! - [`session::transport::TransportSession`] keeps a duplex websocket open;
//!   the server pushes change notifications and the client re-queries,
//!   re-listens, and notifies subscribers. A supervisor reconnects and
//!   restores every subscription after an outage.
//! - [`session::polling::PollingSession`] runs one HTTP long-poll loop per
//!   watched entry and discovers changes by digest mismatch.
//!
//! Both sit on the same supporting cast: a rotating [`pool::ServerAddressPool`]
//! (fixed list or discovery URL), an [`auth::AccessTokenManager`] that keeps a
//! login token warm, and a [`subscription::SubscriptionRegistry`] mapping each
//! watched entry to its callbacks and last synced snapshot.
//!
//! ```no_run
//! use remote_config_client::{
//!     ClientOptions, ConfigDescriptor, ConfigIdentity, ConfigurationClient, ServerAddressPool,
//! };
//!
//! # async fn run() -> Result<(), remote_config_client::ClientError> {
//! let pool = ServerAddressPool::fixed(vec!["config.internal:8848".parse()?])?;
//! let client = ConfigurationClient::transport(ClientOptions::default(), pool)?;
//! client.init().await?;
//!
//! let descriptor = ConfigDescriptor::new(ConfigIdentity::new("prod", "app-settings")?);
//! let current = client.get_configuration(&descriptor).await?;
//! println!("{:?}", current.content());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod middleware;
pub mod pool;
pub mod session;
pub mod subscription;
pub mod wire;

pub use client::ConfigurationClient;
pub use config::{ClientOptions, Credentials};
pub use descriptor::{md5_hex, ConfigDescriptor, ConfigIdentity, DEFAULT_GROUP};
pub use endpoint::ServerEndpoint;
pub use error::ClientError;
pub use middleware::{Middleware, MiddlewarePipeline, Next};
pub use pool::ServerAddressPool;
pub use session::{SessionState, Subscription};
pub use subscription::{callback, CallbackError, ChangeCallback, SubscriptionRegistry};
