//! Interceptor chain around configuration fetches.
//!
//! Middlewares wrap the terminal fetch in onion order: the most recently
//! added middleware runs first and sees the final result last. Each
//! middleware may rewrite the request descriptor, short-circuit with its own
//! result, or pass through via [`Next::run`].

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::descriptor::ConfigDescriptor;
use crate::error::ClientError;

/// The terminal operation a pipeline wraps: fetch the descriptor's current
/// content from the server.
pub type FetchFn = Box<
    dyn Fn(ConfigDescriptor) -> BoxFuture<'static, Result<ConfigDescriptor, ClientError>>
        + Send
        + Sync,
>;

/// One interceptor.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        descriptor: ConfigDescriptor,
        next: Next<'_>,
    ) -> Result<ConfigDescriptor, ClientError>;
}

/// The remainder of the chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a FetchFn,
}

impl<'a> Next<'a> {
    pub fn run(
        self,
        descriptor: ConfigDescriptor,
    ) -> BoxFuture<'a, Result<ConfigDescriptor, ClientError>> {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((head, rest)) => {
                    head.handle(
                        descriptor,
                        Next {
                            chain: rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
                }
                None => (self.terminal)(descriptor).await,
            }
        })
    }
}

/// Ordered middleware collection.
#[derive(Default)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.add(middleware);
        self
    }

    /// Runs the chain around `terminal`, most recently added middleware
    /// outermost.
    pub async fn execute(
        &self,
        descriptor: ConfigDescriptor,
        terminal: &FetchFn,
    ) -> Result<ConfigDescriptor, ClientError> {
        let chain: Vec<Arc<dyn Middleware>> =
            self.middlewares.iter().rev().cloned().collect();
        Next {
            chain: &chain,
            terminal,
        }
        .run(descriptor)
        .await
    }
}
