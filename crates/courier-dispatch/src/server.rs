//! ProviderServer - Transport-facing front of the dispatch layer
//!
//! A thin delegation shell: the transport decodes frames into requests and
//! calls `process_request`; everything else (admission, routing, execution)
//! lives behind the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use courier_common::{InvocationRequest, ProviderContext, ServerConfig};

use crate::dispatcher::{RequestDispatcher, ResponseHandle};
use crate::error::Result;

/// Wire-level listener the provider server drives. Implementations own the
/// socket; the server owns request processing.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening per the server configuration.
    async fn bind(&self, config: &ServerConfig) -> anyhow::Result<()>;

    /// Stop accepting connections and release the socket.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

pub struct ProviderServer<T: Transport> {
    config: ServerConfig,
    transport: T,
    dispatcher: Arc<RequestDispatcher>,
}

impl<T: Transport> ProviderServer<T> {
    pub fn new(config: ServerConfig, transport: T, dispatcher: Arc<RequestDispatcher>) -> Self {
        Self {
            config,
            transport,
            dispatcher,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.transport.bind(&self.config).await?;
        info!(
            protocol = %self.config.protocol,
            port = self.config.port,
            "provider server started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.transport.shutdown().await?;
        info!(port = self.config.port, "provider server stopped");
        Ok(())
    }

    /// Entry point for decoded requests arriving off the wire.
    pub fn process_request(&self, request: InvocationRequest) -> Result<ResponseHandle> {
        let context = Arc::new(ProviderContext::new(request));
        self.dispatcher.submit(context)
    }
}
