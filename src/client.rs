//! Request layer that falls back to the sync queue when the network is down.

use std::sync::Arc;
use thiserror::Error;

use crate::sync::metadata;
use crate::sync::{Body, EnqueueRequest, Headers, Method, QueueError, SyncContext, SyncQueue};
use crate::transport::{OutboundRequest, SendOptions, Transport, TransportError};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What happened to a mutating request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Held for later delivery under this operation id.
    Queued { id: String },
}

pub struct QueueingClient {
    transport: Arc<dyn Transport>,
    queue: Arc<SyncQueue>,
}

impl QueueingClient {
    pub fn new(transport: Arc<dyn Transport>, queue: Arc<SyncQueue>) -> Self {
        Self { transport, queue }
    }

    /// Send now when possible. Offline requests and connection failures are
    /// queued; a server that answered with an error status is reported as is.
    pub async fn send(&self, request: EnqueueRequest, options: SendOptions) -> Result<Delivery, ClientError> {
        let method: Method = request.method.parse()?;

        if !self.queue.network().is_online() {
            if options.skip_queue {
                return Err(TransportError::Unavailable("offline".into()).into());
            }
            tracing::info!("Offline, queueing {} {}", method, request.endpoint);
            return self.enqueue(request).await;
        }

        // Fix the op id now so a retry of a request that did reach the server
        // is recognised as the same mutation.
        let ctx = SyncContext::resolve(request.sync.as_ref(), &self.queue.config().identity);
        let mut headers = Headers::normalized(request.headers.clone());
        let mut body = request.body.clone();
        if let Some(json) = body.as_mut().filter(|b| matches!(b, Body::Json(_))) {
            metadata::embed(json, &ctx);
            if !headers.contains("content-type") {
                headers.set("Content-Type", "application/json");
            }
        }

        let outbound = OutboundRequest {
            endpoint: request.endpoint.clone(),
            method,
            headers,
            body: body.as_ref().map(Body::to_wire).transpose()?,
        };

        match self.transport.send(outbound, options).await {
            Ok(()) => Ok(Delivery::Sent),
            Err(e) if e.is_network_failure() && !options.skip_queue => {
                tracing::warn!("{} {} failed ({}), queueing for retry", method, request.endpoint, e);
                self.enqueue(EnqueueRequest {
                    sync: Some(ctx.into()),
                    ..request
                })
                .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<Delivery, ClientError> {
        let op = self.queue.enqueue(request).await?;
        Ok(Delivery::Queued { id: op.id })
    }
}
