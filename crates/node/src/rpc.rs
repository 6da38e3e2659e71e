//! Request/response calls between nodes.
//!
//! Calls ride the same transport as the replica channel but form their
//! own logical topic: a caller allocates a sequence number, parks a
//! oneshot under it and sends a [`CallEnvelope`]; the serving node runs
//! the request through its engine and answers with a `RegistryResponse`
//! bearing the same sequence number, which the caller's receive loop
//! feeds back through [`CallClient::complete`].

use core::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use borsh::{from_slice, to_vec, BorshDeserialize, BorshSerialize};
use dashmap::DashMap;
use eyre::{Report, Result as EyreResult, WrapErr};
use flotilla_config::DEFAULT_CALL_TIMEOUT;
use flotilla_primitives::messages::{RegistryRequest, RegistryResponse};
use flotilla_sync::engine::SyncEngine;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::transport::Transport;

/// Why a call produced no usable response.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CallError {
    /// No response arrived inside the call timeout.
    #[error("call {seq} timed out")]
    Timeout { seq: u64 },

    /// The peer answered with a non-success status.
    #[error("call rejected with status {status}: {error}")]
    Rejected { status: u16, error: String },

    /// The pending slot was torn down before a response arrived.
    #[error("call channel closed")]
    ChannelClosed,

    /// The transport refused the request frame.
    #[error("transport failed: {0}")]
    Transport(Report),

    /// Envelope or response bytes failed to encode.
    #[error("codec failure: {0}")]
    Codec(#[from] io::Error),
}

/// One call on the wire: a routing label, the caller's sequence number
/// and the request itself.
///
/// `service_method` names the operation for routing and logs (for
/// example `"registry.find"`); dispatch is the request enum itself.
#[derive(BorshDeserialize, BorshSerialize, Clone, Debug)]
pub struct CallEnvelope {
    pub service_method: String,
    pub seq: u64,
    pub request: RegistryRequest,
}

/// Caller side of the call channel.
pub struct CallClient {
    transport: Arc<dyn Transport>,
    seq: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<RegistryResponse>>,
    call_timeout: Duration,
}

impl CallClient {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            seq: AtomicU64::new(0),
            pending: DashMap::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Sends `request` to `peer_id` and awaits the matching response.
    ///
    /// A response with a non-success status comes back as
    /// [`CallError::Rejected`]; silence past the configured timeout as
    /// [`CallError::Timeout`]. Either way the pending slot is cleaned up
    /// before returning.
    pub async fn call(
        &self,
        peer_id: &str,
        service_method: impl Into<String>,
        request: RegistryRequest,
    ) -> Result<RegistryResponse, CallError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let envelope = CallEnvelope {
            service_method: service_method.into(),
            seq,
            request,
        };
        let bytes = to_vec(&envelope)?;

        let (reply_sender, reply) = oneshot::channel();
        let _previous = self.pending.insert(seq, reply_sender);

        if let Err(error) = self.transport.send(peer_id, bytes).await {
            let _slot = self.pending.remove(&seq);
            return Err(CallError::Transport(error));
        }

        let response = match timeout(self.call_timeout, reply).await {
            Ok(Ok(response)) => response,
            Ok(Err(_closed)) => {
                let _slot = self.pending.remove(&seq);
                return Err(CallError::ChannelClosed);
            }
            Err(_elapsed) => {
                let _slot = self.pending.remove(&seq);
                return Err(CallError::Timeout { seq });
            }
        };

        if !response.is_success() {
            return Err(CallError::Rejected {
                status: response.status,
                error: response.error,
            });
        }

        Ok(response)
    }

    /// Hands a decoded response to the call waiting on its sequence
    /// number. Responses nobody is waiting for are dropped with a warning.
    pub fn complete(&self, response: RegistryResponse) {
        let Some((seq, slot)) = self.pending.remove(&response.seq) else {
            warn!(seq = response.seq, "response for an unknown call");
            return;
        };

        if slot.send(response).is_err() {
            debug!(seq, "call abandoned before its response arrived");
        }
    }
}

impl fmt::Debug for CallClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallClient")
            .field("pending", &self.pending.len())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

/// Serving side of the call channel.
pub struct RpcServer {
    engine: Arc<Mutex<SyncEngine>>,
    transport: Arc<dyn Transport>,
}

impl RpcServer {
    #[must_use]
    pub fn new(engine: Arc<Mutex<SyncEngine>>, transport: Arc<dyn Transport>) -> Self {
        Self { engine, transport }
    }

    /// Decodes one call from `peer_id`, runs it through the engine and
    /// answers over the transport.
    pub async fn handle_call(&self, peer_id: &str, bytes: &[u8]) -> EyreResult<()> {
        let envelope = from_slice::<CallEnvelope>(bytes).wrap_err("malformed call envelope")?;

        debug!(
            %peer_id,
            seq = envelope.seq,
            method = %envelope.service_method,
            "handling call",
        );

        let response = {
            let mut engine = self.engine.lock().await;
            engine.handle(envelope.seq, envelope.request)
        };

        let bytes = to_vec(&response).wrap_err("failed to encode call response")?;
        self.transport.send(peer_id, bytes).await
    }
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer").finish_non_exhaustive()
    }
}
