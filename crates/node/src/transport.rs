//! Transport abstraction for inter-node traffic.
//!
//! Both channels a node speaks over ride the same seam: the replica
//! channel (sync frames handled by [`RegistryNode::handle_sync_message`])
//! and the call channel (envelopes handled by [`RpcServer::handle_call`]).
//! Implementations own addressing, delivery, retries and backoff; the
//! protocol layers above only ever hand them a peer id and a finished
//! frame.
//!
//! [`RegistryNode::handle_sync_message`]: crate::RegistryNode::handle_sync_message
//! [`RpcServer::handle_call`]: crate::rpc::RpcServer::handle_call

use async_trait::async_trait;
use eyre::Result as EyreResult;

/// Delivers one opaque frame to the peer known as `peer_id`.
///
/// Fire-and-forget: a returned `Ok` means the frame was accepted for
/// delivery, not that the peer processed it. Inbound frames reach the
/// node through the host's receive loop, not through this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer_id: &str, bytes: Vec<u8>) -> EyreResult<()>;
}
