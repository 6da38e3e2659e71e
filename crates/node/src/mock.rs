//! In-memory transport for tests and simulations.
//!
//! A [`MemoryHub`] is a process-local switchboard: every endpoint
//! registers under its node id and gets back a [`MemoryTransport`] for
//! sending plus the inbox its peers' frames land in. Frames arrive as
//! `(sender_id, bytes)` so a receive loop can route them the same way a
//! real host would.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use eyre::{bail, Result as EyreResult};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::transport::Transport;

type Inbox = UnboundedSender<(String, Vec<u8>)>;

/// Switchboard connecting in-process endpoints by node id.
#[derive(Clone, Debug, Default)]
pub struct MemoryHub {
    inboxes: Arc<DashMap<String, Inbox>>,
}

impl MemoryHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node_id` on the hub.
    ///
    /// Returns the endpoint's sending half and the receiver its inbound
    /// frames arrive on. Registering the same id again replaces the old
    /// inbox, which then only drains what it already holds.
    #[must_use]
    pub fn endpoint(
        &self,
        node_id: impl Into<String>,
    ) -> (MemoryTransport, UnboundedReceiver<(String, Vec<u8>)>) {
        let node_id = node_id.into();
        let (sender, receiver) = mpsc::unbounded_channel();

        let _previous = self.inboxes.insert(node_id.clone(), sender);

        let transport = MemoryTransport {
            local_id: node_id,
            inboxes: Arc::clone(&self.inboxes),
        };

        (transport, receiver)
    }
}

/// One endpoint's sending half of a [`MemoryHub`].
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    local_id: String,
    inboxes: Arc<DashMap<String, Inbox>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer_id: &str, bytes: Vec<u8>) -> EyreResult<()> {
        let Some(inbox) = self.inboxes.get(peer_id) else {
            bail!("no route to peer {peer_id}");
        };

        if inbox.send((self.local_id.clone(), bytes)).is_err() {
            bail!("peer {peer_id} stopped receiving");
        }

        Ok(())
    }
}
