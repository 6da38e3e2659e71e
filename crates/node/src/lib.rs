//! Replica shell: one node of the registry, tying a [`SyncEngine`] to a
//! [`Transport`] and driving anti-entropy rounds against its peers.
//!
//! # Round protocol
//!
//! ```text
//! Initiator                                 Responder
//! │                                               │
//! │ ── TreeAnnounce(tree) ──────────────────────► │ compare
//! │ ◄──────────────────────── TreeReply(tree) ─── │
//! │ ◄────────────────── PartialUpdate(records) ── │
//! │ compare                                       │
//! │ ── PartialUpdate(records) ──────────────────► │
//! │                                               │
//! ```
//!
//! Each side merges the partial it receives. The responder always sends
//! its partial, empty batches included, so a round settles after four
//! messages whichever way the catalogs differ. Equal trees short-circuit
//! into an empty diff and an empty partial; no record bytes move.
//!
//! The initiator keeps per-round state (a mailbox the receive path
//! forwards into); the responder keeps none. A replica that never
//! initiates still converges by answering announces.

pub mod mock;
pub mod rpc;
pub mod transport;

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use borsh::{from_slice, to_vec, BorshDeserialize, BorshSerialize};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use eyre::{bail, Result as EyreResult, WrapErr};
use flotilla_catalog::liveness::{LivenessPolicy, NoExpiry};
use flotilla_config::ConfigFile;
use flotilla_sync::engine::{RoundPhase, SyncEngine};
use flotilla_sync::wire;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

use crate::transport::Transport;

/// A frame of the replica channel.
#[derive(BorshDeserialize, BorshSerialize, Clone, Debug)]
pub enum SyncMessage {
    /// Opens a round: the sender's serialized hash tree.
    TreeAnnounce(Vec<u8>),
    /// Answers an announce with the receiver's own tree.
    TreeReply(Vec<u8>),
    /// A batch of records the sender owns, possibly empty.
    PartialUpdate(Vec<u8>),
}

/// What one anti-entropy round against a peer accomplished.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct SyncReport {
    /// The peer the round ran against.
    pub peer_id: String,
    /// Names of the service groups that differed, canonically ordered.
    pub divergent: Vec<String>,
    /// Records pushed to the peer.
    pub pushed: usize,
    /// Records accepted from the peer.
    pub merged: usize,
}

/// One replica: the engine, its transport and per-peer round state.
///
/// The engine sits behind a single async mutex; every touch is a scoped
/// lock around pure compute, never held across an await.
pub struct RegistryNode {
    node_id: String,
    sync_timeout: Duration,
    sync_interval: Duration,
    engine: Arc<Mutex<SyncEngine>>,
    liveness: Mutex<Box<dyn LivenessPolicy>>,
    transport: Arc<dyn Transport>,
    rounds: DashMap<String, UnboundedSender<SyncMessage>>,
    phases: DashMap<String, RoundPhase>,
}

impl RegistryNode {
    /// Builds a replica from its configuration, seeding the engine with
    /// the node's own location record.
    #[must_use]
    pub fn new(config: &ConfigFile, transport: Arc<dyn Transport>) -> Self {
        let mut engine = SyncEngine::new(config.node.node_id.clone());
        engine.upsert_node(config.node.to_info());

        Self {
            node_id: config.node.node_id.clone(),
            sync_timeout: config.sync.timeout,
            sync_interval: config.sync.interval,
            engine: Arc::new(Mutex::new(engine)),
            liveness: Mutex::new(Box::new(NoExpiry)),
            transport,
            rounds: DashMap::new(),
            phases: DashMap::new(),
        }
    }

    /// Swaps the policy consulted by [`Self::sweep_liveness`].
    #[must_use]
    pub fn with_liveness_policy(mut self, policy: Box<dyn LivenessPolicy>) -> Self {
        self.liveness = Mutex::new(policy);
        self
    }

    /// The id this replica announces and exports under.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Shared handle to the engine, for the call server and direct reads.
    #[must_use]
    pub fn engine(&self) -> Arc<Mutex<SyncEngine>> {
        Arc::clone(&self.engine)
    }

    /// Where the protocol with `peer_id` currently stands.
    #[must_use]
    pub fn phase(&self, peer_id: &str) -> RoundPhase {
        self.phases
            .get(peer_id)
            .map_or(RoundPhase::Idle, |entry| *entry)
    }

    /// Runs the installed liveness policy over the catalog, answering how
    /// many instances it downed.
    pub async fn sweep_liveness(&self) -> usize {
        let mut policy = self.liveness.lock().await;
        let mut engine = self.engine.lock().await;

        engine.sweep_liveness(&mut **policy)
    }

    /// Runs one full round against `peer_id` as the initiator.
    ///
    /// Registers the round's mailbox, announces the local tree and then
    /// follows the mailbox until both the reply tree and the peer's
    /// partial have been handled. An announce landing mid-round means the
    /// peer initiated simultaneously; it is served inline. The caller
    /// bounds the round with a timeout: dropping the future abandons the
    /// round, frees the mailbox and resets the phase, with no rollback of
    /// anything already merged.
    pub async fn sync_once(&self, peer_id: &str) -> EyreResult<SyncReport> {
        let (sender, mut mailbox) = mpsc::unbounded_channel();

        match self.rounds.entry(peer_id.to_owned()) {
            Entry::Occupied(_) => bail!("a sync round with {peer_id} is already in flight"),
            Entry::Vacant(slot) => {
                let _inserted = slot.insert(sender);
            }
        }

        let _guard = RoundGuard {
            node: self,
            peer_id,
        };

        let tree = {
            let engine = self.engine.lock().await;
            engine.tree_bytes()
        };

        self.send_to(peer_id, &SyncMessage::TreeAnnounce(tree))
            .await?;
        self.set_phase(peer_id, RoundPhase::TreeExchanged);

        let mut report = SyncReport {
            peer_id: peer_id.to_owned(),
            ..SyncReport::default()
        };
        let mut replied = false;
        let mut merged = false;

        while !(replied && merged) {
            let Some(message) = mailbox.recv().await else {
                bail!("sync round with {peer_id} lost its mailbox");
            };

            match message {
                SyncMessage::TreeAnnounce(remote) => {
                    self.answer_announce(peer_id, &remote).await?;
                }
                SyncMessage::TreeReply(remote) => {
                    let (divergent, batch) = {
                        let engine = self.engine.lock().await;
                        let divergent = engine.compare_and_sync(&remote)?;
                        let batch = engine.export_groups_owned_by(&divergent);
                        (divergent, batch)
                    };
                    self.set_phase(peer_id, RoundPhase::DiffComputed);

                    report.divergent = divergent;
                    report.pushed = wire::batch_record_count(&batch)?;

                    self.send_to(peer_id, &SyncMessage::PartialUpdate(batch))
                        .await?;
                    self.set_phase(peer_id, RoundPhase::PartialPushed);
                    replied = true;
                }
                SyncMessage::PartialUpdate(batch) => {
                    report.merged = {
                        let mut engine = self.engine.lock().await;
                        engine.merge(&batch)?
                    };
                    merged = true;
                }
            }
        }

        self.set_phase(peer_id, RoundPhase::Merged);
        debug!(
            %peer_id,
            divergent = report.divergent.len(),
            pushed = report.pushed,
            merged = report.merged,
            "sync round complete",
        );

        Ok(report)
    }

    /// Entry point for replica-channel bytes received from `peer_id`.
    ///
    /// Frames belonging to an open round are forwarded into its mailbox;
    /// everything else is served statelessly.
    pub async fn handle_sync_message(&self, peer_id: &str, bytes: &[u8]) -> EyreResult<()> {
        let message = from_slice::<SyncMessage>(bytes).wrap_err("malformed sync frame")?;

        let Some(message) = self.forward_to_round(peer_id, message) else {
            return Ok(());
        };

        match message {
            SyncMessage::TreeAnnounce(remote) => self.answer_announce(peer_id, &remote).await,
            SyncMessage::TreeReply(remote) => {
                // A reply with no round behind it: ours was abandoned after
                // the announce went out. Push our partial so the peer still
                // converges, but answer with no further tree, which would
                // only ping-pong.
                let batch = {
                    let engine = self.engine.lock().await;
                    let divergent = engine.compare_and_sync(&remote)?;
                    engine.export_groups_owned_by(&divergent)
                };

                self.send_to(peer_id, &SyncMessage::PartialUpdate(batch))
                    .await?;
                self.track_phase(peer_id, RoundPhase::PartialPushed);

                Ok(())
            }
            SyncMessage::PartialUpdate(batch) => {
                let accepted = {
                    let mut engine = self.engine.lock().await;
                    engine.merge(&batch)?
                };

                debug!(%peer_id, accepted, "merged partial outside a round");
                self.track_phase(peer_id, RoundPhase::Idle);

                Ok(())
            }
        }
    }

    /// Spawns the periodic anti-entropy driver.
    ///
    /// Every interval tick runs one round against each peer under the
    /// configured sync timeout. Failures are logged and the loop moves
    /// on; the next tick retries from whatever state the catalogs are in.
    #[must_use]
    pub fn spawn_sync_loop(self: Arc<Self>, peers: Vec<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = interval(self.sync_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

            debug!(peers = peers.len(), "anti-entropy loop running");

            loop {
                let _deadline = ticks.tick().await;

                for peer_id in &peers {
                    match timeout(self.sync_timeout, self.sync_once(peer_id)).await {
                        Ok(Ok(report)) => {
                            debug!(
                                %peer_id,
                                divergent = report.divergent.len(),
                                pushed = report.pushed,
                                merged = report.merged,
                                "periodic sync round finished",
                            );
                        }
                        Ok(Err(error)) => {
                            warn!(%peer_id, %error, "sync round failed");
                        }
                        Err(_elapsed) => {
                            warn!(%peer_id, "sync round timed out");
                        }
                    }
                }
            }
        })
    }

    /// Responder side of an announce: compare, reply with our tree, then
    /// push our partial for the divergent groups.
    async fn answer_announce(&self, peer_id: &str, remote_tree: &[u8]) -> EyreResult<()> {
        self.track_phase(peer_id, RoundPhase::TreeExchanged);

        let (tree, divergent, batch) = {
            let engine = self.engine.lock().await;
            let divergent = engine.compare_and_sync(remote_tree)?;
            let batch = engine.export_groups_owned_by(&divergent);
            (engine.tree_bytes(), divergent, batch)
        };

        debug!(%peer_id, divergent = divergent.len(), "answering tree announce");
        self.track_phase(peer_id, RoundPhase::DiffComputed);

        self.send_to(peer_id, &SyncMessage::TreeReply(tree)).await?;
        self.send_to(peer_id, &SyncMessage::PartialUpdate(batch))
            .await?;
        self.track_phase(peer_id, RoundPhase::PartialPushed);

        Ok(())
    }

    /// Forwards `message` into the open round's mailbox, handing it back
    /// if no round is open or the round closed under us.
    fn forward_to_round(&self, peer_id: &str, message: SyncMessage) -> Option<SyncMessage> {
        let Some(mailbox) = self.rounds.get(peer_id) else {
            return Some(message);
        };

        match mailbox.send(message) {
            Ok(()) => None,
            Err(returned) => Some(returned.0),
        }
    }

    async fn send_to(&self, peer_id: &str, message: &SyncMessage) -> EyreResult<()> {
        let bytes = to_vec(message).wrap_err("failed to encode sync frame")?;

        self.transport.send(peer_id, bytes).await
    }

    fn set_phase(&self, peer_id: &str, phase: RoundPhase) {
        let _previous = self.phases.insert(peer_id.to_owned(), phase);
    }

    /// Phase bookkeeping for the stateless paths. While a round is open
    /// the driver owns the slot, so responder traffic leaves it alone.
    fn track_phase(&self, peer_id: &str, phase: RoundPhase) {
        if !self.rounds.contains_key(peer_id) {
            self.set_phase(peer_id, phase);
        }
    }
}

impl fmt::Debug for RegistryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryNode")
            .field("node_id", &self.node_id)
            .field("open_rounds", &self.rounds.len())
            .finish_non_exhaustive()
    }
}

/// Round cleanup on every exit path, abandonment included.
struct RoundGuard<'a> {
    node: &'a RegistryNode,
    peer_id: &'a str,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        let _mailbox = self.node.rounds.remove(self.peer_id);
        self.node.set_phase(self.peer_id, RoundPhase::Idle);
    }
}
