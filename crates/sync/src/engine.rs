//! One replica's registry: the catalog, the hash tree over it, and the
//! anti-entropy operations a peer exchange drives.
//!
//! Every mutation funnels through the engine and ends in a wholesale tree
//! rebuild, so the tree never trails the catalog. The rebuild also captures
//! the group name behind each leaf, which is what lets a divergent leaf
//! index translate back to a name without re-enumerating.

use std::fmt;

use flotilla_catalog::liveness::LivenessPolicy;
use flotilla_catalog::probe::{PerformanceProbe, SimulatedProbe};
use flotilla_catalog::{CatalogError, ServiceCatalog};
use flotilla_merkle::hash::{FoldHasher, Hasher};
use flotilla_merkle::tree::{HashTree, TreeError};
use flotilla_primitives::digest::Digest;
use flotilla_primitives::messages::{
    FindServiceRequest, RegistryRequest, RegistryResponse, ResponseBody,
};
use flotilla_primitives::node::NodeInfo;
use flotilla_primitives::service::ServiceInstance;
use thiserror::Error;
use tracing::debug;

use crate::wire::{self, WireError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncError {
    #[error("peer tree rejected: {0}")]
    Tree(#[from] TreeError),

    #[error("peer batch rejected: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Where one peer exchange currently stands, for logs and introspection.
///
/// A round either runs to [`Merged`](Self::Merged) and settles back to
/// [`Idle`](Self::Idle), or its caller abandons it; abandonment resets the
/// phase without rolling anything back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RoundPhase {
    #[default]
    Idle,
    TreeExchanged,
    DiffComputed,
    PartialPushed,
    Merged,
}

pub struct SyncEngine {
    /// The node id this replica is authoritative for: the only records it
    /// will ever push to a peer.
    owner: String,
    catalog: ServiceCatalog,
    tree: HashTree,
    leaf_names: Vec<String>,
    hasher: Box<dyn Hasher>,
    probe: Box<dyn PerformanceProbe>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(owner_node_id: impl Into<String>) -> Self {
        let hasher: Box<dyn Hasher> = Box::new(FoldHasher);
        let tree = HashTree::build(Vec::new(), hasher.as_ref());

        Self {
            owner: owner_node_id.into(),
            catalog: ServiceCatalog::new(),
            tree,
            leaf_names: Vec::new(),
            hasher,
            probe: Box::new(SimulatedProbe),
        }
    }

    /// Swap the digest function. Peers must agree on it or every tree
    /// exchange reads as fully divergent.
    #[must_use]
    pub fn with_hasher(mut self, hasher: Box<dyn Hasher>) -> Self {
        self.hasher = hasher;
        self.rebuild();
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn PerformanceProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn root(&self) -> Digest {
        self.tree.root()
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.tree.leaf_count()
    }

    /// The local tree, encoded for a peer.
    #[must_use]
    pub fn tree_bytes(&self) -> Vec<u8> {
        self.tree.to_bytes()
    }

    #[must_use]
    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    // -------------------------------------------------------------------------
    // Catalog operations; every mutating success refreshes the tree.
    // -------------------------------------------------------------------------

    pub fn register(&mut self, instance: ServiceInstance) -> Result<(), CatalogError> {
        self.catalog.register(instance)?;
        self.rebuild();
        Ok(())
    }

    pub fn deregister(
        &mut self,
        service_name: &str,
        instance_id: &str,
    ) -> Result<usize, CatalogError> {
        let removed = self.catalog.deregister(service_name, instance_id)?;
        self.rebuild();
        Ok(removed)
    }

    /// Revive the instance carrying `instance_id`, wherever it lives.
    /// Answers whether anything matched; a miss leaves the tree untouched.
    pub fn heartbeat(&mut self, instance_id: &str) -> bool {
        let matched = self.catalog.heartbeat(instance_id);
        if matched {
            self.rebuild();
        }
        matched
    }

    pub fn find(&self, request: &FindServiceRequest) -> Result<&ServiceInstance, CatalogError> {
        self.catalog.find(request, self.probe.as_ref())
    }

    pub fn replace_all(&mut self, instances: Vec<ServiceInstance>) {
        self.catalog.replace_all(instances);
        self.rebuild();
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ServiceInstance> {
        self.catalog.snapshot()
    }

    /// Node metadata never feeds the tree, so no rebuild here.
    pub fn upsert_node(&mut self, info: NodeInfo) {
        self.catalog.upsert_node(info);
    }

    /// Run a liveness policy over the catalog; the tree refreshes only when
    /// the sweep actually downed something.
    pub fn sweep_liveness(&mut self, policy: &mut dyn LivenessPolicy) -> usize {
        let downed = policy.sweep(&mut self.catalog);

        if downed > 0 {
            self.rebuild();
            debug!(downed, root = %self.root(), "liveness sweep downed instances");
        }

        downed
    }

    // -------------------------------------------------------------------------
    // Anti-entropy
    // -------------------------------------------------------------------------

    /// Diff the local tree against a peer's encoded tree and name the
    /// divergent groups, in enumeration order.
    ///
    /// Equal roots answer an empty list without walking. Divergent leaf
    /// indices beyond the local leaf range belong to groups only the peer
    /// holds; they are dropped here because the peer's own round pushes
    /// them.
    pub fn compare_and_sync(&self, remote_tree: &[u8]) -> Result<Vec<String>, SyncError> {
        let remote = HashTree::from_bytes(remote_tree, self.hasher.as_ref())?;

        if remote.root() == self.tree.root() {
            debug!(root = %self.tree.root(), "trees agree, nothing to exchange");
            return Ok(Vec::new());
        }

        let mut divergent = Vec::new();
        for index in self.tree.diff(&remote) {
            if let Some(name) = self.leaf_names.get(index) {
                divergent.push(name.clone());
            } else {
                debug!(index, "divergent leaf has no local group");
            }
        }

        debug!(
            local_root = %self.tree.root(),
            remote_root = %remote.root(),
            divergent = divergent.len(),
            "computed tree divergence"
        );

        Ok(divergent)
    }

    /// Encode the records of the named groups that this replica owns.
    ///
    /// The push half of an exchange: only records whose `node_id` equals the
    /// configured owner leave this node. Unknown names are skipped.
    #[must_use]
    pub fn export_groups_owned_by(&self, groups: &[String]) -> Vec<u8> {
        let records: Vec<ServiceInstance> = groups
            .iter()
            .flat_map(|name| self.catalog.instances_of(name))
            .filter(|instance| instance.node_id == self.owner)
            .cloned()
            .collect();

        debug!(owner = %self.owner, records = records.len(), "exporting owned records");
        wire::encode_batch(&records)
    }

    /// Fold a peer's batch in and refresh the tree.
    ///
    /// All-or-nothing: a batch that fails to decode changes nothing. An
    /// empty batch is a no-op. Answers the number of records applied.
    pub fn merge(&mut self, batch: &[u8]) -> Result<usize, SyncError> {
        let records = wire::decode_batch(batch)?;

        if records.is_empty() {
            debug!("peer batch empty, nothing to merge");
            return Ok(0);
        }

        let applied = self.catalog.merge_records(records);
        self.rebuild();
        debug!(applied, root = %self.root(), "merged peer batch");

        Ok(applied)
    }

    // -------------------------------------------------------------------------
    // Request dispatch
    // -------------------------------------------------------------------------

    /// Serve one registry request. Failures map onto the response status
    /// surface; nothing here panics or escapes as a hard error.
    pub fn handle(&mut self, seq: u64, request: RegistryRequest) -> RegistryResponse {
        match request {
            RegistryRequest::Find(find) => match self.find(&find) {
                Ok(instance) => {
                    debug!(seq, service_name = %find.service_name, "find served");
                    RegistryResponse::success(seq, ResponseBody::Service(instance.clone()))
                }
                Err(CatalogError::NotFound) => RegistryResponse::failure(
                    seq,
                    RegistryResponse::NOT_FOUND,
                    format!(
                        "Service not found or no suitable service: {}",
                        find.service_name
                    ),
                ),
                Err(err) => RegistryResponse::failure(seq, RegistryResponse::ERROR, err.to_string()),
            },
            RegistryRequest::Register(instance) => {
                debug!(
                    seq,
                    service_name = %instance.service_name,
                    node_id = %instance.node_id,
                    "register requested"
                );
                match self.register(instance) {
                    Ok(()) => RegistryResponse::success_message(seq, "Register Success."),
                    Err(err) => {
                        RegistryResponse::failure(seq, RegistryResponse::ERROR, err.to_string())
                    }
                }
            }
            RegistryRequest::Deregister(request) => {
                match self.deregister(&request.service_name, &request.instance_id) {
                    Ok(removed) => {
                        debug!(seq, removed, service_name = %request.service_name, "deregistered");
                        RegistryResponse::success_message(seq, "Deregister Success.")
                    }
                    Err(err @ CatalogError::NotFound) => RegistryResponse::failure(
                        seq,
                        RegistryResponse::NOT_FOUND,
                        err.to_string(),
                    ),
                    Err(err) => {
                        RegistryResponse::failure(seq, RegistryResponse::ERROR, err.to_string())
                    }
                }
            }
            RegistryRequest::Heartbeat(request) => {
                let matched = self.heartbeat(&request.instance_id);
                debug!(seq, instance_id = %request.instance_id, matched, "heartbeat");
                RegistryResponse::success_message(seq, "Heartbeat processed.")
            }
        }
    }

    fn rebuild(&mut self) {
        let digests = self.catalog.group_digests(self.hasher.as_ref());

        let mut names = Vec::with_capacity(digests.len());
        let mut leaves = Vec::with_capacity(digests.len());
        for (name, digest) in digests {
            names.push(name);
            leaves.push(digest);
        }

        self.tree = HashTree::build(leaves, self.hasher.as_ref());
        self.leaf_names = names;
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("owner", &self.owner)
            .field("groups", &self.catalog.group_count())
            .field("root", &self.tree.root())
            .finish_non_exhaustive()
    }
}
