//! The service catalog: who provides what, from which node, and whether the
//! provider is currently believed alive.
//!
//! Groups are keyed by the service name exactly as registered and enumerate
//! in lexicographic order; within a group, instances stay sorted by
//! `(node_id, instance_id)`. Those two orders are what make catalog digests
//! a function of the record *set*: two replicas holding the same records
//! produce identical group digests no matter the order the records arrived
//! in.

use std::collections::{BTreeMap, BTreeSet};

use flotilla_merkle::hash::Hasher;
use flotilla_primitives::digest::Digest;
use flotilla_primitives::messages::FindServiceRequest;
use flotilla_primitives::node::{Location, NodeInfo};
use flotilla_primitives::service::{ServiceInstance, MODE_FASTEST, MODE_NEAREST};
use thiserror::Error;
use uuid::{Uuid, Variant};

use crate::probe::PerformanceProbe;

pub mod liveness;
pub mod probe;


#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CatalogError {
    /// The instance id is not a well-formed RFC 4122 UUID string.
    #[error("illegal instance id {0:?}")]
    InvalidIdentifier(String),

    /// No instance matched the request.
    #[error("no matching instance")]
    NotFound,

    /// The service name has fewer than three dot segments.
    #[error("malformed service name {0:?}")]
    MalformedName(String),

    /// The selection mode is neither nearest nor fastest.
    #[error("unsupported selection mode {0}")]
    UnsupportedMode(u8),
}

#[derive(Clone, Debug, Default)]
pub struct ServiceCatalog {
    groups: BTreeMap<String, Vec<ServiceInstance>>,
    nodes: BTreeMap<String, NodeInfo>,
}

impl ServiceCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one instance, creating its group on first use.
    ///
    /// The instance id must be a well-formed RFC 4122 UUID string; an
    /// existing record with the same `(node_id, instance_id)` in the group
    /// is replaced in place. The caller owns any digest refresh.
    pub fn register(&mut self, instance: ServiceInstance) -> Result<(), CatalogError> {
        if !is_valid_instance_id(&instance.instance_id) {
            return Err(CatalogError::InvalidIdentifier(instance.instance_id));
        }

        insert_canonical(
            self.groups
                .entry(instance.service_name.clone())
                .or_default(),
            instance,
        );
        Ok(())
    }

    /// Remove every instance of `service_name` carrying `instance_id`.
    ///
    /// Removing the last instance removes the group, so empty groups never
    /// linger as digest leaves.
    pub fn deregister(
        &mut self,
        service_name: &str,
        instance_id: &str,
    ) -> Result<usize, CatalogError> {
        let Some(group) = self.groups.get_mut(service_name) else {
            return Err(CatalogError::NotFound);
        };

        let before = group.len();
        group.retain(|instance| instance.instance_id != instance_id);
        let removed = before - group.len();

        if removed == 0 {
            return Err(CatalogError::NotFound);
        }

        if group.is_empty() {
            let _ignored = self.groups.remove(service_name);
        }

        Ok(removed)
    }

    /// Mark the first instance carrying `instance_id` alive, scanning
    /// groups in enumeration order. Answers whether a match was found; a
    /// miss changes nothing and is not an error.
    ///
    /// A dead instance is retained by everything else in the catalog, so a
    /// heartbeat is enough to bring it back.
    pub fn heartbeat(&mut self, instance_id: &str) -> bool {
        for instance in self.groups.values_mut().flatten() {
            if instance.instance_id == instance_id {
                instance.is_alive = true;
                return true;
            }
        }

        false
    }

    /// Pick the best alive instance for a request.
    ///
    /// The queried name must carry at least three dot segments; the third
    /// is the catalog lookup key (`"Formation.Unit.DataService"` queries
    /// the group registered as `DataService`). Mode [`MODE_NEAREST`] scores
    /// by planar distance between the requester and the instance's node (an
    /// unknown node sits at the origin), [`MODE_FASTEST`] by the probe's
    /// response time. The strictly lowest score wins and ties keep the
    /// earliest instance in canonical order.
    pub fn find(
        &self,
        request: &FindServiceRequest,
        probe: &dyn PerformanceProbe,
    ) -> Result<&ServiceInstance, CatalogError> {
        let key = lookup_key(&request.service_name)
            .ok_or_else(|| CatalogError::MalformedName(request.service_name.clone()))?;

        let mode = request.descriptor.mode;
        if mode != MODE_NEAREST && mode != MODE_FASTEST {
            return Err(CatalogError::UnsupportedMode(mode));
        }

        let Some(group) = self.groups.get(key) else {
            return Err(CatalogError::NotFound);
        };

        let mut best: Option<(&ServiceInstance, f64)> = None;

        for instance in group.iter().filter(|instance| instance.is_alive) {
            let score = if mode == MODE_NEAREST {
                planar_distance(
                    &request.descriptor.location,
                    &self.node_location(&instance.node_id),
                )
            } else {
                probe.response_time_ms(&instance.instance_id)
            };

            if best.map_or(true, |(_, lowest)| score < lowest) {
                best = Some((instance, score));
            }
        }

        best.map(|(instance, _)| instance)
            .ok_or(CatalogError::NotFound)
    }

    /// Drop every group and repopulate from `instances`.
    ///
    /// Peer-supplied records bypass id validation; the node table is
    /// untouched.
    pub fn replace_all(&mut self, instances: Vec<ServiceInstance>) {
        self.groups.clear();

        for instance in instances {
            self.groups
                .entry(instance.service_name.clone())
                .or_default()
                .push(instance);
        }

        for group in self.groups.values_mut() {
            group.sort_by(|a, b| canonical_key(a).cmp(&canonical_key(b)));
        }
    }

    /// Fold a decoded peer batch in: per touched group, the batch's records
    /// replace whatever that group held for those records' nodes, and
    /// records of uninvolved nodes stay put. Applying the same batch twice
    /// lands in the same state.
    pub fn merge_records(&mut self, records: Vec<ServiceInstance>) -> usize {
        let applied = records.len();

        {
            let mut superseded: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
            for record in &records {
                let _ignored = superseded
                    .entry(&record.service_name)
                    .or_default()
                    .insert(&record.node_id);
            }

            for (name, node_ids) in &superseded {
                if let Some(group) = self.groups.get_mut(*name) {
                    group.retain(|instance| !node_ids.contains(instance.node_id.as_str()));
                }
            }
        }

        for record in records {
            insert_canonical(
                self.groups.entry(record.service_name.clone()).or_default(),
                record,
            );
        }

        applied
    }

    /// Every instance, in group order then canonical instance order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ServiceInstance> {
        self.groups.values().flatten().cloned().collect()
    }

    #[must_use]
    pub fn instances_of(&self, service_name: &str) -> &[ServiceInstance] {
        self.groups
            .get(service_name)
            .map_or(&[], Vec::as_slice)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &String> {
        self.groups.keys()
    }

    /// Total instance count across all groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Mark alive instances dead where `predicate` says so, answering how
    /// many went down. Liveness policies are built on this; flipping
    /// `is_alive` never disturbs the canonical order.
    pub fn mark_dead_where(
        &mut self,
        mut predicate: impl FnMut(&ServiceInstance) -> bool,
    ) -> usize {
        let mut downed = 0;

        for instance in self.groups.values_mut().flatten() {
            if instance.is_alive && predicate(instance) {
                instance.is_alive = false;
                downed += 1;
            }
        }

        downed
    }

    pub fn upsert_node(&mut self, info: NodeInfo) {
        let _previous = self.nodes.insert(info.node_id.clone(), info);
    }

    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&NodeInfo> {
        self.nodes.get(node_id)
    }

    /// Where a node sits; the origin when the registry has never heard of it.
    #[must_use]
    pub fn node_location(&self, node_id: &str) -> Location {
        self.nodes
            .get(node_id)
            .map_or_else(Location::default, NodeInfo::location)
    }

    /// One digest per group, in enumeration order: the leaf run the hash
    /// tree is built over.
    ///
    /// A record digests as `name || instance_id || node_id || alive byte`
    /// through the mixer; a group digests as the concatenation of its record
    /// digests in canonical instance order.
    #[must_use]
    pub fn group_digests(&self, hasher: &dyn Hasher) -> Vec<(String, Digest)> {
        self.groups
            .iter()
            .map(|(name, instances)| {
                let mut bytes = Vec::with_capacity(instances.len() * Digest::LEN);
                for instance in instances {
                    bytes.extend_from_slice(record_digest(instance, hasher).as_bytes());
                }
                (name.clone(), hasher.digest(&bytes))
            })
            .collect()
    }
}

/// The third dot segment of a queried name, if it has one.
fn lookup_key(service_name: &str) -> Option<&str> {
    service_name.split('.').nth(2)
}

fn canonical_key(instance: &ServiceInstance) -> (&str, &str) {
    (&instance.node_id, &instance.instance_id)
}

/// Insert preserving canonical order; an existing record under the same key
/// is replaced.
fn insert_canonical(group: &mut Vec<ServiceInstance>, instance: ServiceInstance) {
    match group.binary_search_by(|probe| canonical_key(probe).cmp(&canonical_key(&instance))) {
        Ok(at) => group[at] = instance,
        Err(at) => group.insert(at, instance),
    }
}

fn record_digest(instance: &ServiceInstance, hasher: &dyn Hasher) -> Digest {
    let mut bytes = Vec::with_capacity(
        instance.service_name.len() + instance.instance_id.len() + instance.node_id.len() + 1,
    );
    bytes.extend_from_slice(instance.service_name.as_bytes());
    bytes.extend_from_slice(instance.instance_id.as_bytes());
    bytes.extend_from_slice(instance.node_id.as_bytes());
    bytes.push(u8::from(instance.is_alive));
    hasher.digest(&bytes)
}

/// Hyphenated RFC 4122 form only: 36 chars, version 1 through 5, RFC variant.
fn is_valid_instance_id(instance_id: &str) -> bool {
    if instance_id.len() != 36 {
        return false;
    }

    let Ok(uuid) = Uuid::try_parse(instance_id) else {
        return false;
    };

    matches!(uuid.get_version_num(), 1..=5) && uuid.get_variant() == Variant::RFC4122
}

fn planar_distance(from: &Location, to: &Location) -> f64 {
    let dlat = from.latitude - to.latitude;
    let dlon = from.longitude - to.longitude;
    (dlat * dlat + dlon * dlon).sqrt()
}
