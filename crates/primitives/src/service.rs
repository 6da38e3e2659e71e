use borsh::{BorshDeserialize, BorshSerialize};

use crate::node::Location;

/// Selection mode: score candidates by planar distance to the requester.
pub const MODE_NEAREST: u8 = 0;
/// Selection mode: score candidates by probed response time.
pub const MODE_FASTEST: u8 = 1;

/// One provider endpoint of a service group.
///
/// `service_name` is the group key exactly as registered (lookups address
/// it through the third segment of a dotted query name), `instance_id` an
/// RFC 4122 UUID string and `node_id` the identifier of the node the
/// instance runs on.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub node_id: String,
    pub is_alive: bool,
}

/// What a lookup wants: how to score candidates and from where.
#[derive(Clone, Debug, Default, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ServiceDescriptor {
    /// [`MODE_NEAREST`] or [`MODE_FASTEST`]; anything else is rejected at
    /// lookup time.
    pub mode: u8,
    pub location: Location,
}
