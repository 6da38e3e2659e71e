use borsh::{BorshDeserialize, BorshSerialize};

/// A position on the planar coordinate grid the registry scores distances on.
///
/// The default (the origin, empty region) doubles as the answer for a node
/// the registry knows nothing about.
#[derive(Clone, Debug, Default, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub region: String,
}

/// Catalog-level metadata for one registry node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
    pub node_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub region: String,
}

impl NodeInfo {
    #[must_use]
    pub fn location(&self) -> Location {
        Location {
            latitude: self.latitude,
            longitude: self.longitude,
            region: self.region.clone(),
        }
    }
}
