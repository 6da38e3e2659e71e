use borsh::{BorshDeserialize, BorshSerialize};

use crate::service::{ServiceDescriptor, ServiceInstance};

/// Everything a registry replica can be asked to do, as one closed set.
///
/// Handlers match on this exhaustively, so adding a request kind is a
/// compile-time event for every dispatch site rather than a stringly-typed
/// fallthrough.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum RegistryRequest {
    /// Look up the best alive instance for a service name.
    Find(FindServiceRequest),
    /// Register (or re-register) one instance.
    Register(ServiceInstance),
    /// Remove every instance matching a `(service_name, instance_id)` pair.
    Deregister(ServiceDeregisterRequest),
    /// Mark an instance alive, addressed by instance id alone.
    Heartbeat(HeartbeatRequest),
}

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct FindServiceRequest {
    pub service_name: String,
    pub descriptor: ServiceDescriptor,
}

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct ServiceDeregisterRequest {
    pub service_name: String,
    pub instance_id: String,
}

#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct HeartbeatRequest {
    pub instance_id: String,
}

/// Payload of a [`RegistryResponse`].
#[derive(Clone, Debug, Default, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum ResponseBody {
    #[default]
    None,
    Service(ServiceInstance),
}

/// The reply to one [`RegistryRequest`], correlated by `seq`.
#[derive(Clone, Debug, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct RegistryResponse {
    pub seq: u64,
    pub status: u16,
    /// Failure detail, or a short acknowledgement on bodyless successes.
    pub error: String,
    pub body: ResponseBody,
}

impl RegistryResponse {
    pub const SUCCESS: u16 = 200;
    pub const UNAUTHORIZED: u16 = 401;
    pub const NOT_FOUND: u16 = 404;
    pub const ERROR: u16 = 500;

    #[must_use]
    pub fn success(seq: u64, body: ResponseBody) -> Self {
        Self {
            seq,
            status: Self::SUCCESS,
            error: String::new(),
            body,
        }
    }

    /// A bodyless success carrying an acknowledgement message.
    #[must_use]
    pub fn success_message(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            status: Self::SUCCESS,
            error: message.into(),
            body: ResponseBody::None,
        }
    }

    #[must_use]
    pub fn failure(seq: u64, status: u16, error: impl Into<String>) -> Self {
        Self {
            seq,
            status,
            error: error.into(),
            body: ResponseBody::None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}
