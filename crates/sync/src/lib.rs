//! Anti-entropy synchronization between registry replicas.
//!
//! [`engine::SyncEngine`] pairs a service catalog with the hash tree built
//! over it and exposes the three operations a peer round is made of:
//! compare trees, export owned records for the divergent groups, and merge
//! the peer's batch. [`wire`] carries the record batches between replicas.

pub mod engine;
pub mod wire;
