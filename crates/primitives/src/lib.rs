//! Shared data model for the flotilla service registry.

pub mod digest;
pub mod messages;
pub mod node;
pub mod service;
