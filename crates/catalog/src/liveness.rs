use crate::ServiceCatalog;

/// Decides which instances have gone stale.
///
/// The core never schedules wall-clock expiry on its own: hosts install a
/// policy and run the sweep at whatever cadence suits them, typically from
/// the same loop that drives synchronization.
pub trait LivenessPolicy: Send {
    /// Mark expired instances dead, answering how many were downed.
    fn sweep(&mut self, catalog: &mut ServiceCatalog) -> usize;
}

/// The default policy: every record stays alive until explicitly
/// deregistered or downed by a peer's merge.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoExpiry;

impl LivenessPolicy for NoExpiry {
    fn sweep(&mut self, _catalog: &mut ServiceCatalog) -> usize {
        0
    }
}
