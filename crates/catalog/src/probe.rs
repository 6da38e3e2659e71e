use rand::Rng;

/// Supplies the response-time scores behind the fastest-instance selection
/// mode.
///
/// The catalog takes the probe as a collaborator so hosts and tests can
/// substitute real measurements or fixed tables.
pub trait PerformanceProbe: Send + Sync {
    /// Response time for one instance, in milliseconds.
    fn response_time_ms(&self, instance_id: &str) -> f64;
}

/// Stands in for measurement infrastructure by sampling a uniform
/// 50 to 150 ms response time on every call.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimulatedProbe;

impl PerformanceProbe for SimulatedProbe {
    fn response_time_ms(&self, _instance_id: &str) -> f64 {
        rand::thread_rng().gen_range(50.0..150.0)
    }
}
