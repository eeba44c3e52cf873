pub mod registry;

pub use registry::{BreakerCheck, CircuitState, HealthRegistry, UpstreamHealthView};
