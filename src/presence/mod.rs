//! Node liveness: what a node says about itself and what routers make of it.

pub mod record;
pub mod reporter;
pub mod tracker;

pub use record::{HealthState, PresenceRecord};
pub use reporter::{PresenceReporter, jittered};
pub use tracker::{NodeView, PresenceTracker};
