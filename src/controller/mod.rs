pub mod analysis;
pub mod clock;
pub mod events;
pub mod experiment;
pub mod metricproviders;
pub mod rollout;
pub mod strategies;
pub mod trafficrouting;

pub use rollout::{reconcile, Context, ReconcileError};
