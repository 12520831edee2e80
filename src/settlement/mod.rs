// Settlement reconciliation - in-flight taker orders to terminal states
pub mod reconciler;
pub mod scheduler;

pub use reconciler::{Reconciler, ReconcilerConfig, ReconciliationReport};
pub use scheduler::{ReconciliationScheduler, SchedulerHandle};
