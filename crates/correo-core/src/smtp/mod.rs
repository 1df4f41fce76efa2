//! Outbound SMTP delivery module

mod courier;
mod queue;

pub use courier::{plan_targets, Courier, Deliver, DeliveryPlan, Envelope};
pub use queue::{QueueManager, QueuedJob};
