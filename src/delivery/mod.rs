//! Asynchronous file delivery: a persistent queue and its consumers.

pub mod queue;
pub mod worker;

pub use queue::{DeliveryJob, DeliveryQueue};
pub use worker::{DeliveryOutcome, DeliveryWorker, spawn_delivery_workers};
