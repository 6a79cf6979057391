//! Change data capture from a Postgres replication log to a pub/sub event bus.
//!
//! A [`pipeline::Pipeline`] runs the replication reader on a dedicated thread and hands
//! decoded rows through a bounded queue to the dispatcher, which holds them back until the
//! initial load is detected and then publishes them on the bus. Downstream services use
//! [`readiness::ReadinessGate`] and [`listener::ChangeListener`] to consume the published
//! changes.

pub mod backfill;
pub mod bus;
pub mod concurrency;
pub mod error;
mod macros;
pub mod listener;
pub mod mapping;
pub mod pipeline;
pub mod readiness;
pub mod source;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
