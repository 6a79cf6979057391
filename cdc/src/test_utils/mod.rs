//! Helpers for testing pipelines and listeners without a database or a Redis server.
//!
//! - [`weather`] builds rows of the weather table and an in-memory log holding them.
//! - [`broker`] wraps a [`crate::bus::Broker`] to record operations and inject failures.
//! - [`notify`] waits on test conditions with a timeout.

pub mod broker;
pub mod notify;
pub mod weather;
