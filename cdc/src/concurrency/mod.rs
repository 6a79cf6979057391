//! Coordination primitives shared by the reader and dispatcher workers.
//!
//! The [`shutdown`] channel is broadcast to every worker, and the [`queue`] carries decoded
//! rows from the reader thread to the dispatcher task with backpressure.

pub mod queue;
pub mod shutdown;
