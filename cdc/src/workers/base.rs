use std::future::Future;

use crate::error::EtlResult;

/// Trait for the background workers of a pipeline.
///
/// Starting a worker returns a handle `H` exposing its state `S` and its completion.
pub trait Worker<H, S>
where
    H: WorkerHandle<S>,
{
    /// Error type returned when worker startup fails.
    type Error;

    /// Starts the worker and returns a handle once it is running.
    fn start(self) -> impl Future<Output = Result<H, Self::Error>> + Send;
}

/// Handle to a running worker.
pub trait WorkerHandle<S> {
    /// Returns a snapshot of the worker state.
    ///
    /// The snapshot may be stale by the time it is inspected.
    fn state(&self) -> S;

    /// Waits for the worker to complete. The handle is consumed.
    fn wait(self) -> impl Future<Output = EtlResult<()>> + Send;
}
