//! Base runner trait implemented by every task in a flow.

/// Lifecycle contract for tasks.
///
/// `init` performs all fallible setup (client construction, authentication,
/// route registration) and yields the handler that does per-event work.
/// `run` owns the task: it retries `init` per the task's retry policy and
/// then drives the handler until the input channel closes or, for source
/// tasks, until registration is complete.
#[async_trait::async_trait]
pub trait Runner {
    /// Task error type.
    type Error;
    /// Handler produced by successful initialization.
    type EventHandler;

    /// Performs setup and returns the event handler.
    async fn init(&self) -> Result<Self::EventHandler, Self::Error>;

    /// Consumes the task and runs it to completion.
    async fn run(self) -> Result<(), Self::Error>;
}
