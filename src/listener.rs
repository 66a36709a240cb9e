//! Observational hooks into pool lifecycle events.
//!
//! A single object-safe trait with default no-op methods, so a consumer
//! only overrides what it cares about. Installing a [`PoolListener`] is
//! optional; `tracing` diagnostics (see `pool::mod`) fire regardless of
//! whether one is installed.

/// Callbacks fired at the state transitions an operator is likely to care
/// about. None of these are load-bearing for correctness — they're purely
/// observational.
pub trait PoolListener: Send + Sync {
    /// A new connection was created and added to the live set.
    fn on_connection_created(&self, _address: &str, _connection_id: u32) {}

    /// A connection was moved from the live set into the trash (either
    /// because of a stream-ID leak or because of periodic shrink).
    fn on_connection_trashed(&self, _address: &str, _connection_id: u32) {}

    /// A trashed connection was pulled back into service.
    fn on_connection_resurrected(&self, _address: &str, _connection_id: u32) {}

    /// A connection reached the terminal `Gone` state.
    fn on_connection_gone(&self, _address: &str, _connection_id: u32) {}

    /// The pool has begun shutting down.
    fn on_pool_closing(&self, _address: &str) {}
}

/// The default listener: does nothing. Used when a [`crate::Pool`] is built
/// without an explicit listener.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl PoolListener for NoopListener {}
