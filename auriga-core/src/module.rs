//! The worker contract every pipeline module implements.
//!
//! Modules never call each other directly — all communication goes through
//! the bus. The controller drives the lifecycle in registration order
//! (`initialize` → `start`), stops in reverse order, and fans every
//! published event out to `handle_event`.

use crate::error::Result;
use crate::event::Event;

/// A named worker attached to the system controller.
///
/// Implementations use interior mutability: the controller holds modules as
/// `Arc<dyn Module>` and may deliver events from any publisher thread.
/// Delivery to a single module is serialized by the bus, so `handle_event`
/// never runs concurrently with itself.
pub trait Module: Send + Sync {
    /// Stable module name, unique within a controller.
    fn name(&self) -> &str;

    /// Acquire resources (open engines, spawn nothing yet). An error here
    /// aborts system startup.
    fn initialize(&self) -> Result<()>;

    /// Begin doing work (spawn threads, open devices).
    fn start(&self) -> Result<()>;

    /// Stop doing work. Must be idempotent and must not panic.
    fn stop(&self);

    /// Release resources after stop. Default: nothing to release.
    fn cleanup(&self) {}

    /// Receive one bus event. Failures must be handled internally; the bus
    /// isolates panics but a well-behaved module never relies on that.
    fn handle_event(&self, event: &Event);

    fn is_running(&self) -> bool;
}
