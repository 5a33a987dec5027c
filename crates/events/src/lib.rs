//! Domain events and the post-commit publishing seam.
//!
//! Events are appended to the event store first; publishing through an
//! [`EventBus`] happens afterwards and is best-effort.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::{EventEnvelope, JsonEventEnvelope};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus, NoopBus};
