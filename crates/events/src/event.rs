/// A domain event emitted by an aggregate.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **append-only**
/// - free of stream identity: aggregate id, version, agent and time travel in
///   [`EventMetadata`](sourcekit_core::EventMetadata), never in the payload.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. `"fabric.renamed"`), stored next to the payload.
    fn event_type(&self) -> &'static str;
}
