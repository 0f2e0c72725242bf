//! Observer events for decoupled UI updates
//!
//! The conversation core publishes every visible change as a [`ChatEvent`]
//! on an unbounded channel so front ends can render incrementally without
//! sharing mutable state.

pub mod events;

pub use events::ChatEvent;

/// Sending half handed to the conversation core
pub type EventSender = tokio::sync::mpsc::UnboundedSender<ChatEvent>;
/// Receiving half owned by a front end
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<ChatEvent>;

/// Create a connected event channel
pub fn event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
