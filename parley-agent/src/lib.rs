//! Conversation orchestration for parley
//!
//! This crate provides the conversation controller, request context
//! building, failure classification and the session lifecycle.

pub mod context;
pub mod controller;
pub mod failure;
pub mod lifecycle;
pub mod persist;
pub mod state;

pub use context::ContextBuilder;
pub use controller::{derive_title, ConversationController, TurnOutcome};
pub use failure::FailureCategory;
pub use lifecycle::SessionLifecycle;
pub use parley_core::bus::ChatEvent;
pub use persist::Persister;
pub use state::{SessionRegistry, TurnToken};
