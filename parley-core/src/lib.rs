//! Core types and traits for parley
//!
//! This crate provides the conversation data model, citation aggregation,
//! session persistence, configuration and logging used by the other
//! parley crates.

pub mod bus;
pub mod config;
pub mod error;
pub mod grounding;
pub mod logging;
pub mod session;
pub mod utils;

pub use error::{Error, Result};
