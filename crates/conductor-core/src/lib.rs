//! Core types and error definitions for the Conductor orchestration core.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the error taxonomy and the message envelope exchanged between
//! agents.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for every orchestration subsystem.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`Message`]: A single agent-to-agent message on the bus.
//! - [`MessageKind`]: Request, response, notification or broadcast.
//! - [`Priority`]: Urgency shared by tasks and messages.

/// Error taxonomy.
pub mod error;
/// Agent-to-agent message envelope.
pub mod message;

pub use error::{ConductorError, ConductorResult};
pub use message::{Message, MessageKind, Priority};
