// src/session/mod.rs

//! Session records and their lifecycle.
//!
//! - [`model`] defines the [`Session`] entity, its id and status types, and
//!   source validation.
//! - [`machine`] is the pure transition function over a session. It is the
//!   only code that changes `status`.

pub mod machine;
pub mod model;

pub use machine::{InvalidTransition, SessionEvent, Transition};
pub use model::{validate_source, Session, SessionId, SessionStatus};
