//! Sequent Core: shared data model and contracts.
//!
//! This crate defines the aggregate, event, command and snapshot types, the
//! storage and transport traits, the error taxonomy and the engine
//! configuration. It contains no infrastructure code.

pub mod aggregate;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod snapshot;
pub mod store;
pub mod transport;
