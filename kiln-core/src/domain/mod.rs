//! Core domain types
//!
//! These types describe a build request and everything derived from it.
//! They are shared between the worker (which executes tasks) and the CLI
//! (which submits them).

pub mod disposition;
pub mod layout;
pub mod stage;
pub mod task;
