//! Kiln Core
//!
//! Core types shared by the Kiln build worker and the operator CLI.
//!
//! This crate contains:
//! - Build tasks: the payload carried by queue messages
//! - Run layout: deterministic local paths and result keys for one run
//! - Stage and disposition vocabulary used by the task pipeline

pub mod domain;
