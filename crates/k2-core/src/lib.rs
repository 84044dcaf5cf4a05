//! k2-core - Core types for K2/TimeProvider timing appliances
//!
//! This crate holds the closed enumerations and data records shared by the
//! device client and the CLI. Nothing in here performs I/O.

pub mod error;
pub mod models;

pub use error::{ModelError, ModelResult};
pub use models::*;
