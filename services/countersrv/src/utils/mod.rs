//! Shared utilities for the counter collection service.

pub mod error;

pub use error::{CounterSrvError, Result};
