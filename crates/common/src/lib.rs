//! Common utilities and types shared across the liveness crates.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
