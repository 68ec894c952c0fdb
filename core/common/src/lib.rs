//! Common utilities and types shared across the key/IV cache crates.
//!
//! This module provides the error taxonomy surfaced by every layer and a
//! zeroizing byte wrapper for sensitive material.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::SensitiveBytes;
