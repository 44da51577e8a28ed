//! Common types shared by the resilient API client crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
