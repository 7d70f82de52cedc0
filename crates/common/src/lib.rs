//! Common types shared by the key pool library and the gateway service

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, redact};
