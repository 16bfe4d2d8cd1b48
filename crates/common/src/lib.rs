//! Common types for the Power Platform API workspace
//!
//! Holds the pieces every other crate needs: the redacting `Secret` wrapper,
//! the configuration error type, and the provider configuration itself.

pub mod config;
mod error;
mod secret;

pub use config::{
    AuthSettings, Cloud, CloudConfig, Config, LroSettings, RetrySettings, TimeoutSettings,
};
pub use error::{Error, Result};
pub use secret::{REDACTED, Secret};
