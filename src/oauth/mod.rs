//! OAuth credential management for outbound integrations
//!
//! - [`manager`]: token lifecycle with single-flight refresh
//! - [`providers`]: provider-specific request shapes and defaults
//! - [`state`]: random values for the consent flow

pub mod manager;
pub mod providers;
pub mod state;

pub use manager::{CallbackParams, OAuthManager};
pub use providers::ProviderRegistration;
