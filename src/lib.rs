// Error kinds
pub mod error;

// Supported marketplaces and their OAuth endpoints
pub mod marketplace;

// Configuration file, env overrides and the config provider seam
pub mod config;

// Credential encryption, storage and resolution
pub mod credentials;

// OAuth authorization-server client and CSRF state
pub mod oauth;

// Token lifecycle: valid-token access, refresh coalescing, linking
pub mod lifecycle;

pub use error::{Error, Result};
pub use lifecycle::{TokenLifecycleManager, TokenState};
pub use marketplace::Marketplace;
