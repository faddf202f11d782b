//! Credential lifecycle: token persistence and single-flight refresh.

pub mod refresh;
pub mod tokens;

pub use refresh::{ForceLogoutCallback, RefreshCoordinator, RefreshPhase};
pub use tokens::{CredentialPair, TokenStore};
