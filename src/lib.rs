//! Client-side resilience layer for API consumers.
//!
//! - [`http::RequestPipeline`]: every outbound call passes through here; it
//!   attaches identity headers and idempotency keys, unwraps the response
//!   envelope and recovers from expired access tokens
//! - [`auth::RefreshCoordinator`]: at most one token refresh in flight, with
//!   every blocked caller replayed once it settles
//! - [`cache::CacheStore`] / [`cache::CacheLayer`]: two-tier TTL cache and
//!   cache-first reads on top of it
//!
//! [`Client`] wires these together from a [`Config`].

pub mod auth;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ids;
pub mod logging;
pub mod storage;

pub use client::Client;
pub use config::Config;
pub use error::ApiError;
