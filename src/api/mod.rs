//! Client for the church dashboard REST API.

mod cached_client;
mod client;
mod error;
mod keys;

pub use cached_client::CachedApiClient;
pub use client::ApiClient;
pub use error::ApiError;
pub use keys::DashboardKey;
