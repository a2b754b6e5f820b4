//! Bearer-token authentication for toolgate servers.
//!
//! The subsystem covers four tightly coupled concerns: bearer extraction from
//! the `Authorization` header, JWT verification against a remote JWKS, scope
//! sets carried on [`AuthInfo`], and a bounded TTL cache keyed by token
//! digest. Providers are abstracted behind [`AuthProvider`] so opaque-token
//! or API-key verifiers can slot in next to the JWT default.

mod bearer;
mod cache;
mod config;
mod error;
mod jwks;
mod jwt;
mod presets;
mod provider;
pub mod signing;

pub use bearer::extract_bearer;
pub use cache::{DEFAULT_TOKEN_TTL, MAX_CACHE_SIZE, TokenCache};
pub use config::{AuthSettings, ConfigError, ProviderKind, load_auth_settings};
pub use error::AuthError;
pub use jwks::JwksClient;
pub use jwt::{JwtAuthProvider, JwtProviderOptions};
pub use presets::{PresetOptions, auth0, github_actions, google, oidc};
pub use provider::{AuthEventSink, AuthInfo, AuthProvider, NoopEvents, ResourceMetadata};
