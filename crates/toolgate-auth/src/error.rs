use thiserror::Error;

/// Structured auth failure signalled through the middleware pipeline.
///
/// The HTTP layer translates these into status-coded responses (401 with
/// `WWW-Authenticate` for the token variants, 403 for insufficient scope);
/// the stdio layer never sees them because auth is skipped without an HTTP
/// request. Messages never include token material.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken {
        resource_metadata_url: Option<String>,
    },

    #[error("Invalid bearer token")]
    InvalidToken {
        resource_metadata_url: Option<String>,
    },

    #[error("Insufficient scope: missing {}", .missing.join(", "))]
    InsufficientScope {
        missing: Vec<String>,
        resource_metadata_url: Option<String>,
    },
}

impl AuthError {
    pub fn resource_metadata_url(&self) -> Option<&str> {
        match self {
            AuthError::MissingToken {
                resource_metadata_url,
            }
            | AuthError::InvalidToken {
                resource_metadata_url,
            }
            | AuthError::InsufficientScope {
                resource_metadata_url,
                ..
            } => resource_metadata_url.as_deref(),
        }
    }

    /// RFC 6750 error code for the `WWW-Authenticate` challenge.
    pub fn bearer_error_code(&self) -> Option<&'static str> {
        match self {
            AuthError::MissingToken { .. } => None,
            AuthError::InvalidToken { .. } => Some("invalid_token"),
            AuthError::InsufficientScope { .. } => Some("insufficient_scope"),
        }
    }
}
