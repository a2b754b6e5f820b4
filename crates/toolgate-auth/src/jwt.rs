use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::cache::TokenCache;
use crate::jwks::JwksClient;
use crate::provider::{AuthEventSink, AuthInfo, AuthProvider, NoopEvents, ResourceMetadata};

const JWKS_REFRESH_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct JwtProviderOptions {
    /// Required `iss` claim.
    pub issuer: String,
    /// Required `aud` claim.
    pub audience: String,
    /// The protected resource this server guards.
    pub resource: String,
    /// Advertised in RFC 9728 metadata; defaults to `[issuer]` when empty.
    pub authorization_servers: Vec<String>,
    /// Explicit JWKS location; derived from the issuer when unset.
    pub jwks_uri: Option<String>,
    pub scopes_supported: Vec<String>,
}

impl JwtProviderOptions {
    fn effective_jwks_uri(&self) -> String {
        match &self.jwks_uri {
            Some(uri) => uri.clone(),
            None => format!(
                "{}/.well-known/jwks.json",
                self.issuer.trim_end_matches('/')
            ),
        }
    }
}

/// The default [`AuthProvider`]: JWKS-backed JWT verification with a bounded
/// token cache. Every verification failure collapses to `None`; callers never
/// learn whether the signature, expiry, issuer, or audience was at fault.
pub struct JwtAuthProvider {
    opts: JwtProviderOptions,
    jwks: JwksClient,
    cache: TokenCache,
    events: Arc<dyn AuthEventSink>,
}

impl JwtAuthProvider {
    pub fn new(opts: JwtProviderOptions) -> anyhow::Result<Self> {
        let uri = Url::parse(&opts.effective_jwks_uri()).context("parse jwks uri")?;
        Ok(Self {
            opts,
            jwks: JwksClient::new(uri, JWKS_REFRESH_TTL)?,
            cache: TokenCache::new(),
            events: Arc::new(NoopEvents),
        })
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn AuthEventSink>) -> Self {
        self.events = sink;
        self
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.len()
    }

    async fn verify_jwt(&self, token: &str) -> Option<AuthInfo> {
        let header = jsonwebtoken::decode_header(token).ok()?;

        let keys = self.jwks.key_set().await.ok()?;
        let jwk = match header.kid.as_deref() {
            Some(kid) => match keys.find(kid) {
                Some(jwk) => jwk.clone(),
                None => {
                    // Unknown kid: the signing key may have rotated since the
                    // last fetch.
                    let keys = self.jwks.refresh().await.ok()?;
                    keys.find(kid)?.clone()
                }
            },
            None => keys.keys.first()?.clone(),
        };

        // The server picks the verification algorithm from the key, never
        // from the token header.
        let expected = pinned_algorithm(&jwk)?;
        if header.alg != expected {
            return None;
        }

        let decoding = DecodingKey::from_jwk(&jwk).ok()?;
        let mut validation = Validation::new(expected);
        validation.set_issuer(&[self.opts.issuer.as_str()]);
        validation.set_audience(&[self.opts.audience.as_str()]);

        let data = jsonwebtoken::decode::<Value>(token, &decoding, &validation).ok()?;
        Some(auth_info_from_claims(data.claims))
    }
}

/// Verification algorithm pinned by the matched JWK: its declared `alg`
/// when present, else the key family. A token whose header disagrees is
/// rejected before any cryptographic check (RFC 8725 §3.1).
fn pinned_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    if let Some(declared) = jwk.common.key_algorithm {
        return signing_algorithm(declared);
    }
    match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(params) => match params.curve {
            EllipticCurve::P256 => Some(Algorithm::ES256),
            EllipticCurve::P384 => Some(Algorithm::ES384),
            _ => None,
        },
        AlgorithmParameters::OctetKeyPair(params) => match params.curve {
            EllipticCurve::Ed25519 => Some(Algorithm::EdDSA),
            _ => None,
        },
        AlgorithmParameters::OctetKey(_) => Some(Algorithm::HS256),
    }
}

fn signing_algorithm(declared: KeyAlgorithm) -> Option<Algorithm> {
    match declared {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        // Encryption algorithms never verify signatures.
        _ => None,
    }
}

#[async_trait]
impl AuthProvider for JwtAuthProvider {
    async fn verify_token(&self, token: &str) -> anyhow::Result<Option<AuthInfo>> {
        let key = TokenCache::key_for(token);

        if let Some(hit) = self.cache.get(&key) {
            self.events.on_cache_hit();
            return Ok(Some((*hit).clone()));
        }

        match self.verify_jwt(token).await {
            Some(info) => {
                self.events.on_verify();
                let info = Arc::new(info);
                self.cache.insert(key, info.clone());
                Ok(Some((*info).clone()))
            }
            None => {
                debug!("bearer token rejected");
                self.events.on_reject();
                Ok(None)
            }
        }
    }

    fn resource_metadata(&self) -> ResourceMetadata {
        let authorization_servers = if self.opts.authorization_servers.is_empty() {
            vec![self.opts.issuer.clone()]
        } else {
            self.opts.authorization_servers.clone()
        };
        ResourceMetadata {
            resource: self.opts.resource.clone(),
            authorization_servers,
            scopes_supported: self.opts.scopes_supported.clone(),
        }
    }
}

/// Map a verified JWT payload onto [`AuthInfo`].
///
/// `sub` falls back to the literal `"unknown"`; `azp` wins over `client_id`;
/// scopes come from a space-delimited `scope` string (empties filtered) or an
/// `scp` string array.
fn auth_info_from_claims(payload: Value) -> AuthInfo {
    let subject = payload
        .get("sub")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let client_id = payload
        .get("azp")
        .or_else(|| payload.get("client_id"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let scopes = if let Some(scope) = payload.get("scope").and_then(|v| v.as_str()) {
        scope
            .split(' ')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    } else if let Some(scp) = payload.get("scp").and_then(|v| v.as_array()) {
        scp.iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let expires_at = payload.get("exp").and_then(|v| v.as_u64());

    AuthInfo {
        subject,
        client_id,
        scopes,
        claims: payload,
        expires_at,
    }
}
