use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::jwt::JwtProviderOptions;
use crate::presets::{self, PresetOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Github,
    Google,
    Auth0,
    Oidc,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::Github),
            "google" => Ok(Self::Google),
            "auth0" => Ok(Self::Auth0),
            "oidc" => Ok(Self::Oidc),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown auth provider: {0}")]
    UnknownProvider(String),

    #[error("auth config missing audience")]
    MissingAudience,

    #[error("auth config missing resource")]
    MissingResource,

    #[error("auth provider auth0 requires a domain")]
    MissingDomain,

    #[error("auth provider oidc requires an issuer")]
    MissingIssuer,

    #[error("read auth config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("parse auth config {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Validated auth configuration merged from environment and YAML.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub provider: ProviderKind,
    pub audience: String,
    pub resource: String,
    pub domain: Option<String>,
    pub issuer: Option<String>,
    pub jwks_uri: Option<String>,
    pub scopes_supported: Vec<String>,
}

impl AuthSettings {
    pub fn into_provider_options(self) -> JwtProviderOptions {
        let preset = PresetOptions {
            audience: self.audience,
            resource: self.resource,
            scopes_supported: self.scopes_supported,
        };
        let mut opts = match self.provider {
            ProviderKind::Github => presets::github_actions(preset),
            ProviderKind::Google => presets::google(preset),
            ProviderKind::Auth0 => {
                // Validated at load time.
                let domain = self.domain.unwrap_or_default();
                presets::auth0(&domain, preset)
            }
            ProviderKind::Oidc => {
                let issuer = self.issuer.clone().unwrap_or_default();
                presets::oidc(&issuer, preset)
            }
        };
        if let Some(uri) = self.jwks_uri {
            opts.jwks_uri = Some(uri);
        }
        opts
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthFileSection {
    provider: Option<String>,
    audience: Option<String>,
    resource: Option<String>,
    domain: Option<String>,
    issuer: Option<String>,
    jwks_uri: Option<String>,
    #[serde(default)]
    scopes_supported: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AuthFile {
    auth: Option<AuthFileSection>,
}

const ENV_KEYS: [&str; 7] = [
    "MCP_AUTH_PROVIDER",
    "MCP_AUTH_AUDIENCE",
    "MCP_AUTH_RESOURCE",
    "MCP_AUTH_DOMAIN",
    "MCP_AUTH_ISSUER",
    "MCP_AUTH_JWKS_URI",
    "MCP_AUTH_SCOPES",
];

/// Load auth settings from `MCP_AUTH_*` environment variables and an optional
/// YAML file. Merge priority is environment > YAML; when neither names a
/// provider, auth is simply disabled (`Ok(None)`). A missing file is not an
/// error. Validation is fail-fast with a distinct error per defect.
pub fn load_auth_settings(path: Option<&Path>) -> Result<Option<AuthSettings>, ConfigError> {
    let mut env = HashMap::new();
    for key in ENV_KEYS {
        if let Ok(v) = std::env::var(key)
            && !v.trim().is_empty()
        {
            env.insert(key, v);
        }
    }

    let yaml = match path {
        Some(p) if p.exists() => {
            let text = std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
                path: p.display().to_string(),
                source,
            })?;
            let file: AuthFile =
                serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
                    path: p.display().to_string(),
                    source,
                })?;
            file.auth
        }
        _ => None,
    };

    settings_from_sources(&env, yaml)
}

fn settings_from_sources(
    env: &HashMap<&str, String>,
    yaml: Option<AuthFileSection>,
) -> Result<Option<AuthSettings>, ConfigError> {
    let yaml = yaml.unwrap_or_default();

    let pick = |env_key: &str, yaml_value: &Option<String>| -> Option<String> {
        env.get(env_key).cloned().or_else(|| yaml_value.clone())
    };

    let Some(provider_raw) = pick("MCP_AUTH_PROVIDER", &yaml.provider) else {
        return Ok(None);
    };
    let provider = provider_raw.parse::<ProviderKind>()?;

    let audience = pick("MCP_AUTH_AUDIENCE", &yaml.audience).ok_or(ConfigError::MissingAudience)?;
    let resource = pick("MCP_AUTH_RESOURCE", &yaml.resource).ok_or(ConfigError::MissingResource)?;
    let domain = pick("MCP_AUTH_DOMAIN", &yaml.domain);
    let issuer = pick("MCP_AUTH_ISSUER", &yaml.issuer);
    let jwks_uri = pick("MCP_AUTH_JWKS_URI", &yaml.jwks_uri);

    if provider == ProviderKind::Auth0 && domain.is_none() {
        return Err(ConfigError::MissingDomain);
    }
    if provider == ProviderKind::Oidc && issuer.is_none() {
        return Err(ConfigError::MissingIssuer);
    }

    let scopes_supported = match env.get("MCP_AUTH_SCOPES") {
        Some(raw) => raw
            .split(' ')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => yaml.scopes_supported.unwrap_or_default(),
    };

    Ok(Some(AuthSettings {
        provider,
        audience,
        resource,
        domain,
        issuer,
        jwks_uri,
        scopes_supported,
    }))
}
