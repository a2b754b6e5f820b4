use crate::jwt::JwtProviderOptions;

/// Options shared by every preset factory.
#[derive(Debug, Clone)]
pub struct PresetOptions {
    pub audience: String,
    pub resource: String,
    pub scopes_supported: Vec<String>,
}

/// Google OIDC. Google publishes its JWKS at a fixed, non-derived location.
pub fn google(opts: PresetOptions) -> JwtProviderOptions {
    let issuer = "https://accounts.google.com".to_string();
    JwtProviderOptions {
        authorization_servers: vec![issuer.clone()],
        issuer,
        audience: opts.audience,
        resource: opts.resource,
        jwks_uri: Some("https://www.googleapis.com/oauth2/v3/certs".to_string()),
        scopes_supported: opts.scopes_supported,
    }
}

/// GitHub Actions OIDC tokens.
pub fn github_actions(opts: PresetOptions) -> JwtProviderOptions {
    let issuer = "https://token.actions.githubusercontent.com".to_string();
    JwtProviderOptions {
        authorization_servers: vec![issuer.clone()],
        jwks_uri: Some(format!("{issuer}/.well-known/jwks")),
        issuer,
        audience: opts.audience,
        resource: opts.resource,
        scopes_supported: opts.scopes_supported,
    }
}

/// Auth0 tenant: issuer is `https://{domain}/` and the JWKS hangs off it.
pub fn auth0(domain: &str, opts: PresetOptions) -> JwtProviderOptions {
    let issuer = format!("https://{domain}/");
    JwtProviderOptions {
        authorization_servers: vec![issuer.clone()],
        jwks_uri: Some(format!("{issuer}.well-known/jwks.json")),
        issuer,
        audience: opts.audience,
        resource: opts.resource,
        scopes_supported: opts.scopes_supported,
    }
}

/// Generic OIDC issuer; the JWKS location is derived from the issuer unless
/// explicitly overridden later.
pub fn oidc(issuer: &str, opts: PresetOptions) -> JwtProviderOptions {
    JwtProviderOptions {
        issuer: issuer.to_string(),
        authorization_servers: vec![issuer.to_string()],
        audience: opts.audience,
        resource: opts.resource,
        jwks_uri: None,
        scopes_supported: opts.scopes_supported,
    }
}
