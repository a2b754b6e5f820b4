use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use jsonwebtoken::jwk::JwkSet;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

struct CachedKeys {
    fetched_at: Instant,
    keys: Arc<JwkSet>,
}

/// Long-lived JWKS fetcher with its own TTL cache.
///
/// One instance is shared across all verifications of a provider; the remote
/// document is refetched at most once per TTL window, plus an explicit
/// `refresh` used when a key id is not found (rotation).
pub struct JwksClient {
    http: reqwest::Client,
    uri: Url,
    ttl: Duration,
    cached: Mutex<Option<CachedKeys>>,
}

impl JwksClient {
    pub fn new(uri: Url, ttl: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build jwks http client")?;
        Ok(Self {
            http,
            uri,
            ttl,
            cached: Mutex::new(None),
        })
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub async fn key_set(&self) -> anyhow::Result<Arc<JwkSet>> {
        {
            let guard = self.cached.lock().await;
            if let Some(c) = guard.as_ref()
                && c.fetched_at.elapsed() < self.ttl
            {
                return Ok(c.keys.clone());
            }
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> anyhow::Result<Arc<JwkSet>> {
        let resp = self
            .http
            .get(self.uri.clone())
            .header("accept", "application/json")
            .send()
            .await
            .context("fetch jwks")?;
        if !resp.status().is_success() {
            anyhow::bail!("jwks status {}", resp.status());
        }
        let keys: JwkSet = resp.json().await.context("decode jwks")?;
        let keys = Arc::new(keys);

        debug!(uri = %self.uri, keys = keys.keys.len(), "jwks refreshed");

        *self.cached.lock().await = Some(CachedKeys {
            fetched_at: Instant::now(),
            keys: keys.clone(),
        });
        Ok(keys)
    }
}
