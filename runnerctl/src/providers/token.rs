use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::providers::provider::ProviderError;

pub const GCE_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

pub const AZURE_IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token?api-version=2018-02-01&resource=https://management.azure.com/";

/// Refresh this long before the metadata server says the token expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds. GCE sends a number, Azure IMDS sends a string.
    #[serde(default)]
    expires_in: Option<Value>,
}

impl TokenResponse {
    fn lifetime(&self) -> Duration {
        let secs = match &self.expires_in {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        Duration::from_secs(secs.unwrap_or(0))
    }
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Bearer token from the platform's instance metadata endpoint.
pub struct MetadataToken {
    http: reqwest::Client,
    url: String,
    header: (&'static str, &'static str),
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataToken {
    pub fn gce(http: reqwest::Client) -> Self {
        Self::new(http, GCE_METADATA_TOKEN_URL, ("Metadata-Flavor", "Google"))
    }

    pub fn azure_imds(http: reqwest::Client) -> Self {
        Self::new(http, AZURE_IMDS_TOKEN_URL, ("Metadata", "true"))
    }

    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        header: (&'static str, &'static str),
    ) -> Self {
        Self {
            http,
            url: url.into(),
            header,
            cached: Mutex::new(None),
        }
    }

    async fn bearer(&self) -> Result<String, ProviderError> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if Instant::now() < c.refresh_at {
                return Ok(c.token.clone());
            }
        }

        let response = self
            .http
            .get(&self.url)
            .header(self.header.0, self.header.1)
            .send()
            .await
            .map_err(|e| ProviderError::Token(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Token(format!("{status}: {body}")));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Token(e.to_string()))?;

        let lifetime = token.lifetime();
        debug!(lifetime_secs = lifetime.as_secs(), "fetched access token");
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        });
        Ok(token.access_token)
    }
}

/// Where a cloud adapter gets its API bearer token.
pub enum TokenSource {
    Static(String),
    Metadata(MetadataToken),
}

impl TokenSource {
    pub async fn bearer(&self) -> Result<String, ProviderError> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::Metadata(m) => m.bearer().await,
        }
    }
}
