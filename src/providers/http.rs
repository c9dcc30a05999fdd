//! Shared HTTP plumbing for provider adapters
//!
//! Every adapter receives a [`ProviderContext`] at construction: the shared
//! `reqwest::Client`, its base URL, credentials and call timeout.

use std::fmt;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;

use super::ProviderError;

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    /// `Authorization: Bearer <secret_key>`
    Bearer { secret_key: String },
    /// `api-key` / `secret-key` header pair
    ApiKeys { api_key: String, secret_key: String },
    /// OAuth2 client-credentials grant
    ClientCredentials {
        client_id: String,
        client_secret: String,
        auth_url: String,
        audience: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Bearer { .. } => f.write_str("Bearer(***)"),
            Credentials::ApiKeys { api_key, .. } => write!(f, "ApiKeys({}, ***)", api_key),
            Credentials::ClientCredentials {
                client_id,
                auth_url,
                ..
            } => write!(f, "ClientCredentials({} @ {}, ***)", client_id, auth_url),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderContext {
    client: Client,
    base_url: String,
    credentials: Credentials,
    timeout: Duration,
}

impl ProviderContext {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;
        Ok(Self::with_client(client, base_url, credentials, timeout))
    }

    /// Share one connection pool across adapters
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            timeout,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Read a JSON body, keeping 4xx bodies that carry a provider verdict.
///
/// 5xx, 429 and auth failures never carry a usable verdict and are errors.
pub(crate) async fn read_json<T: DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<(u16, T), ProviderError> {
    let status = resp.status().as_u16();
    let body = resp.text().await?;

    if status == 401 || status == 403 {
        return Err(ProviderError::Auth(format!("HTTP {}: {}", status, body)));
    }
    if status >= 500 || status == 429 {
        return Err(ProviderError::Http { status, body });
    }

    match serde_json::from_str::<T>(&body) {
        Ok(value) => Ok((status, value)),
        Err(_) if status >= 400 => Err(ProviderError::Http { status, body }),
        Err(e) => Err(ProviderError::Decode(format!("{}: {}", e, body))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let ctx = ProviderContext::new("https://api.example.com/v1/", Credentials::None, Duration::from_secs(5))
            .unwrap();
        assert_eq!(ctx.url("/transfer"), "https://api.example.com/v1/transfer");
        assert_eq!(ctx.url("bank/resolve"), "https://api.example.com/v1/bank/resolve");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::ApiKeys {
            api_key: "pk_live".into(),
            secret_key: "sk_live_very_secret".into(),
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("pk_live"));
        assert!(!printed.contains("very_secret"));
    }
}
