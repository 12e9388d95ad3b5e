//! JSON-over-HTTP provider client.
//!
//! Resources live under `{endpoint}/resources/{type}[/{id}]` and secrets
//! under `{endpoint}/secrets/{id}`. Calls are made once; throttling and
//! failures are reported to the caller as-is.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::resource::Outputs;

use super::{Created, Provider, ProviderResult, SecretStore};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL.
    endpoint: Url,
    /// Optional bearer token.
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    inputs: &'a Value,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    inputs: &'a Value,
}

#[derive(Debug, Deserialize)]
struct OutputsResponse {
    #[serde(default)]
    outputs: Outputs,
}

#[derive(Debug, Serialize, Deserialize)]
struct SecretBody {
    value: String,
}

impl HttpProvider {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid base URL or the HTTP
    /// client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> ProviderResult<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid base URL or the HTTP
    /// client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> ProviderResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ProviderError::network(format!("Invalid provider endpoint '{endpoint}': {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(ProviderError::network(format!(
                "Provider endpoint '{endpoint}' cannot be used as a base URL"
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    /// Builds a URL from path segments, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> ProviderResult<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| ProviderError::network("Provider endpoint cannot be a base URL"))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends a request once and maps transport errors.
    async fn send(&self, builder: RequestBuilder) -> ProviderResult<Response> {
        builder
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))
    }

    /// Maps non-success statuses to errors; `NotFound` carries `id`.
    async fn check(response: Response, id: &str) -> ProviderResult<Response> {
        let status = response.status();
        trace!("Provider responded with {status}");

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationFailed {
                message: String::from("Provider rejected the credentials"),
            });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound { id: id.to_string() });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::api_error(status.as_u16(), body));
        }

        Ok(response)
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> ProviderResult<T> {
        response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, resource_type: &str, name: &str, inputs: &Value) -> ProviderResult<Created> {
        debug!("POST {resource_type} for {name}");
        let url = self.url(&["resources", resource_type])?;
        let response = self
            .send(self.request(Method::POST, url).json(&CreateRequest { name, inputs }))
            .await?;
        let response = Self::check(response, name).await?;
        Self::parse(response).await
    }

    async fn update(&self, resource_type: &str, id: &str, inputs: &Value) -> ProviderResult<Outputs> {
        debug!("PUT {resource_type} {id}");
        let url = self.url(&["resources", resource_type, id])?;
        let response = self
            .send(self.request(Method::PUT, url).json(&UpdateRequest { inputs }))
            .await?;
        let response = Self::check(response, id).await?;
        Ok(Self::parse::<OutputsResponse>(response).await?.outputs)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()> {
        debug!("DELETE {resource_type} {id}");
        let url = self.url(&["resources", resource_type, id])?;
        let response = self.send(self.request(Method::DELETE, url)).await?;
        Self::check(response, id).await?;
        Ok(())
    }

    async fn read(&self, resource_type: &str, id: &str) -> ProviderResult<Option<Outputs>> {
        debug!("GET {resource_type} {id}");
        let url = self.url(&["resources", resource_type, id])?;
        let response = self.send(self.request(Method::GET, url)).await?;
        match Self::check(response, id).await {
            Ok(response) => Ok(Some(Self::parse::<OutputsResponse>(response).await?.outputs)),
            Err(ProviderError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[async_trait]
impl SecretStore for HttpProvider {
    async fn get(&self, id: &str) -> ProviderResult<Option<String>> {
        let url = self.url(&["secrets", id])?;
        let response = self.send(self.request(Method::GET, url)).await?;
        match Self::check(response, id).await {
            Ok(response) => Ok(Some(Self::parse::<SecretBody>(response).await?.value)),
            Err(ProviderError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, id: &str, value: &str) -> ProviderResult<()> {
        let url = self.url(&["secrets", id])?;
        let body = SecretBody {
            value: value.to_string(),
        };
        let response = self.send(self.request(Method::PUT, url).json(&body)).await?;
        Self::check(response, id).await?;
        Ok(())
    }
}
