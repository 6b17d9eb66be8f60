//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::errors::EngineError;

/// HTTP client for backend communication
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str, token: Option<SecretString>) -> Result<Self, EngineError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| EngineError::ConfigError(format!("invalid backend url '{}': {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::ConfigError(format!(
                "backend url must be http or https, got '{}'",
                parsed.scheme()
            )));
        }
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            ),
            None => request,
        }
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, EngineError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = check_status("GET", response).await?;
        Ok(response.json().await?)
    }

    /// Make a POST request, discarding the response body
    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<(), EngineError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self.authorize(self.client.post(&url).json(body)).send().await?;
        check_status("POST", response).await?;
        Ok(())
    }
}

async fn check_status(method: &str, response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    error!("HTTP {} failed: {} - {}", method, status, body);
    if status == StatusCode::NOT_FOUND {
        Err(EngineError::NotFound(url))
    } else {
        Err(EngineError::StorageError(format!("{} {}: {}", method, status, body)))
    }
}
