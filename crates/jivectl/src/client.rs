//! HTTP client for the jived tool surface.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{code}: {message}")]
    Tool { code: String, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Invoke a tool by name. A `success: false` envelope becomes an error
    /// carrying the stable code.
    pub async fn call(&self, tool: &str, args: Value) -> Result<Value> {
        let url = format!("{}/tools/{}", self.base_url, tool);
        let response: Value = self
            .http
            .post(&url)
            .json(&args)
            .send()
            .await?
            .json()
            .await?;

        match response.get("success").and_then(Value::as_bool) {
            Some(true) => Ok(response),
            Some(false) => Err(ClientError::Tool {
                code: response
                    .get("error_code")
                    .and_then(Value::as_str)
                    .unwrap_or("Internal")
                    .to_string(),
                message: response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Err(ClientError::Malformed(response.to_string())),
        }
    }

    pub async fn health(&self) -> Result<Value> {
        let url = format!("{}/health", self.base_url);
        Ok(self.http.get(&url).send().await?.json().await?)
    }
}
