//! HTTP transport seam
//!
//! The client is written against [`HttpTransport`] so its retry, refresh and
//! poll behavior can be exercised without a network. [`ReqwestTransport`]
//! is the production implementation.

use crate::error::{ArmError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Put => write!(f, "PUT"),
            Method::Post => write!(f, "POST"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// Request body: JSON for resource calls, form-encoded for the token
/// exchange.
#[derive(Debug, Clone)]
pub enum Body {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub body: Option<Body>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            bearer: None,
            body: None,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    pub fn with_form(mut self, form: Vec<(String, String)>) -> Self {
        self.body = Some(Body::Form(form));
        self
    }
}

/// A decoded response: status, lowercased headers, parsed JSON body (when
/// the body is non-empty).
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// Server-supplied retry hint, governing both transient backoff and the
    /// async-operation poll interval.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Poll link for an accepted long-running operation. The dedicated
    /// async-operation header wins over the generic location header.
    pub fn poll_link(&self) -> Option<String> {
        self.header("azure-asyncoperation")
            .or_else(|| self.header("location"))
            .map(str::to_string)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Execute one HTTP exchange. Connection-level failures (DNS, connect
    /// timeout) surface as [`ArmError::Connection`] so the client can
    /// classify them as transient.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Production transport over a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        match &request.body {
            Some(Body::Json(json)) => builder = builder.json(json),
            Some(Body::Form(form)) => builder = builder.form(form),
            None => {}
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ArmError::Connection(e.to_string())
            } else {
                ArmError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| ArmError::Transport(e.to_string()))?;
        let body = if text.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str(&text).map_err(|e| ArmError::MalformedResponse {
                url: request.url.clone(),
                reason: format!("body is not JSON: {e}"),
            })?)
        };

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
