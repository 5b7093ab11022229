//! Authenticated resource-manager client
//!
//! Everything the client can resolve on its own stays internal: expired
//! tokens are refreshed and the call retried once, transient failures are
//! retried with the server's backoff hint up to a bound, and accepted
//! mutations are polled to a terminal state. Callers only ever see the
//! taxonomy-level errors from [`crate::error::ArmError`].

use crate::config::ArmConfig;
use crate::error::{ArmError, OperationStatus, Result};
use crate::path::ResourcePath;
use crate::token::TokenCache;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method};
use std::sync::Arc;
use std::time::Duration;

/// Status codes retried as transient: request timeout, internal error,
/// bad gateway, service unavailable, gateway timeout.
const TRANSIENT_STATUSES: [u16; 5] = [408, 500, 502, 503, 504];

pub struct ArmClient {
    transport: Arc<dyn HttpTransport>,
    tokens: TokenCache,
    config: ArmConfig,
}

impl ArmClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: ArmConfig) -> Self {
        let tokens = TokenCache::new(transport.clone(), &config);
        Self {
            transport,
            tokens,
            config,
        }
    }

    pub fn config(&self) -> &ArmConfig {
        &self.config
    }

    /// Full request URL for a resource path.
    pub fn url(&self, path: &ResourcePath) -> String {
        path.url(self.config.management_base(), &self.config.api_version)
    }

    /// GET a resource; `Ok(None)` means the resource is absent.
    pub async fn get(&self, path: &ResourcePath) -> Result<Option<serde_json::Value>> {
        self.get_url(&self.url(path)).await
    }

    pub async fn get_url(&self, url: &str) -> Result<Option<serde_json::Value>> {
        let response = self.send(Method::Get, url, None).await?;
        match response.status {
            200 => Ok(response.body),
            204 | 404 => Ok(None),
            409 => Err(ArmError::Conflict(url.to_string())),
            status => Err(ArmError::UnexpectedStatus {
                status,
                url: url.to_string(),
            }),
        }
    }

    /// PUT (create or update) a resource, driving any accepted long-running
    /// operation to completion. Returns the final resource body.
    pub async fn put(
        &self,
        path: &ResourcePath,
        body: serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        self.put_url(&self.url(path), body).await
    }

    pub async fn put_url(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        self.mutate(Method::Put, url, Some(body)).await
    }

    /// POST an action on a resource (e.g. `restart`).
    pub async fn post_action(
        &self,
        path: &ResourcePath,
        action: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>> {
        let url = path.action_url(
            self.config.management_base(),
            &self.config.api_version,
            action,
        );
        self.mutate(Method::Post, &url, body).await
    }

    /// DELETE a resource. Absence (404 or 204 on the initial response) is
    /// success, not an error, so deletes stay idempotent.
    pub async fn delete(&self, path: &ResourcePath) -> Result<Option<serde_json::Value>> {
        self.delete_url(&self.url(path)).await
    }

    pub async fn delete_url(&self, url: &str) -> Result<Option<serde_json::Value>> {
        self.mutate(Method::Delete, url, None).await
    }

    /// Dispatch a mutation and resolve its outcome, entering the async poll
    /// loop on 202.
    async fn mutate(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>> {
        let response = self.send(method, url, body).await?;
        match response.status {
            // No-op completion: the platform finished synchronously.
            200 | 201 => Ok(response.body),
            204 => Ok(None),
            404 if method == Method::Delete => Ok(None),
            202 => self.poll_to_completion(method, url, response).await,
            409 => Err(ArmError::Conflict(url.to_string())),
            status => Err(ArmError::UnexpectedStatus {
                status,
                url: url.to_string(),
            }),
        }
    }

    /// Drive an accepted operation to a terminal status: sleep the last
    /// `Retry-After` hint, GET the poll link, classify the status field.
    async fn poll_to_completion(
        &self,
        method: Method,
        origin_url: &str,
        accepted: HttpResponse,
    ) -> Result<Option<serde_json::Value>> {
        let poll_link = accepted
            .poll_link()
            .ok_or_else(|| ArmError::MissingPollLink(origin_url.to_string()))?;
        let mut delay = accepted
            .retry_after()
            .unwrap_or_else(|| self.config.retry.poll_interval());

        tracing::debug!(%method, url = %origin_url, poll = %poll_link, "Operation accepted, polling");

        loop {
            tokio::time::sleep(delay).await;

            let response = self.send(Method::Get, &poll_link, None).await?;
            let status = self.classify_poll(&poll_link, &response)?;

            match status {
                OperationStatus::InProgress => {
                    delay = response
                        .retry_after()
                        .unwrap_or_else(|| self.config.retry.poll_interval());
                }
                OperationStatus::Succeeded => {
                    tracing::debug!(url = %origin_url, "Operation succeeded");
                    // A delete leaves nothing to read back.
                    if method == Method::Delete {
                        return Ok(None);
                    }
                    return self.get_url(origin_url).await;
                }
                OperationStatus::Failed | OperationStatus::Canceled => {
                    let payload = response.body.unwrap_or(serde_json::Value::Null);
                    let error = payload.get("error").cloned().unwrap_or(serde_json::Value::Null);
                    return Err(ArmError::AsyncOperationFailed {
                        status,
                        code: error
                            .get("code")
                            .and_then(|v| v.as_str())
                            .unwrap_or("Unknown")
                            .to_string(),
                        message: error
                            .get("message")
                            .and_then(|v| v.as_str())
                            .unwrap_or("operation did not succeed")
                            .to_string(),
                        payload,
                    });
                }
            }
        }
    }

    fn classify_poll(&self, poll_link: &str, response: &HttpResponse) -> Result<OperationStatus> {
        match response.status {
            // Some poll links report progress purely through the status
            // code until the operation finishes.
            202 => Ok(OperationStatus::InProgress),
            200 => {
                let status_field = response
                    .body
                    .as_ref()
                    .and_then(|b| b.get("status"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ArmError::MalformedResponse {
                        url: poll_link.to_string(),
                        reason: "poll body has no status field".to_string(),
                    })?;
                status_field
                    .parse()
                    .map_err(|reason| ArmError::MalformedResponse {
                        url: poll_link.to_string(),
                        reason,
                    })
            }
            status => Err(ArmError::UnexpectedStatus {
                status,
                url: poll_link.to_string(),
            }),
        }
    }

    /// One authenticated exchange with transparent 401 refresh and bounded
    /// transient retry.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse> {
        let mut refreshed = false;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let token = self.tokens.get(false).await?;
            let mut request = HttpRequest::new(method, url).with_bearer(token);
            if let Some(json) = &body {
                request = request.with_json(json.clone());
            }

            let response = match self.transport.execute(request).await {
                Ok(response) => response,
                Err(ArmError::Connection(reason)) => {
                    if attempts > self.config.retry.max_retries {
                        return Err(ArmError::RetryExhausted {
                            attempts,
                            last: reason,
                        });
                    }
                    tracing::warn!(%method, url, %reason, "Connection failure, retrying");
                    tokio::time::sleep(self.config.retry.default_backoff()).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if response.status == 401 {
                if refreshed {
                    return Err(ArmError::Authentication(format!(
                        "{method} {url} remained unauthorized after a token refresh"
                    )));
                }
                tracing::debug!(%method, url, "Unauthorized, forcing a token refresh");
                refreshed = true;
                self.tokens.get(true).await?;
                continue;
            }

            if TRANSIENT_STATUSES.contains(&response.status) {
                if attempts > self.config.retry.max_retries {
                    return Err(ArmError::RetryExhausted {
                        attempts,
                        last: format!("HTTP {}", response.status),
                    });
                }
                let backoff = response
                    .retry_after()
                    .unwrap_or_else(|| self.config.retry.default_backoff());
                tracing::warn!(%method, url, status = response.status, "Transient failure, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }

            return Ok(response);
        }
    }
}
