//! Bearer credential cache
//!
//! One credential per client, replaced wholesale on refresh. Callers inside
//! one process serialize on the internal mutex; a race would only cause a
//! redundant exchange, never corruption, but the critical section keeps the
//! identity endpoint out of hot paths.

use crate::config::ArmConfig;
use crate::error::{ArmError, Result};
use crate::transport::{HttpRequest, HttpTransport, Method};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Credential {
    token: String,
    expires_at: Instant,
}

impl Credential {
    /// Live means "will still be valid past the safety margin"; a token
    /// about to expire is never handed out.
    fn is_live(&self, safety_margin: Duration) -> bool {
        Instant::now() + safety_margin < self.expires_at
    }
}

pub struct TokenCache {
    transport: Arc<dyn HttpTransport>,
    token_url: String,
    client_id: String,
    client_secret: String,
    /// Audience the token is requested for (the management endpoint).
    resource: String,
    safety_margin: Duration,
    cached: Mutex<Option<Credential>>,
}

impl TokenCache {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &ArmConfig) -> Self {
        Self {
            transport,
            token_url: config.token_url(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            resource: format!("{}/", config.management_base()),
            safety_margin: config.token_safety_margin(),
            cached: Mutex::new(None),
        }
    }

    /// Return a live bearer token, exchanging credentials only when the
    /// cache is empty, the cached token is within the safety margin of its
    /// expiry, or a refresh is forced.
    pub async fn get(&self, force_refresh: bool) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if !force_refresh
            && let Some(credential) = cached.as_ref()
            && credential.is_live(self.safety_margin)
        {
            return Ok(credential.token.clone());
        }

        let credential = self.exchange().await?;
        let token = credential.token.clone();
        *cached = Some(credential);
        Ok(token)
    }

    async fn exchange(&self) -> Result<Credential> {
        tracing::debug!(url = %self.token_url, "Exchanging client credentials for a token");

        let request = HttpRequest::new(Method::Post, &self.token_url).with_form(vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), self.client_id.clone()),
            ("client_secret".to_string(), self.client_secret.clone()),
            ("resource".to_string(), self.resource.clone()),
        ]);

        let response = self.transport.execute(request).await?;

        match response.status {
            200 => {
                let body = response.body.ok_or_else(|| ArmError::MalformedResponse {
                    url: self.token_url.clone(),
                    reason: "empty token response".to_string(),
                })?;

                let token = body
                    .get("access_token")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ArmError::MalformedResponse {
                        url: self.token_url.clone(),
                        reason: "missing access_token".to_string(),
                    })?
                    .to_string();

                // The identity endpoint reports expires_in either as a
                // number or a numeric string.
                let expires_in = match body.get("expires_in") {
                    Some(serde_json::Value::Number(n)) => n.as_u64(),
                    Some(serde_json::Value::String(s)) => s.parse::<u64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| ArmError::MalformedResponse {
                    url: self.token_url.clone(),
                    reason: "missing or non-numeric expires_in".to_string(),
                })?;

                Ok(Credential {
                    token,
                    expires_at: Instant::now() + Duration::from_secs(expires_in),
                })
            }
            // Bad credentials are fatal; retrying cannot help.
            400 | 401 => {
                let detail = response
                    .body
                    .as_ref()
                    .and_then(|b| b.get("error_description"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("credential exchange rejected");
                Err(ArmError::Authentication(detail.to_string()))
            }
            status => Err(ArmError::TokenExchange { status }),
        }
    }
}
