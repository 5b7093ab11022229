//! Scripted in-memory transport for tests
//!
//! Rules are keyed by method plus a URL fragment; each rule serves a queue
//! of canned responses. Requests matching no rule (and rules whose queue is
//! exhausted) get a 404, which doubles as "resource absent" for idempotent
//! paths. Unordered matching matters: concurrent provisioning steps hit the
//! transport in nondeterministic order.

use crate::error::Result;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

struct Rule {
    method: Method,
    url_fragment: String,
    queue: VecDeque<HttpResponse>,
    repeat: Option<HttpResponse>,
}

#[derive(Default)]
pub struct ScriptedTransport {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<(Method, String)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for requests whose URL contains `url_fragment`.
    pub fn enqueue(&self, method: Method, url_fragment: &str, response: HttpResponse) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules
            .iter_mut()
            .find(|r| r.method == method && r.url_fragment == url_fragment)
        {
            rule.queue.push_back(response);
        } else {
            rules.push(Rule {
                method,
                url_fragment: url_fragment.to_string(),
                queue: VecDeque::from([response]),
                repeat: None,
            });
        }
    }

    /// Serve the same response for every matching request.
    pub fn always(&self, method: Method, url_fragment: &str, response: HttpResponse) {
        let mut rules = self.rules.lock().unwrap();
        rules.push(Rule {
            method,
            url_fragment: url_fragment.to_string(),
            queue: VecDeque::new(),
            repeat: Some(response),
        });
    }

    /// Requests seen so far, in arrival order.
    pub fn requests(&self) -> Vec<(Method, String)> {
        self.log.lock().unwrap().clone()
    }

    /// Number of requests matching method + URL fragment.
    pub fn count(&self, method: Method, url_fragment: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, url)| *m == method && url.contains(url_fragment))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.log
            .lock()
            .unwrap()
            .push((request.method, request.url.clone()));

        let mut rules = self.rules.lock().unwrap();

        // Longest fragment wins so "/virtualMachines/vm-1" beats
        // "/virtualMachines" when both match.
        let mut candidates: Vec<&mut Rule> = rules
            .iter_mut()
            .filter(|r| r.method == request.method && request.url.contains(&r.url_fragment))
            .collect();
        candidates.sort_by_key(|r| std::cmp::Reverse(r.url_fragment.len()));

        for rule in candidates {
            if let Some(response) = rule.queue.pop_front() {
                return Ok(response);
            }
            if let Some(response) = &rule.repeat {
                return Ok(response.clone());
            }
        }

        // Unscripted request: report absence.
        Ok(HttpResponse {
            status: 404,
            headers: HashMap::new(),
            body: None,
        })
    }
}

/// Response with a JSON body.
pub fn json_response(status: u16, body: serde_json::Value) -> HttpResponse {
    HttpResponse {
        status,
        headers: HashMap::new(),
        body: Some(body),
    }
}

/// Response with no body.
pub fn empty_response(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        headers: HashMap::new(),
        body: None,
    }
}

/// `202 Accepted` carrying a poll link and a zero retry hint.
pub fn accepted(poll_url: &str) -> HttpResponse {
    let mut headers = HashMap::new();
    headers.insert("azure-asyncoperation".to_string(), poll_url.to_string());
    headers.insert("retry-after".to_string(), "0".to_string());
    HttpResponse {
        status: 202,
        headers,
        body: None,
    }
}

/// Poll-link body reporting the given operation status.
pub fn operation_status(status: &str) -> HttpResponse {
    let mut headers = HashMap::new();
    headers.insert("retry-after".to_string(), "0".to_string());
    HttpResponse {
        status: 200,
        headers,
        body: Some(serde_json::json!({ "status": status })),
    }
}

/// Poll-link body reporting a failed operation with an error payload.
pub fn operation_failed(status: &str, code: &str, message: &str) -> HttpResponse {
    let mut headers = HashMap::new();
    headers.insert("retry-after".to_string(), "0".to_string());
    HttpResponse {
        status: 200,
        headers,
        body: Some(serde_json::json!({
            "status": status,
            "error": { "code": code, "message": message }
        })),
    }
}
