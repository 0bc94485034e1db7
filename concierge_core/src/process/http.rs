//! Outbound HTTP(S) request execution.
//!
//! Every call makes exactly one attempt. There is no retry middleware here
//! by design — a retried side-effecting request (restart a service, toggle a
//! relay) is not safe to repeat silently, so failures are surfaced to the
//! caller instead of being masked by a retry layer.

use std::collections::HashMap;

use base64::Engine;
use serde_json::Value;

use crate::config::{HttpCommand, PayloadMode};
use crate::error::ConciergeError;
use crate::placeholder::{json_expand, literal_expand_str};

use super::ProcessResult;

/// Response bodies are recorded truncated to this many bytes; the full body
/// is never persisted into a task record.
const MAX_RECORDED_BODY: usize = 1000;

fn truncate_body(body: String) -> String {
    if body.len() <= MAX_RECORDED_BODY {
        return body;
    }
    let mut end = MAX_RECORDED_BODY;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Executes an [`HttpCommand`] against a single host.
pub struct HttpClientProcess;

impl HttpClientProcess {
    pub async fn run(cmd: &HttpCommand, hostname: &str, params: &HashMap<String, Value>) -> ProcessResult {
        let mut effective_params = params.clone();
        for (k, v) in &cmd.path_params {
            effective_params.entry(k.clone()).or_insert_with(|| Value::String(v.clone()));
        }

        let url = literal_expand_str(&cmd.url, hostname, &effective_params);
        let mut builder = reqwest::ClientBuilder::new().danger_accept_invalid_certs(cmd.skip_cert_validation);
        if let Some(wait) = cmd.timeout.wait_duration() {
            builder = builder.timeout(wait);
        }
        let client = match builder.build() {
            Ok(c) => c,
            Err(e) => return ProcessResult::failed(ConciergeError::HttpTransport(e.to_string()).to_string(), None, String::new(), String::new()),
        };

        let mut request = client.request(cmd.method.as_reqwest(), &url);

        for (name, value) in &cmd.headers {
            request = request.header(name, literal_expand_str(value, hostname, &effective_params));
        }

        let query: Vec<(String, String)> = cmd
            .query_params
            .iter()
            .map(|(k, v)| (k.clone(), literal_expand_str(v, hostname, &effective_params)))
            .collect();
        if !query.is_empty() {
            request = request.query(&query);
        }

        if let Some(payload) = &cmd.payload {
            if cmd.payload_base64_encoded {
                match base64::engine::general_purpose::STANDARD.decode(payload) {
                    Ok(bytes) => request = request.body(bytes),
                    Err(e) => {
                        return ProcessResult::failed(
                            ConciergeError::PlaceholderInvalid {
                                key: "payload".to_string(),
                                reason: format!("not valid base64: {e}"),
                            }
                            .to_string(),
                            None,
                            String::new(),
                            String::new(),
                        )
                    }
                }
            } else {
                let body = match cmd.payload_placeholder_replacement {
                    PayloadMode::Disabled => Ok(payload.clone()),
                    PayloadMode::VeryUnsafe => Ok(literal_expand_str(payload, hostname, &effective_params)),
                    PayloadMode::JsonOnly => json_expand(payload, hostname, &effective_params),
                };
                match body {
                    Ok(body) => {
                        if matches!(cmd.payload_placeholder_replacement, PayloadMode::JsonOnly) {
                            request = request.header("content-type", "application/json");
                        }
                        request = request.body(body);
                    }
                    Err(e) => return ProcessResult::failed(e.to_string(), None, String::new(), String::new()),
                }
            }
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return ProcessResult::failed(ConciergeError::HttpTransport(e.to_string()).to_string(), None, String::new(), String::new()),
        };

        let status = response.status();
        let body = truncate_body(response.text().await.unwrap_or_default());

        if status.is_success() {
            ProcessResult::ok(Some(status.as_u16() as i32), body, String::new())
        } else {
            ProcessResult::failed(
                ConciergeError::HttpNon2xx(status.as_u16()).to_string(),
                Some(status.as_u16() as i32),
                body,
                String::new(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpMethod, Timeout};

    fn cmd(url: &str) -> HttpCommand {
        HttpCommand {
            name: "test".to_string(),
            url: url.to_string(),
            method: HttpMethod::Get,
            headers: Vec::new(),
            query_params: HashMap::new(),
            path_params: HashMap::new(),
            payload: None,
            payload_base64_encoded: false,
            payload_placeholder_replacement: PayloadMode::Disabled,
            skip_cert_validation: false,
            timeout: Timeout::Sync(5),
        }
    }

    #[tokio::test]
    async fn unreachable_host_reports_transport_error() {
        let c = cmd("http://127.0.0.1:1/unreachable");
        let result = HttpClientProcess::run(&c, "h1", &HashMap::new()).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[test]
    fn url_literal_expansion_substitutes_hostname() {
        let expanded = literal_expand_str("https://<hostname>:8080/status", "box1", &HashMap::new());
        assert_eq!(expanded, "https://box1:8080/status");
    }

    #[test]
    fn truncate_body_caps_at_1000_bytes() {
        let body = "x".repeat(2000);
        let truncated = truncate_body(body);
        assert_eq!(truncated.len(), MAX_RECORDED_BODY);
    }

    #[test]
    fn truncate_body_leaves_short_bodies_untouched() {
        let body = "short".to_string();
        assert_eq!(truncate_body(body.clone()), body);
    }
}
