use super::{Attachment, ContextBudget, Payload, Transport};
use crate::config::TransportConfig;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use base64::Engine as _;
use keyring::Entry;
use reqwest::header::HeaderMap;
use reqwest::Proxy;
use serde::Serialize;
use std::env;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Serialize)]
struct WireAttachment<'a> {
    name: &'a str,
    media_type: &'a str,
    /// base64 (standard alphabet)
    data: String,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    prompt: &'a str,
    attachments: Vec<WireAttachment<'a>>,
}

impl<'a> WireRequest<'a> {
    fn from_payload(payload: &'a Payload) -> Self {
        Self {
            prompt: &payload.prompt,
            attachments: payload.attachments.iter().map(wire_attachment).collect(),
        }
    }
}

fn wire_attachment(a: &Attachment) -> WireAttachment<'_> {
    WireAttachment {
        name: &a.name,
        media_type: &a.media_type,
        data: base64::engine::general_purpose::STANDARD.encode(&a.data),
    }
}

/// `reqwest`-backed transport posting `{ prompt, attachments }` as JSON.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    budget: ContextBudget,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .pool_idle_timeout(Some(Duration::from_secs(90)));

        if let Ok(proxy_url) = env::var("GOVERNOR_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {}", e)))?;

        let api_key = config
            .api_key
            .clone()
            .or_else(|| Self::get_api_key(&config.provider));

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            budget: config.context_budget(),
        })
    }

    fn get_api_key(provider: &str) -> Option<String> {
        // 1. Try Keyring
        if let Ok(entry) = Entry::new("prompt-governor", provider) {
            if let Ok(key) = entry.get_password() {
                return Some(key);
            }
        }

        // 2. Try Environment Variable (PROVIDER_API_KEY)
        let env_var = format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"));
        env::var(env_var).ok()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn header_first(headers: &HeaderMap, names: &[&str]) -> Option<String> {
        for name in names {
            if let Some(v) = headers.get(*name) {
                if let Ok(s) = v.to_str() {
                    let s = s.trim();
                    if !s.is_empty() {
                        return Some(s.to_string());
                    }
                }
            }
        }
        None
    }

    /// `Retry-After: <seconds>` converted to milliseconds.
    ///
    /// Only the delta-seconds form is supported; HTTP dates are ignored.
    pub(crate) fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
        let raw = Self::header_first(headers, &["retry-after"])?;
        let secs: f64 = raw.parse().ok()?;
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        Some((secs * 1000.0).round() as u64)
    }

    /// Success bodies are either `{ "text": ... }`, a JSON string, or raw text.
    fn extract_text(body: String) -> String {
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(serde_json::Value::Object(map)) => match map.get("text") {
                Some(serde_json::Value::String(text)) => text.clone(),
                _ => body,
            },
            Ok(serde_json::Value::String(text)) => text,
            _ => body,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, payload: &Payload) -> Result<String> {
        let (payload, truncated) = self.budget.fit(payload);
        let request_id = payload.request_id.as_str();
        let context = || {
            ErrorContext::new()
                .with_request_id(request_id)
                .with_source("http_transport")
        };

        let mut req = self
            .client
            .post(&self.endpoint)
            .header("x-request-id", request_id)
            .json(&WireRequest::from_payload(&payload));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let start = Instant::now();
        let resp = req.send().await.map_err(|e| {
            let kind = if e.is_timeout() { "timeout" } else { "send failed" };
            Error::network(format!("{}: {}", kind, e)).with_context(context())
        })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after_ms = Self::retry_after_ms(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            info!(
                http_status = status,
                request_id,
                retry_after_ms,
                duration_ms = start.elapsed().as_millis() as u64,
                "generation request failed"
            );
            return Err(Error::from_status(status, body, retry_after_ms)
                .with_context(context().with_status_code(status)));
        }

        let body = resp.text().await.map_err(|e| {
            Error::network(format!("failed to read response body: {}", e)).with_context(context())
        })?;

        debug!(
            http_status = status,
            request_id,
            truncated,
            duration_ms = start.elapsed().as_millis() as u64,
            "generation request succeeded"
        );
        Ok(Self::extract_text(body))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
