// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! HTTP fetcher.
//!
//! External collaborator glue for the `HTTP` syscall: a bounded, blocking
//! request/response round trip. Permission checks (domain allow-list) happen
//! in the dispatcher before this layer is reached.

use crate::error::KernelError;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const MAX_RESPONSE_BYTES: u64 = 1024 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout_secs: u64,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent("clove-kernel")
            .build()
            .expect("default HTTP client");
        Self { client }
    }

    /// Perform the request and shape the result for the syscall response.
    /// Bodies larger than 1 MiB are truncated so the reply fits a frame.
    pub fn fetch(&self, request: &HttpRequest) -> Result<Value, KernelError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| {
                KernelError::InvalidRequest(format!("unsupported HTTP method: {}", request.method))
            })?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(Duration::from_secs(request.timeout_secs.clamp(1, 120)));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        debug!("http {} {}", request.method, request.url);
        let response = builder
            .send()
            .map_err(|e| KernelError::Backend(format!("HTTP request failed: {e}")))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();

        let body = response
            .text()
            .map_err(|e| KernelError::Backend(format!("failed to read HTTP body: {e}")))?;
        let truncated = body.len() as u64 > MAX_RESPONSE_BYTES;
        let body = if truncated {
            body.chars().take(MAX_RESPONSE_BYTES as usize).collect()
        } else {
            body
        };

        Ok(json!({
            "success": true,
            "status": status,
            "headers": headers,
            "body": body,
            "truncated": truncated,
        }))
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}
