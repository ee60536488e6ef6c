//! Single-attempt HTTP dispatch for prepared requests.

use reqwest::Method;
use serde_json::Value;
use std::time::Duration;

use crate::config::{ResponseDefinition, ResponseMode};
use crate::error::{Error, Result};
use crate::models::{value_to_plain_string, RequestBody, RequestDescriptor};

/// Status and raw body of a successful call.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Clone)]
pub struct RequestExecutor {
    client: reqwest::Client,
}

impl RequestExecutor {
    pub fn new() -> Result<Self> {
        // Redirects are not followed; a 3xx is reported like any other
        // status outside the success set.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::RequestTransport(e.to_string()))?;
        Ok(Self { client })
    }

    /// Send `request` once and check the status against `response`.
    ///
    /// `timeout` is the effective timeout in seconds; `None` waits
    /// indefinitely.
    pub async fn send(
        &self,
        request: &RequestDescriptor,
        response: &ResponseDefinition,
        timeout: Option<f64>,
    ) -> Result<HttpResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(|_| {
            Error::Binding(format!("invalid HTTP method '{}'", request.method))
        })?;

        let mut builder = self.client.request(method.clone(), &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let query = query_pairs(&request.params);
        if !query.is_empty() {
            builder = builder.query(&query);
        }

        builder = match &request.body {
            RequestBody::None => builder,
            RequestBody::Json(v) => builder.json(v),
            RequestBody::Raw(Value::String(s)) => builder.body(s.clone()),
            RequestBody::Raw(Value::Object(map)) => {
                let fields: Vec<(String, String)> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), value_to_plain_string(v)))
                    .collect();
                builder.form(&fields)
            }
            RequestBody::Raw(other) => builder.body(other.to_string()),
        };

        if let Some(secs) = timeout.filter(|t| *t > 0.0) {
            builder = builder.timeout(Duration::from_secs_f64(secs));
        }

        tracing::debug!(method = %method, url = %request.url, "sending request");
        let resp = builder.send().await.map_err(|e| transport_error(&e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| transport_error(&e))?;
        tracing::debug!(status = status.as_u16(), bytes = body.len(), "received response");

        if !response.is_success(status.as_u16()) {
            return Err(Error::http_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                &body,
            ));
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            body,
        })
    }

    /// [`send`](Self::send) followed by [`decode_body`].
    pub async fn execute(
        &self,
        request: &RequestDescriptor,
        response: &ResponseDefinition,
        timeout: Option<f64>,
    ) -> Result<Value> {
        let resp = self.send(request, response, timeout).await?;
        decode_body(&resp.body, response.mode)
    }
}

/// Interpret a response body according to the response mode.
///
/// In `json` mode an empty body decodes to `null`.
pub fn decode_body(body: &str, mode: ResponseMode) -> Result<Value> {
    match mode {
        ResponseMode::Text => Ok(Value::String(body.to_string())),
        ResponseMode::Json => {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(body).map_err(|e| Error::ResponseDecode(e.to_string()))
        }
    }
}

/// Flatten query parameters; arrays repeat the key, nulls are dropped.
fn query_pairs(params: &std::collections::BTreeMap<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items.iter().filter(|i| !i.is_null()) {
                    pairs.push((key.clone(), value_to_plain_string(item)));
                }
            }
            other => pairs.push((key.clone(), value_to_plain_string(other))),
        }
    }
    pairs
}

fn transport_error(err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::RequestTransport(format!("request timed out: {}", err))
    } else {
        Error::RequestTransport(err.to_string())
    }
}
