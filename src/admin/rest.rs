//! Plaintext REST adapter for the emulator's administrative API.

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Uri,
    body::Bytes,
    header::{ACCEPT, CONTENT_TYPE},
};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{
    AdminError, AdminGateway, CreateDatabaseRequest, CreateInstanceRequest, Operation,
    RetryPolicy, StatusCode,
};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:9020";

/// JSON-over-HTTP transport that waits for the emulator to come up.
#[derive(Clone)]
pub struct RestTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    base: String,
    retry: RetryPolicy,
}

enum Attempt {
    Done(Result<Value, AdminError>),
    NotReady(String),
}

impl RestTransport {
    pub fn connect(endpoint: &str, retry: RetryPolicy) -> Result<Self, AdminError> {
        let base = normalize_endpoint(endpoint)?;
        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            client,
            base,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn get_json(&self, path: &str, cancel: &CancellationToken) -> Result<Value, AdminError> {
        self.call(Method::GET, path, None, cancel).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, AdminError> {
        self.call(Method::POST, path, Some(body), cancel).await
    }

    pub async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<(), AdminError> {
        self.call(Method::DELETE, path, None, cancel).await.map(|_| ())
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, AdminError> {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(AdminError::Cancelled),
                outcome = self.call_once(method.clone(), path, body) => outcome,
            };
            let reason = match outcome {
                Attempt::Done(result) => return result,
                Attempt::NotReady(reason) => reason,
            };
            if self.retry.exhausted(attempt) {
                return Err(AdminError::Transport(format!(
                    "{} not ready after {attempt} attempt(s): {reason}",
                    self.base
                )));
            }
            let delay = self.retry.delay(attempt);
            tracing::debug!(
                endpoint = %self.base,
                path,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "admin endpoint not ready, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(AdminError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn call_once(&self, method: Method, path: &str, body: Option<&Value>) -> Attempt {
        let uri = format!("{}/v1/{}", self.base, path.trim_start_matches('/'));
        let payload = match body.map(serde_json::to_vec).transpose() {
            Ok(payload) => payload.unwrap_or_default(),
            Err(err) => {
                return Attempt::Done(Err(AdminError::Transport(format!(
                    "unable to encode request for {uri}: {err}"
                ))));
            }
        };
        let request = match Request::builder()
            .method(method)
            .uri(&uri)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(Full::new(Bytes::from(payload)))
        {
            Ok(request) => request,
            Err(err) => {
                return Attempt::Done(Err(AdminError::Transport(format!(
                    "invalid request for {uri}: {err}"
                ))));
            }
        };

        let response = match self.client.request(request).await {
            Ok(response) => response,
            Err(err) if err.is_connect() => return Attempt::NotReady(describe(&err)),
            Err(err) => return Attempt::Done(Err(AdminError::Transport(describe(&err)))),
        };
        let status = response.status();
        let bytes = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                return Attempt::Done(Err(AdminError::Transport(format!(
                    "failed to read response from {uri}: {err}"
                ))));
            }
        };

        if status.is_success() {
            if bytes.is_empty() {
                return Attempt::Done(Ok(Value::Null));
            }
            return Attempt::Done(
                serde_json::from_slice(&bytes)
                    .map_err(|err| AdminError::MalformedResponse(format!("{uri}: {err}"))),
            );
        }
        match error_from_response(status.as_u16(), &bytes) {
            AdminError::Status {
                code: StatusCode::Unavailable,
                message,
            } => Attempt::NotReady(message),
            err => Attempt::Done(Err(err)),
        }
    }
}

/// [`AdminGateway`] backed by the emulator's REST surface.
pub struct RestAdminClient {
    transport: RestTransport,
}

impl RestAdminClient {
    pub fn connect(endpoint: &str, retry: RetryPolicy) -> Result<Self, AdminError> {
        Ok(Self {
            transport: RestTransport::connect(endpoint, retry)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.transport.base_url()
    }
}

#[async_trait]
impl AdminGateway for RestAdminClient {
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
        cancel: &CancellationToken,
    ) -> Result<Operation, AdminError> {
        let body = json!({
            "instanceId": request.instance_id,
            "instance": {
                "config": request.config_path(),
                "displayName": request.display_name,
                "nodeCount": request.node_count,
            },
        });
        let path = format!("{}/instances", request.parent());
        let value = self.transport.post_json(&path, &body, cancel).await?;
        parse_operation(value)
    }

    async fn create_database(
        &self,
        request: &CreateDatabaseRequest,
        cancel: &CancellationToken,
    ) -> Result<Operation, AdminError> {
        let body = json!({ "createStatement": request.create_statement() });
        let path = format!("{}/databases", request.parent());
        let value = self.transport.post_json(&path, &body, cancel).await?;
        parse_operation(value)
    }

    async fn wait_operation(
        &self,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> Result<(), AdminError> {
        let mut operation = operation;
        while !operation.done {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AdminError::Cancelled),
                _ = tokio::time::sleep(self.transport.retry.poll_interval()) => {}
            }
            let value = self.transport.get_json(&operation.name, cancel).await?;
            let polled = parse_operation(value)?;
            operation = Operation {
                name: if polled.name.is_empty() {
                    operation.name
                } else {
                    polled.name
                },
                ..polled
            };
        }
        operation.into_result()
    }
}

#[derive(Deserialize)]
struct OperationWire {
    #[serde(default)]
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<StatusWire>,
}

#[derive(Deserialize)]
struct StatusWire {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

fn parse_operation(value: Value) -> Result<Operation, AdminError> {
    let wire: OperationWire = serde_json::from_value(value)
        .map_err(|err| AdminError::MalformedResponse(format!("operation: {err}")))?;
    if wire.name.is_empty() && !wire.done {
        return Err(AdminError::MalformedResponse(
            "unfinished operation without a name".to_string(),
        ));
    }
    Ok(Operation {
        name: wire.name,
        done: wire.done,
        error: wire
            .error
            .map(|status| (StatusCode::from_grpc(status.code), status.message)),
    })
}

fn error_from_response(http_status: u16, body: &[u8]) -> AdminError {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let code = StatusCode::from_name(&envelope.error.status)
                .unwrap_or_else(|| StatusCode::from_http(http_status));
            AdminError::status(code, envelope.error.message)
        }
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            let message = if text.trim().is_empty() {
                format!("http status {http_status}")
            } else {
                text.trim().chars().take(256).collect()
            };
            AdminError::status(StatusCode::from_http(http_status), message)
        }
    }
}

/// Accepts `host:port` or `http://host:port[/prefix]`.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, AdminError> {
    let invalid = |reason: String| AdminError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(invalid("endpoint is empty".to_string()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let uri: Uri = candidate
        .parse()
        .map_err(|err: hyper::http::uri::InvalidUri| invalid(err.to_string()))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(invalid(format!(
                "unsupported scheme '{other}'; the admin endpoint is plaintext http"
            )));
        }
        None => return Err(invalid("missing scheme".to_string())),
    }
    if uri.authority().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    if uri.query().is_some() {
        return Err(invalid("query strings are not supported".to_string()));
    }
    Ok(candidate)
}

fn describe(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
