#![allow(dead_code)]

//! In-process stand-in for the emulator's REST admin surface.
//!
//! Instance operations need one poll before they finish; a database named
//! `broken` finishes with an INTERNAL error.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1::Builder as Http1Builder,
    service::service_fn,
};
use hyper_util::rt::tokio::TokioIo;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use spanner_gateway_shim::admin::RetryPolicy;

#[derive(Default)]
pub struct FakeEmulator {
    pub instances: BTreeSet<String>,
    pub databases: BTreeSet<String>,
    pub operations: BTreeMap<String, PendingOperation>,
    pub requests: Vec<(Method, String, Value)>,
    pub next_operation: u64,
}

struct PendingOperation {
    polls_remaining: u32,
    error: Option<(i32, String)>,
}

pub type Shared = Arc<Mutex<FakeEmulator>>;

pub async fn start_fake() -> (String, Shared) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Shared::default();
    tokio::spawn(serve(listener, state.clone()));
    (addr.to_string(), state)
}

pub async fn serve(listener: TcpListener, state: Shared) {
    loop {
        let Ok((stream, _peer)) = listener.accept().await else {
            return;
        };
        let connection_state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, connection_state.clone()));
            let _ = Http1Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

async fn handle(req: Request<Incoming>, state: Shared) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().trim_start_matches("/v1/").to_string();
    let bytes = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    let mut state = state.lock().unwrap();
    state
        .requests
        .push((method.clone(), path.clone(), body.clone()));
    let (status, value) = route(&mut state, &method, &path, &body);
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::from(Bytes::from(value.to_string())))
        .unwrap())
}

fn route(state: &mut FakeEmulator, method: &Method, path: &str, body: &Value) -> (StatusCode, Value) {
    if *method == Method::POST && path.ends_with("/instances") {
        let parent = path.trim_end_matches("/instances");
        let id = body["instanceId"].as_str().unwrap_or_default();
        let name = format!("{parent}/instances/{id}");
        if !state.instances.insert(name.clone()) {
            return status_error(StatusCode::CONFLICT, "ALREADY_EXISTS", &name);
        }
        return start_operation(state, &name, 1, None);
    }
    if *method == Method::POST && path.ends_with("/databases") {
        let parent = path.trim_end_matches("/databases");
        let statement = body["createStatement"].as_str().unwrap_or_default();
        let id = statement
            .trim_start_matches("CREATE DATABASE `")
            .trim_end_matches('`');
        if !state.instances.contains(parent) {
            return status_error(StatusCode::NOT_FOUND, "NOT_FOUND", parent);
        }
        let name = format!("{parent}/databases/{id}");
        if !state.databases.insert(name.clone()) {
            return status_error(StatusCode::CONFLICT, "ALREADY_EXISTS", &name);
        }
        let error = (id == "broken").then(|| (13, "disk full".to_string()));
        return start_operation(state, &name, 0, error);
    }
    if *method == Method::GET && path.contains("/operations/") {
        let Some(pending) = state.operations.get_mut(path) else {
            return status_error(StatusCode::NOT_FOUND, "NOT_FOUND", path);
        };
        if pending.polls_remaining > 0 {
            pending.polls_remaining -= 1;
            return (StatusCode::OK, json!({ "name": path, "done": false }));
        }
        return (StatusCode::OK, finished(path, pending.error.clone()));
    }
    if *method == Method::POST && path.ends_with("/sessions") {
        return (StatusCode::OK, json!({ "name": format!("{path}/s1") }));
    }
    if *method == Method::POST && path.ends_with(":executeSql") {
        return (
            StatusCode::OK,
            json!({ "metadata": {"rowType": {"fields": [{"name": "test"}]}}, "rows": [["1"]] }),
        );
    }
    if *method == Method::DELETE {
        return (StatusCode::OK, json!({}));
    }
    status_error(StatusCode::NOT_FOUND, "NOT_FOUND", path)
}

fn start_operation(
    state: &mut FakeEmulator,
    resource: &str,
    polls: u32,
    error: Option<(i32, String)>,
) -> (StatusCode, Value) {
    state.next_operation += 1;
    let name = format!("{resource}/operations/{}", state.next_operation);
    if polls == 0 {
        return (StatusCode::OK, finished(&name, error));
    }
    state.operations.insert(
        name.clone(),
        PendingOperation {
            polls_remaining: polls,
            error,
        },
    );
    (StatusCode::OK, json!({ "name": name, "done": false }))
}

fn finished(name: &str, error: Option<(i32, String)>) -> Value {
    match error {
        Some((code, message)) => {
            json!({ "name": name, "done": true, "error": {"code": code, "message": message} })
        }
        None => json!({ "name": name, "done": true, "response": {} }),
    }
}

fn status_error(status: StatusCode, name: &str, resource: &str) -> (StatusCode, Value) {
    (
        status,
        json!({ "error": { "code": status.as_u16(), "message": format!("{name}: {resource}"), "status": name } }),
    )
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: None,
        base_delay_ms: 20,
        max_delay_ms: 100,
        poll_interval_ms: 10,
    }
}
