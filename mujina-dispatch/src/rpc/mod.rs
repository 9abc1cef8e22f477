//! JSON-RPC over HTTP for getwork, getblocktemplate and solo pools.
//!
//! One [`RpcClient`] (a pooled `reqwest::Client`) is shared by the scheduler,
//! longpoll tasks and submission workers. Replies carry the few pool headers
//! that change how work is handled.

pub mod gbt;
pub mod getwork;
pub mod longpoll;
pub mod probe;
pub mod solo;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::tracing::prelude::*;

/// Timeout for ordinary calls.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Longpoll requests are held open by the server until a block arrives.
pub const LONGPOLL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Headers pools use to steer work handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyHeaders {
    /// `X-Long-Polling`: path or URL of the longpoll endpoint.
    pub long_polling: Option<String>,

    /// `X-Roll-NTime`: `Y` or `expire=N`.
    pub roll_ntime: Option<String>,

    /// `X-Reject-Reason`
    pub reject_reason: Option<String>,
}

impl ReplyHeaders {
    fn from_map(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            long_polling: get("x-long-polling"),
            roll_ntime: get("x-roll-ntime"),
            reject_reason: get("x-reject-reason"),
        }
    }

    /// Seconds the work may be rolled, or 0 if the pool does not allow it.
    pub fn rolltime(&self, scan_time: u32) -> u32 {
        let Some(value) = self.roll_ntime.as_deref() else {
            return 0;
        };
        if value.eq_ignore_ascii_case("y") {
            return scan_time;
        }
        value
            .strip_prefix("expire=")
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// A successful JSON-RPC reply.
#[derive(Debug, Clone)]
pub struct RpcReply {
    /// The `result` member; `null` is a valid result.
    pub result: Value,
    pub headers: ReplyHeaders,
}

#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    next_id: std::sync::Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("mujina-dispatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        })
    }

    /// Call `method` on the pool's endpoint.
    pub async fn call(&self, pool: &Pool, method: &str, params: Value) -> Result<RpcReply> {
        self.call_url(pool, &pool.url, method, params, CALL_TIMEOUT)
            .await
    }

    /// Call `method` on an explicit URL with the pool's credentials.
    pub async fn call_url(
        &self,
        pool: &Pool,
        url: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<RpcReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"method": method, "params": params, "id": id});
        trace!(url, method, id, "JSON-RPC request");

        let response = self
            .http
            .post(url)
            .basic_auth(&pool.user, Some(&pool.pass))
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;

        let headers = ReplyHeaders::from_map(response.headers());
        let status = response.status();
        let reply: Value = response.json().await.map_err(|e| {
            if status.is_success() {
                Error::Http(e)
            } else {
                Error::Protocol(format!("HTTP {status} from {url}"))
            }
        })?;

        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(Error::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-1),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
            });
        }

        let result = reply
            .get("result")
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("{method} reply has no result")))?;
        Ok(RpcReply { result, headers })
    }
}

/// Resolve a longpoll path against the pool URL.
pub fn longpoll_url(pool_url: &str, lp: &str) -> String {
    if lp.starts_with("http://") || lp.starts_with("https://") {
        return lp.to_string();
    }
    let base = pool_url.trim_end_matches('/');
    let root = match base.find("://") {
        Some(scheme_end) => match base[scheme_end + 3..].find('/') {
            Some(path_start) => &base[..scheme_end + 3 + path_start],
            None => base,
        },
        None => base,
    };
    if lp.starts_with('/') {
        format!("{root}{lp}")
    } else {
        format!("{root}/{lp}")
    }
}

/// Fetch a string field from a JSON object.
pub(crate) fn str_field<'a>(value: &'a Value, name: &str) -> Result<&'a str> {
    value
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol(format!("missing field {name}")))
}

/// Fetch an unsigned integer field from a JSON object.
pub(crate) fn u64_field(value: &Value, name: &str) -> Result<u64> {
    value
        .get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Protocol(format!("missing field {name}")))
}

#[cfg(test)]
pub(crate) mod test_server {
    //! A scripted JSON-RPC node served by axum on a loopback port.

    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[derive(Default)]
    pub struct Script {
        /// Result per method.
        pub results: HashMap<String, Value>,
        /// Extra response headers.
        pub headers: Vec<(&'static str, String)>,
        /// Requests seen, in order.
        pub calls: Vec<Value>,
    }

    pub type Shared = Arc<Mutex<Script>>;

    async fn handle(State(script): State<Shared>, Json(request): Json<Value>) -> (HeaderMap, Json<Value>) {
        let mut script = script.lock();
        script.calls.push(request.clone());
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let mut headers = HeaderMap::new();
        for (name, value) in &script.headers {
            headers.insert(*name, value.parse().unwrap());
        }
        let body = match script.results.get(&method) {
            Some(result) => json!({"result": result, "error": null, "id": request["id"]}),
            None => json!({"result": null, "error": {"code": -32601, "message": "Method not found"}, "id": request["id"]}),
        };
        (headers, Json(body))
    }

    /// Serve `script` and return the base URL.
    pub async fn serve(script: Shared) -> String {
        let app = Router::new()
            .route("/", post(handle))
            .route("/lp", post(handle))
            .with_state(script);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}
