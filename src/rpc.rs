//! HTTP RPC endpoint
//!
//! A single POST endpoint accepts `{id, method, params}` envelopes and
//! always answers HTTP 200 with `{id, data}` or `{id, error}`; GET at the
//! root returns the info snapshot. CORS mirrors the request origin, and
//! panics inside handlers become HTTP 500 `{"error":"server error"}`.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::router::Router;
use crate::turn;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Request envelope
#[derive(Debug, Default, Deserialize)]
pub struct Call {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub config: Arc<Config>,
}

/// Build the HTTP router with CORS, tracing, panic recovery, and the
/// request deadline.
pub fn build_router(state: AppState) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::OPTIONS, Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("mixin-conversation-id"),
        ])
        .max_age(Duration::from_secs(600));

    axum::Router::new()
        .route("/", get(root_handler).post(rpc_handler))
        .layer(cors)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("panic");
    tracing::error!(%detail, "request handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "server error"})),
    )
        .into_response()
}

/// GET / returns the info snapshot under a fresh request id
async fn root_handler(State(state): State<AppState>) -> Response {
    let info = state.router.info().await;
    Json(json!({
        "id": Uuid::new_v4().to_string(),
        "data": info,
    }))
    .into_response()
}

async fn rpc_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Call>, JsonRejection>,
) -> Response {
    let call = match payload {
        Ok(Json(call)) => call,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": rejection.body_text()})),
            )
                .into_response();
        }
    };

    let start = Instant::now();
    info!(id = %call.id, method = %call.method, params = %serde_json::Value::Array(call.params.clone()), "rpc call");

    let result = dispatch(&state, &call).await;
    let elapsed = start.elapsed().as_secs_f64();
    let body = match result {
        Ok(data) => {
            info!(id = %call.id, method = %call.method, elapsed, "rpc ok");
            json!({"id": call.id, "data": data})
        }
        Err(err) => {
            info!(id = %call.id, method = %call.method, elapsed, %err, "rpc error");
            json!({"id": call.id, "error": err})
        }
    };
    Json(body).into_response()
}

async fn dispatch(state: &AppState, call: &Call) -> Result<Value> {
    let router = &state.router;
    let params = &call.params;
    match call.method.as_str() {
        "turn" => {
            expect_arity(params, 1)?;
            let uid = param_str(params, 0, "uid")?;
            let servers = turn::ice_servers(&state.config.turn, &uid)?;
            Ok(serde_json::to_value(servers).unwrap_or_default())
        }
        "info" => {
            let info = router.info().await;
            Ok(serde_json::to_value(info).unwrap_or_default())
        }
        "list" => {
            expect_arity(params, 1)?;
            let rid = param_str(params, 0, "rid")?;
            let peers = router.list(&rid).await?;
            Ok(json!({ "peers": peers }))
        }
        "mute" => {
            expect_arity(params, 2)?;
            let rid = param_str(params, 0, "rid")?;
            let uid = param_str(params, 1, "uid")?;
            let peer = router.mute(&rid, &uid).await?;
            Ok(json!({ "peer": peer }))
        }
        "publish" => {
            if !matches!(params.len(), 3 | 5 | 6) {
                return Err(Error::InvalidParams(format!(
                    "invalid params count {}",
                    params.len()
                )));
            }
            let rid = param_str(params, 0, "rid")?;
            let uid = param_str(params, 1, "uid")?;
            let jsep = param_str(params, 2, "sdp")?;

            let mut limit = 0i64;
            let mut callback = None;
            if params.len() >= 5 {
                limit = param_i64(params, 3, "limit")?;
                let value = param_str(params, 4, "callback")?;
                if !value.is_empty() {
                    if !value.starts_with("https://") {
                        return Err(Error::InvalidParams(format!(
                            "invalid callback value {value}"
                        )));
                    }
                    callback = Some(value);
                }
            }
            let listen_only = if params.len() == 6 {
                param_bool_lenient(params, 5)
            } else {
                false
            };

            let (cid, answer) = router
                .publish(&rid, &uid, &jsep, limit, callback, listen_only)
                .await?;
            let jsep = serde_json::to_string(&answer).unwrap_or_default();
            Ok(json!({ "track": cid, "sdp": answer, "jsep": jsep }))
        }
        "restart" => {
            expect_arity(params, 4)?;
            let (rid, uid, cid) = param_ids(params)?;
            let jsep = param_str(params, 3, "jsep")?;
            let answer = router.restart(&rid, &uid, &cid, &jsep).await?;
            let jsep = serde_json::to_string(&answer).unwrap_or_default();
            Ok(json!({ "jsep": jsep }))
        }
        "end" => {
            expect_arity(params, 3)?;
            let (rid, uid, cid) = param_ids(params)?;
            router.end(&rid, &uid, &cid).await?;
            Ok(json!({}))
        }
        "trickle" => {
            expect_arity(params, 4)?;
            let (rid, uid, cid) = param_ids(params)?;
            let candidate = param_str(params, 3, "candidate")?;
            router.trickle(&rid, &uid, &cid, &candidate).await?;
            Ok(json!({}))
        }
        "subscribe" => {
            expect_arity(params, 3)?;
            let (rid, uid, cid) = param_ids(params)?;
            let offer = router.subscribe(&rid, &uid, &cid).await?;
            let jsep = serde_json::to_string(&offer).unwrap_or_default();
            Ok(json!({ "type": offer.sdp_type, "sdp": offer.sdp, "jsep": jsep }))
        }
        "answer" => {
            expect_arity(params, 4)?;
            let (rid, uid, cid) = param_ids(params)?;
            let jsep = param_str(params, 3, "sdp")?;
            router.answer(&rid, &uid, &cid, &jsep).await?;
            Ok(json!({}))
        }
        other => Err(Error::InvalidParams(format!("invalid method {other}"))),
    }
}

fn expect_arity(params: &[Value], want: usize) -> Result<()> {
    if params.len() != want {
        return Err(Error::InvalidParams(format!(
            "invalid params count {}",
            params.len()
        )));
    }
    Ok(())
}

fn param_str(params: &[Value], index: usize, name: &str) -> Result<String> {
    match params.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        other => Err(Error::InvalidParams(format!(
            "invalid {name} type {other:?}"
        ))),
    }
}

fn param_ids(params: &[Value]) -> Result<(String, String, String)> {
    Ok((
        param_str(params, 0, "rid")?,
        param_str(params, 1, "uid")?,
        param_str(params, 2, "cid")?,
    ))
}

/// Permissive integer parse: accepts a JSON number or its string form.
fn param_i64(params: &[Value], index: usize, name: &str) -> Result<i64> {
    let value = params.get(index);
    let parsed = match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::InvalidParams(format!("invalid {name} type {value:?}")))
}

/// Lenient boolean parse from the value's string form; anything
/// unrecognised is false.
fn param_bool_lenient(params: &[Value], index: usize) -> bool {
    match params.get(index) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.as_str(), "1" | "t" | "T" | "true" | "TRUE" | "True"),
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}
