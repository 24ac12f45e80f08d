use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;
use session_stream_error::{ProblemDetails, StreamError};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::multiplexer::StreamMultiplexer;
use crate::session::{SessionStatus, StreamInfo};

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct AbortResponse {
    aborted: bool,
}

#[derive(Debug, Serialize)]
struct SessionListResponse {
    sessions: Vec<StreamInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem = match &self {
            ApiError::Stream(err) => ProblemDetails::from(err),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(problem)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

pub fn build_router(mux: StreamMultiplexer) -> Router {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id/stream", get(get_stream))
        .route("/sessions/:session_id/status", get(get_status))
        .route("/sessions/:session_id/abort", post(post_abort))
        .with_state(mux);

    let mut router = Router::new().nest("/v1", v1_router).fallback(not_found);

    let http_logging = match std::env::var("SESSION_STREAM_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::debug!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn get_stream(
    State(mux): State<StreamMultiplexer>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let subscription = mux.start_or_join(&session_id).await?;
    let body = Body::from_stream(
        subscription.map(|event| Ok::<_, Infallible>(event.into_bytes())),
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response())
}

async fn get_status(
    State(mux): State<StreamMultiplexer>,
    Path(session_id): Path<String>,
) -> Json<SessionStatus> {
    Json(mux.status(&session_id).await)
}

async fn post_abort(
    State(mux): State<StreamMultiplexer>,
    Path(session_id): Path<String>,
) -> Json<AbortResponse> {
    Json(AbortResponse {
        aborted: mux.abort(&session_id).await,
    })
}

async fn list_sessions(State(mux): State<StreamMultiplexer>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: mux.list().await,
    })
}

async fn not_found() -> Response {
    let problem = ProblemDetails {
        type_: "about:blank".to_string(),
        title: "Not Found".to_string(),
        status: StatusCode::NOT_FOUND.as_u16(),
        detail: Some("route not found".to_string()),
        instance: None,
        extensions: Default::default(),
    };
    (StatusCode::NOT_FOUND, Json(problem)).into_response()
}
