// src/adapter/http.rs
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{StatusCode, header::HOST, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::envelope::{Envelope, HttpMethod, HttpRequest};
use crate::signature::Signer;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct HttpState {
    pub dispatcher: Arc<Dispatcher>,
    pub signer: Signer,
}

/// Every path falls through to the dispatcher; the router collaborator decides what matches.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(addr: SocketAddr, state: HttpState, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Started HTTP server on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn handle(State(state): State<HttpState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let Ok(method) = parts.method.as_str().parse::<HttpMethod>() else {
        return detail(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    };
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "could not read request body");
            return detail(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
        }
    };

    let mut request = HttpRequest::new(method, request_url(&parts)).with_body(body.to_vec());
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }

    let envelope = Envelope::from_request(request, &state.signer);
    let context = envelope.context.clone();
    match state.dispatcher.dispatch(envelope).await {
        DispatchOutcome::Handled { response, .. } => {
            let status = context
                .reply_status()
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::OK);
            (status, Json(response)).into_response()
        }
        DispatchOutcome::NoHandler => detail(StatusCode::NOT_FOUND, "Not Found"),
        DispatchOutcome::HandlerFailed { error, .. } => {
            warn!(method = %method, uri = %parts.uri, %error, "request handler failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
        DispatchOutcome::FanOut(_) => detail(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
    }
}

fn request_url(parts: &Parts) -> String {
    let target = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    if parts.uri.scheme().is_some() {
        return parts.uri.to_string();
    }
    match parts.headers.get(HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => format!("http://{host}{target}"),
        None => target.to_string(),
    }
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}
