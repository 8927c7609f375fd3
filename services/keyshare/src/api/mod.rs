//! HTTP surface of the account console.

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    Extension,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    services::ServeDir,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

use crate::sessions::spawn_sweeper;

pub mod email;
pub mod error;
pub mod handlers;
mod openapi;

pub use handlers::console::state::{ConsoleConfig, ConsoleState};
pub use openapi::openapi;

/// Serve the account console until interrupted.
///
/// # Errors
/// Returns an error when a CORS origin is malformed or the listener cannot
/// be bound.
pub async fn serve(
    port: u16,
    state: Arc<ConsoleState>,
    cors_allowed_origins: Vec<String>,
    static_path: Option<String>,
) -> Result<()> {
    let mut origins = Vec::with_capacity(cors_allowed_origins.len());
    for origin in &cors_allowed_origins {
        origins.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("Invalid CORS origin: {origin}"))?,
        );
    }
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION, CACHE_CONTROL])
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true);

    let (router, _openapi) = openapi::api_router().split_for_parts();
    let mut app = router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors)
            .layer(Extension(Arc::clone(&state))),
    );
    if let Some(path) = static_path {
        app = app.nest_service("/static", ServeDir::new(path));
    }

    // Expired sessions are swept in the background for as long as the
    // server runs.
    let sweeper = spawn_sweeper(Arc::clone(&state.sessions));

    let listener = TcpListener::bind(format!("[::]:{port}")).await?;
    info!("Listening on [::]:{port}");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutting down");
        })
        .await;

    sweeper.abort();
    served.map_err(Into::into)
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
