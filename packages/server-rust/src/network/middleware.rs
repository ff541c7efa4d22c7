//! Transport-level middleware.
//!
//! Ordering is outer-to-inner: the first layer listed sees the request first
//! and the response last. Tenant binding and authentication are applied per
//! route group in [`NetworkModule`](super::NetworkModule), inside this stack.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::catch_panic::{CatchPanicLayer, DefaultResponseForPanic};
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;
use super::shutdown::ShutdownController;

type HttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<
        TimeoutLayer,
        Stack<
            CorsLayer,
            Stack<
                CompressionLayer,
                Stack<
                    CatchPanicLayer<DefaultResponseForPanic>,
                    Stack<
                        TraceLayer<SharedClassifier<ServerErrorsAsFailures>>,
                        Stack<SetRequestIdLayer<MakeRequestUuid>, Identity>,
                    >,
                >,
            >,
        >,
    >,
>;

/// Builds the transport middleware stack.
///
/// 1. `SetRequestId`: UUID v4 `x-request-id`, reused as the tenant span's trace id
/// 2. `Trace`
/// 3. `CatchPanic`: a panicking handler becomes a 500 after the tenant
///    binding layer has unwound and released its session
/// 4. `Compression`
/// 5. `CORS`
/// 6. `Timeout`: cancels the request future; unbind still runs
/// 7. `PropagateRequestId`
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static("x-request-id");

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

/// Rejects API requests once draining starts and counts the rest as in flight.
pub async fn track_in_flight(
    State(shutdown): State<Arc<ShutdownController>>,
    req: Request,
    next: Next,
) -> Response {
    if !shutdown.health_state().accepts_requests() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let _guard = shutdown.in_flight_guard();
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;

    fn guarded(shutdown: &Arc<ShutdownController>) -> Router {
        let counter = Arc::clone(shutdown);
        Router::new()
            .route(
                "/",
                get(move || async move { counter.in_flight_count().to_string() }),
            )
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(shutdown),
                track_in_flight,
            ))
    }

    #[test]
    fn layers_build_with_custom_config() {
        let config = NetworkConfig {
            request_timeout: Duration::from_secs(5),
            cors_origins: vec!["https://example.com".to_string()],
            ..NetworkConfig::default()
        };
        let _layers = build_http_layers(&config);
    }

    #[tokio::test]
    async fn in_flight_counted_during_request() {
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.set_ready();
        let response = guarded(&shutdown)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"1");
        assert_eq!(shutdown.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn draining_rejects_new_requests() {
        let shutdown = Arc::new(ShutdownController::new());
        shutdown.trigger_shutdown();
        let response = guarded(&shutdown)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
