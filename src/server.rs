//! Health-check HTTP server
//!
//! A single unauthenticated `GET /` answering with a fixed plain-text body,
//! used by the hosting platform to tell the process is alive.

use crate::config::HEALTH_MESSAGE;
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

/// Router exposing the health endpoint
pub fn router() -> Router {
    Router::new().route("/", get(health))
}

async fn health() -> &'static str {
    HEALTH_MESSAGE
}

/// Serves the health endpoint on `port` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve<F>(port: u16, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Health server listening on {}", listener.local_addr()?);

    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_returns_ok_with_banner() {
        let response = router()
            .oneshot(Request::get("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.expect("body");
        assert_eq!(&body[..], HEALTH_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let response = router()
            .oneshot(Request::get("/admin").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
