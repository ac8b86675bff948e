use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{LimiterError, Result};

/// Serve `/metrics` (Prometheus text format) and `/health` until `shutdown`
/// flips to `true`.
pub async fn start_observability_server(
    port: u16,
    registry: Registry,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let registry = Arc::new(registry);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(?addr, "Observability server started (metrics + health checks)");

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    info!("Observability server shutting down");
                    break;
                }
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Observability server: accept error");
                        continue;
                    }
                };

                let registry = registry.clone();
                tokio::spawn(async move {
                    let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let registry = registry.clone();
                        async move { Ok::<_, hyper::Error>(route(req.uri().path(), &registry)) }
                    });
                    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(?peer, error = %e, "Observability server: connection error");
                    }
                });
            }
        }
    }

    Ok(())
}

fn route(path: &str, registry: &Registry) -> Response<Full<Bytes>> {
    let response = match path {
        "/metrics" => metrics_response(registry),
        "/health" => health_response(),
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };
    response.unwrap_or_else(|e| {
        warn!(error = %e, "Observability server: failed to build response");
        Response::new(Full::new(Bytes::from_static(b"Internal Server Error")))
    })
}

fn metrics_response(registry: &Registry) -> Result<Response<Full<Bytes>>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| LimiterError::Telemetry(format!("Failed to encode metrics: {e}")))?;

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .map_err(|e| LimiterError::Telemetry(format!("Failed to build response: {e}")))
}

fn health_response() -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(&json!({"status": "healthy"})).map_err(|e| {
        LimiterError::Telemetry(format!("Failed to serialize health response: {e}"))
    })?;

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| LimiterError::Telemetry(format!("Failed to build health response: {e}")))
}

fn plain(status: StatusCode, text: &'static str) -> Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(text.as_bytes())))
        .map_err(|e| LimiterError::Telemetry(format!("Failed to build response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        let registry = Registry::default();
        assert_eq!(route("/health", &registry).status(), StatusCode::OK);
        assert_eq!(route("/metrics", &registry).status(), StatusCode::OK);
        assert_eq!(route("/nope", &registry).status(), StatusCode::NOT_FOUND);
    }
}
