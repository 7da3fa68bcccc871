//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Requests received by the proxy, by resolved verb
    pub static ref PROXY_REQUESTS: CounterVec = register_counter_vec!(
        "operator_api_proxy_requests_total",
        "Total number of proxied requests",
        &["verb"]
    ).unwrap();

    /// GET requests by how the cache layer handled them
    pub static ref CACHE_RESPONSES: CounterVec = register_counter_vec!(
        "operator_api_proxy_cache_responses_total",
        "Total number of GET requests by cache result",
        &["result"]
    ).unwrap();

    /// Dependent watches registered, by enqueue strategy
    pub static ref DEPENDENT_WATCHES: CounterVec = register_counter_vec!(
        "operator_api_proxy_dependent_watches_total",
        "Total number of dependent watches registered",
        &["strategy"]
    ).unwrap();

    /// Failed dependent watch registrations
    pub static ref DEPENDENT_WATCH_ERRORS: CounterVec = register_counter_vec!(
        "operator_api_proxy_dependent_watch_errors_total",
        "Total number of failed dependent watch registrations",
        &["strategy"]
    ).unwrap();

    /// Full discovery refreshes, by consumer
    pub static ref DISCOVERY_REFRESHES: CounterVec = register_counter_vec!(
        "operator_api_proxy_discovery_refreshes_total",
        "Total number of discovery refreshes",
        &["source"]
    ).unwrap();

    /// Owner reconcile requests enqueued from dependent events
    pub static ref ENQUEUED_REQUESTS: CounterVec = register_counter_vec!(
        "operator_api_proxy_enqueued_requests_total",
        "Total number of owner reconcile requests enqueued",
        &["kind"]
    ).unwrap();

    /// Proxy health (1 = serving, 0 = not serving)
    pub static ref PROXY_HEALTH: Gauge = register_gauge!(
        "operator_api_proxy_health",
        "Proxy health status (1 = serving, 0 = not serving)"
    ).unwrap();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving metrics connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => ready_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

/// Ready once the proxy listener is bound
fn ready_response() -> Response<Full<Bytes>> {
    if PROXY_HEALTH.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "proxy not serving")
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
