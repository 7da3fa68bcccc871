//! Integration tests for proxy bootstrap
//!
//! These tests start the proxy against an unreachable control plane, so
//! every forwarded request ends in a gateway error.

use std::collections::HashSet;
use std::sync::Arc;

use kube::{Client, Config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use operator_api_proxy::controllermap::InMemoryControllerMap;
use operator_api_proxy::proxy::{run, Options, DEFAULT_ADDRESS, DEFAULT_PORT};
use operator_api_proxy::Error;

// ============================================================================
// Test Helpers
// ============================================================================

fn unreachable_client() -> Client {
    Client::try_from(Config::new("http://127.0.0.1:1".parse().unwrap())).unwrap()
}

fn options() -> Options {
    let mut options = Options::new(unreachable_client());
    options.address = "127.0.0.1".to_string();
    options.port = 0;
    options.controller_map = Some(Arc::new(InMemoryControllerMap::new()));
    options.watched_namespaces = Some(HashSet::from([String::new()]));
    options.disable_cache = true;
    options
}

async fn raw_request(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn defaults() {
    let options = Options::new(unreachable_client());
    assert_eq!(options.address, DEFAULT_ADDRESS);
    assert_eq!(options.port, DEFAULT_PORT);
    assert!(options.owner_injection);
    assert!(!options.disable_cache);
    assert!(!options.log_requests);
}

#[tokio::test]
async fn missing_controller_map_is_a_config_error() {
    let mut options = options();
    options.controller_map = None;

    let (done, _) = oneshot::channel();
    let err = run(done, options).await.unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
}

#[tokio::test]
async fn missing_watched_namespaces_is_a_config_error() {
    let mut options = options();
    options.watched_namespaces = None;

    let (done, _) = oneshot::channel();
    let err = run(done, options).await.unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
}

// ============================================================================
// Serving
// ============================================================================

#[tokio::test]
async fn forwards_to_the_control_plane() {
    let (done, _done_rx) = oneshot::channel();
    let addr = run(done, options()).await.unwrap();
    assert_ne!(addr.port(), 0);

    let response = raw_request(
        addr,
        "GET /version HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    assert!(response.contains("\"kind\":\"Status\""));
}

#[tokio::test]
async fn user_hook_wraps_upstream() {
    use async_trait::async_trait;
    use hyper::body::Bytes;
    use hyper::{Request, Response};
    use operator_api_proxy::handlers::{full, Handler, ProxyBody};

    struct Teapot;

    #[async_trait]
    impl Handler for Teapot {
        async fn handle(&self, _req: Request<Bytes>) -> Response<ProxyBody> {
            let mut response = Response::new(full("short and stout"));
            *response.status_mut() = hyper::StatusCode::IM_A_TEAPOT;
            response
        }
    }

    let mut options = options();
    options.handler = Some(Box::new(|_upstream: Arc<dyn Handler>| {
        Arc::new(Teapot) as Arc<dyn Handler>
    }));

    let (done, _done_rx) = oneshot::channel();
    let addr = run(done, options).await.unwrap();

    let response = raw_request(
        addr,
        "POST /api/v1/namespaces/default/configmaps HTTP/1.1\r\nHost: localhost\r\n\
         Content-Length: 2\r\nConnection: close\r\n\r\n{}",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 418"), "{response}");
    assert!(response.ends_with("short and stout"));
}
