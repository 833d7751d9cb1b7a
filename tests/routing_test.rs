//! Routing tests against live loopback backends
//!
//! The gateway here accepts requests and never answers, so every attempt
//! against it ends in a router timeout.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use nilstore_core::backoff::BackoffConfig;
use nilstore_core::retrieval::HEADER_PROVIDER;
use nilstore_core::transport::{Backend, ErrorClass, RoutePreference, RouterOptions, TransportRouter};
use nilstore_core::{DealId, Endpoints, ManifestRoot, RetrievalRequest, Retriever};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONTENT: &[u8] = b"routed bytes";

#[derive(Clone, Default)]
struct Backendish {
    hang: bool,
    hits: Arc<AtomicUsize>,
}

async fn serve_fetch(State(server): State<Backendish>) -> impl IntoResponse {
    server.hits.fetch_add(1, Ordering::SeqCst);
    if server.hang {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
    (StatusCode::OK, [(HEADER_PROVIDER, "sp1")], CONTENT)
}

async fn spawn(server: Backendish) -> String {
    let app = Router::new()
        .route("/gateway/fetch/:root", get(serve_fetch))
        .with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn request() -> RetrievalRequest {
    RetrievalRequest::new(
        DealId(3),
        ManifestRoot::from_bytes([0x42; 32]),
        "nil1owner",
        "clip.bin",
    )
}

#[tokio::test]
async fn test_timed_out_gateway_backs_off_with_growing_delays() {
    let gateway = Backendish {
        hang: true,
        ..Backendish::default()
    };
    let provider = Backendish::default();

    let router = TransportRouter::new(RouterOptions {
        preference: RoutePreference::PreferGateway,
        request_timeout: Duration::from_millis(150),
        backoff: BackoffConfig {
            base_ms: 400,
            max_ms: 5_000,
            factor: 2,
            jitter_ms: 0,
        },
        ..RouterOptions::default()
    });
    let retriever = Retriever::new(
        router,
        Endpoints {
            gateway_base: Some(spawn(gateway.clone()).await),
            provider_base: Some(spawn(provider.clone()).await),
            p2p_peers: Vec::new(),
        },
    )
    .unwrap();
    let cancel = CancellationToken::new();

    // First timeout: fall back to the provider
    let first = retriever.fetch(&request(), &cancel).await.unwrap();
    assert_eq!(first.backend, Backend::DirectSp);
    assert_eq!(first.data, CONTENT);
    assert_eq!(first.trace.attempts[0].error_class, Some(ErrorClass::Timeout));
    assert_eq!(gateway.hits.load(Ordering::SeqCst), 1);
    let first_delay = retriever.router().retry_in(Backend::Gateway);
    assert!(first_delay > Duration::ZERO);

    // Inside the window the gateway is skipped without a request
    let skipped = retriever.fetch(&request(), &cancel).await.unwrap();
    assert!(skipped.trace.attempts[0].skipped);
    assert_eq!(gateway.hits.load(Ordering::SeqCst), 1);

    tokio::time::sleep(first_delay + Duration::from_millis(20)).await;
    assert!(retriever.router().can_attempt(Backend::Gateway));

    // Second consecutive timeout
    let second = retriever.fetch(&request(), &cancel).await.unwrap();
    assert_eq!(second.trace.attempts[0].error_class, Some(ErrorClass::Timeout));
    assert_eq!(gateway.hits.load(Ordering::SeqCst), 2);
    assert_eq!(retriever.router().failures(Backend::Gateway), 2);
    let second_delay = retriever.router().retry_in(Backend::Gateway);
    assert!(
        second_delay > first_delay,
        "{:?} <= {:?}",
        second_delay,
        first_delay
    );

    // No third probe before the next allowed time
    let third = retriever.fetch(&request(), &cancel).await.unwrap();
    assert!(third.trace.attempts[0].skipped);
    assert_eq!(gateway.hits.load(Ordering::SeqCst), 2);
    assert_eq!(provider.hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_unreachable_backends_exhaust_with_trace() {
    let dead = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    };
    let retriever = Retriever::new(
        TransportRouter::new(RouterOptions::default()),
        Endpoints {
            gateway_base: Some(dead.clone()),
            provider_base: Some(dead),
            p2p_peers: Vec::new(),
        },
    )
    .unwrap();

    let err = retriever
        .fetch(&request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "unreachable");
    let trace = err.trace().unwrap();
    assert_eq!(trace.executed().count(), 2);
    assert_eq!(trace.chosen, None);
}
