#![allow(missing_docs)]

mod common;

use common::{immediate, ip};
use floodgate::prelude::*;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceBuilder, ServiceExt};

#[derive(Debug, Clone)]
struct HttpRequest {
    peer: Option<std::net::IpAddr>,
    path: String,
}

fn by_peer_and_path(req: &HttpRequest) -> Result<ClientIdentity, UnresolvedClientIdentity> {
    match req.peer {
        Some(addr) => Ok(ClientIdentity::new(addr, req.path.clone())),
        None => Err(UnresolvedClientIdentity::new("request has no peer address")),
    }
}

fn request(last: u8, path: &str) -> HttpRequest {
    HttpRequest { peer: Some(ip(last)), path: path.to_string() }
}

#[tokio::test(start_paused = true)]
async fn denied_requests_never_reach_inner_service() {
    let engine = AdmissionEngine::new(Config { default_rps: Some(1), ..immediate() }.resolve());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::new(engine.clone(), by_peer_and_path))
        .service(service_fn(move |_req: HttpRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Infallible>("ok") }
        }));

    assert!(svc.clone().oneshot(request(1, "/a")).await.is_ok());
    let err = svc.clone().oneshot(request(1, "/a")).await.unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(err.status_code(), 429);
    assert_eq!(err.to_string(), "rate limit exceeded for /a");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(svc.clone().oneshot(request(1, "/a")).await.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn identity_failure_is_distinct_from_rate_limit() {
    let engine = AdmissionEngine::new(immediate().resolve());
    let svc = AdmissionLayer::new(engine.clone(), by_peer_and_path)
        .layer(service_fn(|_req: HttpRequest| async { Ok::<_, Infallible>(()) }));

    let err = svc.oneshot(HttpRequest { peer: None, path: "/a".into() }).await.unwrap_err();
    assert!(err.is_unidentified());
    assert!(!err.is_rate_limited());
    assert_eq!(err.status_code(), 401);
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn inner_errors_pass_through() {
    let engine = AdmissionEngine::new(immediate().resolve());
    let svc = AdmissionLayer::new(engine, by_peer_and_path).layer(service_fn(|_req: HttpRequest| async {
        Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "backend down"))
    }));

    let err = svc.oneshot(request(1, "/a")).await.unwrap_err();
    assert_eq!(err.status_code(), 500);
    assert_eq!(err.into_inner().map(|e| e.to_string()), Some("backend down".to_string()));
}

#[tokio::test(start_paused = true)]
async fn closures_work_as_identifiers() {
    let engine = AdmissionEngine::new(immediate().resolve());
    let fixed = ip(9);
    let layer = AdmissionLayer::new(engine.clone(), move |req: &HttpRequest| {
        Ok::<_, UnresolvedClientIdentity>(ClientIdentity::new(fixed, req.path.clone()))
    });
    let svc = layer.layer(service_fn(|_req: HttpRequest| async { Ok::<_, Infallible>(()) }));

    svc.clone().oneshot(HttpRequest { peer: None, path: "/x".into() }).await.unwrap();
    assert!(engine.registry().contains(fixed, "/x"));
}
