//! Tower middleware that runs every request through an [`AdmissionEngine`].
//!
//! The layer needs to know who is calling which endpoint. That mapping is
//! protocol-specific, so it is supplied as an [`IdentifyRequest`]; any
//! `Fn(&Req) -> Result<ClientIdentity, UnresolvedClientIdentity>` works.
//! Requests that cannot be identified are rejected before the engine sees them.

use crate::engine::AdmissionEngine;
use crate::error::{AdmissionError, UnresolvedClientIdentity};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

/// Who is calling and what they are calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Caller address.
    pub addr: IpAddr,
    /// Logical endpoint name.
    pub endpoint: String,
}

impl ClientIdentity {
    /// Identity for `addr` calling `endpoint`.
    pub fn new(addr: IpAddr, endpoint: impl Into<String>) -> Self {
        Self { addr, endpoint: endpoint.into() }
    }
}

/// Extracts a [`ClientIdentity`] from a request.
pub trait IdentifyRequest<Req>: Send + Sync {
    /// Identify the caller of `req`.
    fn identify(&self, req: &Req) -> Result<ClientIdentity, UnresolvedClientIdentity>;
}

impl<Req, F> IdentifyRequest<Req> for F
where
    F: Fn(&Req) -> Result<ClientIdentity, UnresolvedClientIdentity> + Send + Sync,
{
    fn identify(&self, req: &Req) -> Result<ClientIdentity, UnresolvedClientIdentity> {
        self(req)
    }
}

/// Layer that gates a service behind an [`AdmissionEngine`].
pub struct AdmissionLayer<I> {
    engine: AdmissionEngine,
    identify: Arc<I>,
}

impl<I> AdmissionLayer<I> {
    /// Gate services with `engine`, identifying callers with `identify`.
    pub fn new(engine: AdmissionEngine, identify: I) -> Self {
        Self { engine, identify: Arc::new(identify) }
    }
}

impl<I> Clone for AdmissionLayer<I> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), identify: self.identify.clone() }
    }
}

impl<I> std::fmt::Debug for AdmissionLayer<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLayer").field("engine", &self.engine).finish_non_exhaustive()
    }
}

impl<S, I> Layer<S> for AdmissionLayer<I> {
    type Service = AdmissionService<S, I>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, engine: self.engine.clone(), identify: self.identify.clone() }
    }
}

/// Service produced by [`AdmissionLayer`].
pub struct AdmissionService<S, I> {
    inner: S,
    engine: AdmissionEngine,
    identify: Arc<I>,
}

impl<S: Clone, I> Clone for AdmissionService<S, I> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), engine: self.engine.clone(), identify: self.identify.clone() }
    }
}

impl<S: std::fmt::Debug, I> std::fmt::Debug for AdmissionService<S, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl<S, I, Req> Service<Req> for AdmissionService<S, I>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    I: IdentifyRequest<Req> + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Keep the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let engine = self.engine.clone();
        let identity = self.identify.identify(&req);

        Box::pin(async move {
            let identity = identity.map_err(|e| {
                debug!(target: "floodgate::middleware", error = %e, "rejecting unidentified request");
                AdmissionError::Unidentified(e)
            })?;
            if engine.admit(identity.addr, &identity.endpoint).await.is_allowed() {
                inner.call(req).await.map_err(AdmissionError::Inner)
            } else {
                Err(AdmissionError::RateLimited { endpoint: identity.endpoint })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::convert::Infallible;
    use std::net::Ipv4Addr;
    use tower::{service_fn, ServiceExt};

    #[derive(Debug, Clone)]
    struct Request {
        peer: Option<IpAddr>,
        path: &'static str,
    }

    fn identify(req: &Request) -> Result<ClientIdentity, UnresolvedClientIdentity> {
        req.peer
            .map(|addr| ClientIdentity::new(addr, req.path))
            .ok_or_else(|| UnresolvedClientIdentity::new("no peer address"))
    }

    fn engine() -> AdmissionEngine {
        AdmissionEngine::new(Config { max_wait_ms: Some(0), ..Default::default() }.resolve())
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_then_rejects() {
        let layer = AdmissionLayer::new(engine(), identify);
        let svc = layer.layer(service_fn(|req: Request| async move { Ok::<_, Infallible>(req.path) }));
        let req = Request { peer: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), path: "/a" };

        assert_eq!(svc.clone().oneshot(req.clone()).await.unwrap(), "/a");
        let err = svc.clone().oneshot(req).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.status_code(), 429);
    }

    #[tokio::test]
    async fn unidentified_requests_never_reach_engine() {
        let engine = engine();
        let layer = AdmissionLayer::new(engine.clone(), identify);
        let svc = layer.layer(service_fn(|_req: Request| async { Ok::<_, Infallible>(()) }));

        let err = svc.oneshot(Request { peer: None, path: "/a" }).await.unwrap_err();
        assert!(err.is_unidentified());
        assert_eq!(err.status_code(), 401);
        assert!(engine.registry().is_empty());
    }
}
